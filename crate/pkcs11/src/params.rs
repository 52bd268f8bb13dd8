//! Mechanism parameters passed alongside sign operations.

use serde::{Deserialize, Serialize};

use crate::names;

/// Parameters of a PKCS#11 mechanism. Serializable because the proxy client
/// ships them to the server verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum P11Params {
    ByteArray(Vec<u8>),
    RsaPkcsPss {
        hash_algorithm: u64,
        mask_generation_function: u64,
        salt_length: u64,
    },
}

impl P11Params {
    /// RSA-PSS parameters for the given hash mechanism, salt length = digest
    /// length, MGF1 over the same hash.
    pub fn rsa_pkcs_pss(hash_mechanism: u64) -> Option<Self> {
        let (mgf, salt_length) = match hash_mechanism {
            names::CKM_SHA_1 => (names::CKG_MGF1_SHA1, 20),
            names::CKM_SHA224 => (names::CKG_MGF1_SHA224, 28),
            names::CKM_SHA256 => (names::CKG_MGF1_SHA256, 32),
            names::CKM_SHA384 => (names::CKG_MGF1_SHA384, 48),
            names::CKM_SHA512 => (names::CKG_MGF1_SHA512, 64),
            names::CKM_SHA3_224 => (names::CKG_MGF1_SHA3_224, 28),
            names::CKM_SHA3_256 => (names::CKG_MGF1_SHA3_256, 32),
            names::CKM_SHA3_384 => (names::CKG_MGF1_SHA3_384, 48),
            names::CKM_SHA3_512 => (names::CKG_MGF1_SHA3_512, 64),
            _ => return None,
        };
        Some(Self::RsaPkcsPss {
            hash_algorithm: hash_mechanism,
            mask_generation_function: mgf,
            salt_length,
        })
    }
}

/// Extra hints some backends need beyond the mechanism parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraParams {
    /// Bit size of the EC group order, so ECDSA `r||s` halves can be sized
    /// without access to the curve.
    pub ec_order_bit_size: Option<u32>,
}
