//! Key handles and their public parameters.

use serde::{Deserialize, Serialize};

use crate::{names, slot::KeyId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaKeyParams {
    /// Big-endian modulus bytes.
    pub modulus: Vec<u8>,
    pub public_exponent: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsaKeyParams {
    pub p: Vec<u8>,
    pub q: Vec<u8>,
    pub g: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcKeyParams {
    /// Dotted-decimal curve OID.
    pub curve_oid: String,
}

/// A key acquired from a slot.
///
/// This is a handle plus public parameters only; private material stays in
/// the backend and is never attached here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct P11Key {
    key_id: KeyId,
    secret: bool,
    rsa: Option<RsaKeyParams>,
    dsa: Option<DsaKeyParams>,
    ec: Option<EcKeyParams>,
}

impl P11Key {
    pub fn private(key_id: KeyId) -> Self {
        Self {
            key_id,
            secret: false,
            rsa: None,
            dsa: None,
            ec: None,
        }
    }

    pub fn secret(key_id: KeyId) -> Self {
        Self {
            key_id,
            secret: true,
            rsa: None,
            dsa: None,
            ec: None,
        }
    }

    pub fn with_rsa_params(mut self, modulus: Vec<u8>, public_exponent: Vec<u8>) -> Self {
        self.rsa = Some(RsaKeyParams {
            modulus,
            public_exponent,
        });
        self
    }

    pub fn with_dsa_params(mut self, p: Vec<u8>, q: Vec<u8>, g: Vec<u8>) -> Self {
        self.dsa = Some(DsaKeyParams { p, q, g });
        self
    }

    pub fn with_ec_params(mut self, curve_oid: String) -> Self {
        self.ec = Some(EcKeyParams { curve_oid });
        self
    }

    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    /// Is this a secret-key engine (MAC/digest) rather than a private key?
    pub fn is_secret(&self) -> bool {
        self.secret
    }

    pub fn rsa_params(&self) -> Option<&RsaKeyParams> {
        self.rsa.as_ref()
    }

    pub fn dsa_params(&self) -> Option<&DsaKeyParams> {
        self.dsa.as_ref()
    }

    pub fn ec_params(&self) -> Option<&EcKeyParams> {
        self.ec.as_ref()
    }

    /// RSA modulus length in bytes, if this is an RSA key.
    pub fn rsa_modulus_len(&self) -> Option<usize> {
        self.rsa.as_ref().map(|p| p.modulus.len())
    }

    pub fn key_type_display(&self) -> String {
        names::ckk_display(self.key_id.key_type())
    }
}
