//! Named-curve registry shared by the software and native backends.

use openssl::nid::Nid;

use crate::error::{TokenError, TokenResult};

pub struct NamedCurve {
    pub oid: &'static str,
    pub name: &'static str,
    pub nid: Nid,
}

static CURVES: &[NamedCurve] = &[
    NamedCurve {
        oid: "1.3.132.0.33",
        name: "secp224r1",
        nid: Nid::SECP224R1,
    },
    NamedCurve {
        oid: "1.2.840.10045.3.1.7",
        name: "prime256v1",
        nid: Nid::X9_62_PRIME256V1,
    },
    NamedCurve {
        oid: "1.3.132.0.34",
        name: "secp384r1",
        nid: Nid::SECP384R1,
    },
    NamedCurve {
        oid: "1.3.132.0.35",
        name: "secp521r1",
        nid: Nid::SECP521R1,
    },
    NamedCurve {
        oid: "1.3.132.0.10",
        name: "secp256k1",
        nid: Nid::SECP256K1,
    },
    NamedCurve {
        oid: "1.3.36.3.3.2.8.1.1.7",
        name: "brainpoolP256r1",
        nid: Nid::BRAINPOOL_P256R1,
    },
    NamedCurve {
        oid: "1.3.36.3.3.2.8.1.1.11",
        name: "brainpoolP384r1",
        nid: Nid::BRAINPOOL_P384R1,
    },
    NamedCurve {
        oid: "1.3.36.3.3.2.8.1.1.13",
        name: "brainpoolP512r1",
        nid: Nid::BRAINPOOL_P512R1,
    },
    NamedCurve {
        oid: crate::slot::SM2_OID,
        name: "sm2p256v1",
        nid: Nid::SM2,
    },
];

pub fn by_oid(oid: &str) -> Option<&'static NamedCurve> {
    CURVES.iter().find(|c| c.oid == oid)
}

pub fn by_name(name: &str) -> Option<&'static NamedCurve> {
    CURVES.iter().find(|c| c.name.eq_ignore_ascii_case(name))
}

pub fn by_nid(nid: Nid) -> Option<&'static NamedCurve> {
    CURVES.iter().find(|c| c.nid == nid)
}

pub fn require_by_oid(oid: &str) -> TokenResult<&'static NamedCurve> {
    by_oid(oid).ok_or_else(|| TokenError::Default(format!("unsupported EC curve {oid}")))
}
