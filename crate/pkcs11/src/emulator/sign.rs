//! Software signing over decrypted key material.
//!
//! The decrypted key only ever lives inside these functions; callers hand in
//! the wrapped value and get signature bytes back.

use openssl::{
    bn::{BigNum, BigNumContext},
    dsa::DsaSig,
    ecdsa::EcdsaSig,
    hash::{hash, MessageDigest},
    md::{Md, MdRef},
    pkey::{Id, PKey, Private},
    pkey_ctx::PkeyCtx,
    rsa::Padding,
    sign::Signer,
};

use crate::{
    error::{TokenError, TokenResult},
    names::{self, ckm_display},
    params::{ExtraParams, P11Params},
};

/// Message digest for a digest mechanism (`CKM_SHA256`, ...).
pub(crate) fn digest_for_mechanism(mechanism: u64) -> Option<MessageDigest> {
    Some(match mechanism {
        names::CKM_SHA_1 => MessageDigest::sha1(),
        names::CKM_SHA224 => MessageDigest::sha224(),
        names::CKM_SHA256 => MessageDigest::sha256(),
        names::CKM_SHA384 => MessageDigest::sha384(),
        names::CKM_SHA512 => MessageDigest::sha512(),
        names::CKM_SHA3_224 => MessageDigest::sha3_224(),
        names::CKM_SHA3_256 => MessageDigest::sha3_256(),
        names::CKM_SHA3_384 => MessageDigest::sha3_384(),
        names::CKM_SHA3_512 => MessageDigest::sha3_512(),
        _ => return None,
    })
}

fn md_for_mechanism(mechanism: u64) -> TokenResult<&'static MdRef> {
    Ok(match mechanism {
        names::CKM_SHA_1 => Md::sha1(),
        names::CKM_SHA224 => Md::sha224(),
        names::CKM_SHA256 => Md::sha256(),
        names::CKM_SHA384 => Md::sha384(),
        names::CKM_SHA512 => Md::sha512(),
        names::CKM_SHA3_224 => Md::sha3_224(),
        names::CKM_SHA3_256 => Md::sha3_256(),
        names::CKM_SHA3_384 => Md::sha3_384(),
        names::CKM_SHA3_512 => Md::sha3_512(),
        _ => {
            return Err(TokenError::Default(format!(
                "no digest for mechanism {}",
                ckm_display(mechanism)
            )))
        }
    })
}

fn md_for_mgf(mgf: u64) -> TokenResult<&'static MdRef> {
    Ok(match mgf {
        names::CKG_MGF1_SHA1 => Md::sha1(),
        names::CKG_MGF1_SHA224 => Md::sha224(),
        names::CKG_MGF1_SHA256 => Md::sha256(),
        names::CKG_MGF1_SHA384 => Md::sha384(),
        names::CKG_MGF1_SHA512 => Md::sha512(),
        names::CKG_MGF1_SHA3_224 => Md::sha3_224(),
        names::CKG_MGF1_SHA3_256 => Md::sha3_256(),
        names::CKG_MGF1_SHA3_384 => Md::sha3_384(),
        names::CKG_MGF1_SHA3_512 => Md::sha3_512(),
        _ => Err(TokenError::Default(format!("unknown MGF 0x{mgf:X}")))?,
    })
}

/// Hash mechanism paired with an HMAC signing mechanism.
fn hmac_digest(mechanism: u64) -> Option<MessageDigest> {
    Some(match mechanism {
        names::CKM_SHA_1_HMAC => MessageDigest::sha1(),
        names::CKM_SHA224_HMAC => MessageDigest::sha224(),
        names::CKM_SHA256_HMAC => MessageDigest::sha256(),
        names::CKM_SHA384_HMAC => MessageDigest::sha384(),
        names::CKM_SHA512_HMAC => MessageDigest::sha512(),
        names::CKM_SHA3_224_HMAC => MessageDigest::sha3_224(),
        names::CKM_SHA3_256_HMAC => MessageDigest::sha3_256(),
        names::CKM_SHA3_384_HMAC => MessageDigest::sha3_384(),
        names::CKM_SHA3_512_HMAC => MessageDigest::sha3_512(),
        _ => return None,
    })
}

fn err(e: openssl::error::ErrorStack) -> TokenError {
    TokenError::Default(format!("signing failed: {e}"))
}

/// Signs with a stored secret key (HMAC family).
pub(crate) fn sign_with_secret_key(
    mechanism: u64,
    key_value: &[u8],
    content: &[u8],
) -> TokenResult<Vec<u8>> {
    let Some(md) = hmac_digest(mechanism) else {
        return Err(TokenError::UnsupportedMechanism(format!(
            "{} with a secret key",
            ckm_display(mechanism)
        )));
    };
    let pkey = PKey::hmac(key_value).map_err(err)?;
    let mut signer = Signer::new(md, &pkey).map_err(err)?;
    signer.sign_oneshot_to_vec(content).map_err(err)
}

/// Signs with a stored private key, dispatching on the mechanism family.
pub(crate) fn sign_with_private_key(
    mechanism: u64,
    key: &PKey<Private>,
    params: Option<&P11Params>,
    extra_params: Option<&ExtraParams>,
    content: &[u8],
) -> TokenResult<Vec<u8>> {
    match mechanism {
        names::CKM_RSA_PKCS => rsa_pkcs_raw(key, content),
        names::CKM_RSA_X_509 => rsa_x509_raw(key, content),
        names::CKM_SHA1_RSA_PKCS
        | names::CKM_SHA224_RSA_PKCS
        | names::CKM_SHA256_RSA_PKCS
        | names::CKM_SHA384_RSA_PKCS
        | names::CKM_SHA512_RSA_PKCS
        | names::CKM_SHA3_224_RSA_PKCS
        | names::CKM_SHA3_256_RSA_PKCS
        | names::CKM_SHA3_384_RSA_PKCS
        | names::CKM_SHA3_512_RSA_PKCS => {
            assert_key_id(key, Id::RSA, mechanism)?;
            let md = rsa_pkcs_hash_digest(mechanism)?;
            let mut signer = Signer::new(md, key).map_err(err)?;
            signer.sign_oneshot_to_vec(content).map_err(err)
        }
        names::CKM_RSA_PKCS_PSS => {
            let (hash_mech, mgf, salt) = pss_params(mechanism, params)?;
            rsa_pss_prehashed(key, hash_mech, mgf, salt, content)
        }
        names::CKM_SHA1_RSA_PKCS_PSS
        | names::CKM_SHA224_RSA_PKCS_PSS
        | names::CKM_SHA256_RSA_PKCS_PSS
        | names::CKM_SHA384_RSA_PKCS_PSS
        | names::CKM_SHA512_RSA_PKCS_PSS
        | names::CKM_SHA3_224_RSA_PKCS_PSS
        | names::CKM_SHA3_256_RSA_PKCS_PSS
        | names::CKM_SHA3_384_RSA_PKCS_PSS
        | names::CKM_SHA3_512_RSA_PKCS_PSS => {
            let (hash_mech, mgf, salt) = pss_params(mechanism, params)?;
            let md = digest_for_mechanism(hash_mech).ok_or_else(|| {
                TokenError::Default(format!("no digest for {}", ckm_display(hash_mech)))
            })?;
            let hashed = hash(md, content).map_err(err)?;
            rsa_pss_prehashed(key, hash_mech, mgf, salt, &hashed)
        }
        names::CKM_ECDSA => ecdsa_prehashed(key, extra_params, content),
        names::CKM_ECDSA_SHA1
        | names::CKM_ECDSA_SHA224
        | names::CKM_ECDSA_SHA256
        | names::CKM_ECDSA_SHA384
        | names::CKM_ECDSA_SHA512
        | names::CKM_ECDSA_SHA3_224
        | names::CKM_ECDSA_SHA3_256
        | names::CKM_ECDSA_SHA3_384
        | names::CKM_ECDSA_SHA3_512 => {
            let md = ecdsa_hash_digest(mechanism)?;
            let hashed = hash(md, content).map_err(err)?;
            ecdsa_prehashed(key, extra_params, &hashed)
        }
        names::CKM_DSA => dsa_prehashed(key, content),
        names::CKM_DSA_SHA1
        | names::CKM_DSA_SHA224
        | names::CKM_DSA_SHA256
        | names::CKM_DSA_SHA384
        | names::CKM_DSA_SHA512
        | names::CKM_DSA_SHA3_224
        | names::CKM_DSA_SHA3_256
        | names::CKM_DSA_SHA3_384
        | names::CKM_DSA_SHA3_512 => {
            let md = dsa_hash_digest(mechanism)?;
            let hashed = hash(md, content).map_err(err)?;
            dsa_prehashed(key, &hashed)
        }
        names::CKM_EDDSA => {
            assert_key_id_any(key, &[Id::ED25519, Id::ED448], mechanism)?;
            let mut signer = Signer::new_without_digest(key).map_err(err)?;
            signer.sign_oneshot_to_vec(content).map_err(err)
        }
        _ => Err(TokenError::UnsupportedMechanism(format!(
            "{} with a private key",
            ckm_display(mechanism)
        ))),
    }
}

fn assert_key_id(key: &PKey<Private>, id: Id, mechanism: u64) -> TokenResult<()> {
    assert_key_id_any(key, &[id], mechanism)
}

fn assert_key_id_any(key: &PKey<Private>, ids: &[Id], mechanism: u64) -> TokenResult<()> {
    if ids.contains(&key.id()) {
        Ok(())
    } else {
        Err(TokenError::UnsupportedMechanism(format!(
            "{} with a {:?} key",
            ckm_display(mechanism),
            key.id()
        )))
    }
}

fn rsa_pkcs_hash_digest(mechanism: u64) -> TokenResult<MessageDigest> {
    let hash_mech = match mechanism {
        names::CKM_SHA1_RSA_PKCS => names::CKM_SHA_1,
        names::CKM_SHA224_RSA_PKCS => names::CKM_SHA224,
        names::CKM_SHA256_RSA_PKCS => names::CKM_SHA256,
        names::CKM_SHA384_RSA_PKCS => names::CKM_SHA384,
        names::CKM_SHA512_RSA_PKCS => names::CKM_SHA512,
        names::CKM_SHA3_224_RSA_PKCS => names::CKM_SHA3_224,
        names::CKM_SHA3_256_RSA_PKCS => names::CKM_SHA3_256,
        names::CKM_SHA3_384_RSA_PKCS => names::CKM_SHA3_384,
        names::CKM_SHA3_512_RSA_PKCS => names::CKM_SHA3_512,
        _ => unreachable!("checked by caller"),
    };
    digest_for_mechanism(hash_mech)
        .ok_or_else(|| TokenError::Default(format!("no digest for {}", ckm_display(hash_mech))))
}

fn ecdsa_hash_digest(mechanism: u64) -> TokenResult<MessageDigest> {
    let hash_mech = match mechanism {
        names::CKM_ECDSA_SHA1 => names::CKM_SHA_1,
        names::CKM_ECDSA_SHA224 => names::CKM_SHA224,
        names::CKM_ECDSA_SHA256 => names::CKM_SHA256,
        names::CKM_ECDSA_SHA384 => names::CKM_SHA384,
        names::CKM_ECDSA_SHA512 => names::CKM_SHA512,
        names::CKM_ECDSA_SHA3_224 => names::CKM_SHA3_224,
        names::CKM_ECDSA_SHA3_256 => names::CKM_SHA3_256,
        names::CKM_ECDSA_SHA3_384 => names::CKM_SHA3_384,
        names::CKM_ECDSA_SHA3_512 => names::CKM_SHA3_512,
        _ => unreachable!("checked by caller"),
    };
    digest_for_mechanism(hash_mech)
        .ok_or_else(|| TokenError::Default(format!("no digest for {}", ckm_display(hash_mech))))
}

fn dsa_hash_digest(mechanism: u64) -> TokenResult<MessageDigest> {
    let hash_mech = match mechanism {
        names::CKM_DSA_SHA1 => names::CKM_SHA_1,
        names::CKM_DSA_SHA224 => names::CKM_SHA224,
        names::CKM_DSA_SHA256 => names::CKM_SHA256,
        names::CKM_DSA_SHA384 => names::CKM_SHA384,
        names::CKM_DSA_SHA512 => names::CKM_SHA512,
        names::CKM_DSA_SHA3_224 => names::CKM_SHA3_224,
        names::CKM_DSA_SHA3_256 => names::CKM_SHA3_256,
        names::CKM_DSA_SHA3_384 => names::CKM_SHA3_384,
        names::CKM_DSA_SHA3_512 => names::CKM_SHA3_512,
        _ => unreachable!("checked by caller"),
    };
    digest_for_mechanism(hash_mech)
        .ok_or_else(|| TokenError::Default(format!("no digest for {}", ckm_display(hash_mech))))
}

/// Hash mechanism of the PSS defaults for a `CKM_SHAxxx_RSA_PKCS_PSS`
/// mechanism; explicit [`P11Params`] take precedence.
fn pss_params(mechanism: u64, params: Option<&P11Params>) -> TokenResult<(u64, u64, u64)> {
    if let Some(P11Params::RsaPkcsPss {
        hash_algorithm,
        mask_generation_function,
        salt_length,
    }) = params
    {
        return Ok((*hash_algorithm, *mask_generation_function, *salt_length));
    }

    let hash_mech = match mechanism {
        names::CKM_SHA1_RSA_PKCS_PSS => names::CKM_SHA_1,
        names::CKM_SHA224_RSA_PKCS_PSS => names::CKM_SHA224,
        names::CKM_SHA256_RSA_PKCS_PSS => names::CKM_SHA256,
        names::CKM_SHA384_RSA_PKCS_PSS => names::CKM_SHA384,
        names::CKM_SHA512_RSA_PKCS_PSS => names::CKM_SHA512,
        names::CKM_SHA3_224_RSA_PKCS_PSS => names::CKM_SHA3_224,
        names::CKM_SHA3_256_RSA_PKCS_PSS => names::CKM_SHA3_256,
        names::CKM_SHA3_384_RSA_PKCS_PSS => names::CKM_SHA3_384,
        names::CKM_SHA3_512_RSA_PKCS_PSS => names::CKM_SHA3_512,
        _ => {
            return Err(TokenError::Default(format!(
                "{} requires RSA-PSS parameters",
                ckm_display(mechanism)
            )))
        }
    };
    match P11Params::rsa_pkcs_pss(hash_mech) {
        Some(P11Params::RsaPkcsPss {
            hash_algorithm,
            mask_generation_function,
            salt_length,
        }) => Ok((hash_algorithm, mask_generation_function, salt_length)),
        _ => Err(TokenError::Default(format!(
            "no PSS defaults for {}",
            ckm_display(hash_mech)
        ))),
    }
}

fn rsa_pkcs_raw(key: &PKey<Private>, content: &[u8]) -> TokenResult<Vec<u8>> {
    let rsa = key
        .rsa()
        .map_err(|_| TokenError::UnsupportedMechanism("CKM_RSA_PKCS with a non-RSA key".into()))?;
    let mut signature = vec![0_u8; rsa.size() as usize];
    let len = rsa
        .private_encrypt(content, &mut signature, Padding::PKCS1)
        .map_err(err)?;
    signature.truncate(len);
    Ok(signature)
}

fn rsa_x509_raw(key: &PKey<Private>, content: &[u8]) -> TokenResult<Vec<u8>> {
    let rsa = key
        .rsa()
        .map_err(|_| TokenError::UnsupportedMechanism("CKM_RSA_X_509 with a non-RSA key".into()))?;
    let size = rsa.size() as usize;
    if content.len() > size {
        return Err(TokenError::Default(format!(
            "content of {} bytes exceeds the modulus size {size}",
            content.len()
        )));
    }
    // raw RSA operates on a full block, pad on the left
    let mut block = vec![0_u8; size];
    block[size - content.len()..].copy_from_slice(content);
    let mut signature = vec![0_u8; size];
    let len = rsa
        .private_encrypt(&block, &mut signature, Padding::NONE)
        .map_err(err)?;
    signature.truncate(len);
    Ok(signature)
}

fn rsa_pss_prehashed(
    key: &PKey<Private>,
    hash_mechanism: u64,
    mgf: u64,
    salt_length: u64,
    hashed: &[u8],
) -> TokenResult<Vec<u8>> {
    let mut ctx = PkeyCtx::new(key).map_err(err)?;
    ctx.sign_init().map_err(err)?;
    ctx.set_rsa_padding(Padding::PKCS1_PSS).map_err(err)?;
    ctx.set_signature_md(md_for_mechanism(hash_mechanism)?)
        .map_err(err)?;
    ctx.set_rsa_mgf1_md(md_for_mgf(mgf)?).map_err(err)?;
    ctx.set_rsa_pss_saltlen(openssl::sign::RsaPssSaltlen::custom(salt_length as i32))
        .map_err(err)?;
    let mut signature = Vec::new();
    ctx.sign_to_vec(hashed, &mut signature).map_err(err)?;
    Ok(signature)
}

fn ecdsa_prehashed(
    key: &PKey<Private>,
    extra_params: Option<&ExtraParams>,
    hashed: &[u8],
) -> TokenResult<Vec<u8>> {
    let ec = key
        .ec_key()
        .map_err(|_| TokenError::UnsupportedMechanism("CKM_ECDSA with a non-EC key".into()))?;

    let order_len = match extra_params.and_then(|p| p.ec_order_bit_size) {
        Some(bits) => (bits as usize).div_ceil(8),
        None => {
            let mut order = BigNum::new().map_err(err)?;
            let mut ctx = BigNumContext::new().map_err(err)?;
            ec.group().order(&mut order, &mut ctx).map_err(err)?;
            (order.num_bits() as usize).div_ceil(8)
        }
    };

    let sig = EcdsaSig::sign(hashed, &ec).map_err(err)?;
    // PKCS#11 wants the raw r||s concatenation
    let mut out = sig.r().to_vec_padded(order_len as i32).map_err(err)?;
    out.extend_from_slice(&sig.s().to_vec_padded(order_len as i32).map_err(err)?);
    Ok(out)
}

fn dsa_prehashed(key: &PKey<Private>, hashed: &[u8]) -> TokenResult<Vec<u8>> {
    let dsa = key
        .dsa()
        .map_err(|_| TokenError::UnsupportedMechanism("CKM_DSA with a non-DSA key".into()))?;
    let q_len = dsa.q().num_bytes() as usize;

    let mut ctx = PkeyCtx::new(key).map_err(err)?;
    ctx.sign_init().map_err(err)?;
    let mut der = Vec::new();
    ctx.sign_to_vec(hashed, &mut der).map_err(err)?;

    let sig = DsaSig::from_der(&der).map_err(err)?;
    let mut out = sig.r().to_vec_padded(q_len as i32).map_err(err)?;
    out.extend_from_slice(&sig.s().to_vec_padded(q_len as i32).map_err(err)?);
    Ok(out)
}
