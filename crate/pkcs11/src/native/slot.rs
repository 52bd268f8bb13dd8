//! Thin translation of the uniform slot operations onto the PKCS#11 wrapper.

use std::{collections::HashMap, io::Write, num::NonZeroUsize, sync::Mutex};

use cryptoki::{
    mechanism::{
        rsa::{PkcsMgfType, PkcsPssParams},
        Mechanism, MechanismType,
    },
    object::{Attribute, AttributeType, KeyType, ObjectClass, ObjectHandle},
    types::Ulong,
};
use lru::LruCache;
use openssl::{
    bn::{BigNum, BigNumContext},
    ec::{EcGroup, EcKey, EcPoint},
    pkey::PKey,
    rsa::Rsa,
};
use tracing::debug;

use crate::{
    asn1, curves,
    conf::P11ModuleConf,
    error::{TokenError, TokenResult},
    key::P11Key,
    names,
    native::session_pool::{PooledSession, SessionPool},
    params::{ExtraParams, P11Params},
    slot::{KeyId, MechanismInfo, NewKeyControl, P11Slot, SlotCore, SlotId},
};

const HANDLES_CACHE_SIZE: usize = 100;

/// Extracts the raw numeric value of a `cryptoki` object handle.
///
/// `cryptoki::object::ObjectHandle` only exposes its inner value through
/// `Display`/`LowerHex`, so we round-trip through the decimal `Display`
/// representation rather than reaching into crate-private internals.
fn object_handle_value(handle: ObjectHandle) -> u64 {
    handle
        .to_string()
        .parse()
        .expect("ObjectHandle::Display always renders its inner integer")
}

/// Mechanism codes the wrapper can express, paired with the wrapper's type.
static MECHANISM_TYPES: &[(u64, MechanismType)] = &[
    (names::CKM_RSA_PKCS_KEY_PAIR_GEN, MechanismType::RSA_PKCS_KEY_PAIR_GEN),
    (names::CKM_RSA_PKCS, MechanismType::RSA_PKCS),
    (names::CKM_RSA_X_509, MechanismType::RSA_X_509),
    (names::CKM_RSA_PKCS_PSS, MechanismType::RSA_PKCS_PSS),
    (names::CKM_SHA1_RSA_PKCS, MechanismType::SHA1_RSA_PKCS),
    (names::CKM_SHA256_RSA_PKCS, MechanismType::SHA256_RSA_PKCS),
    (names::CKM_SHA384_RSA_PKCS, MechanismType::SHA384_RSA_PKCS),
    (names::CKM_SHA512_RSA_PKCS, MechanismType::SHA512_RSA_PKCS),
    (names::CKM_SHA1_RSA_PKCS_PSS, MechanismType::SHA1_RSA_PKCS_PSS),
    (names::CKM_SHA256_RSA_PKCS_PSS, MechanismType::SHA256_RSA_PKCS_PSS),
    (names::CKM_SHA384_RSA_PKCS_PSS, MechanismType::SHA384_RSA_PKCS_PSS),
    (names::CKM_SHA512_RSA_PKCS_PSS, MechanismType::SHA512_RSA_PKCS_PSS),
    (names::CKM_EC_KEY_PAIR_GEN, MechanismType::ECC_KEY_PAIR_GEN),
    (names::CKM_ECDSA, MechanismType::ECDSA),
    (names::CKM_ECDSA_SHA1, MechanismType::ECDSA_SHA1),
    (names::CKM_ECDSA_SHA256, MechanismType::ECDSA_SHA256),
    (names::CKM_ECDSA_SHA384, MechanismType::ECDSA_SHA384),
    (names::CKM_ECDSA_SHA512, MechanismType::ECDSA_SHA512),
    (names::CKM_AES_KEY_GEN, MechanismType::AES_KEY_GEN),
    (names::CKM_DES3_KEY_GEN, MechanismType::DES3_KEY_GEN),
    (names::CKM_GENERIC_SECRET_KEY_GEN, MechanismType::GENERIC_SECRET_KEY_GEN),
];

static KEY_TYPES: &[(u64, KeyType)] = &[
    (names::CKK_RSA, KeyType::RSA),
    (names::CKK_DSA, KeyType::DSA),
    (names::CKK_EC, KeyType::EC),
    (names::CKK_AES, KeyType::AES),
    (names::CKK_DES3, KeyType::DES3),
    (names::CKK_GENERIC_SECRET, KeyType::GENERIC_SECRET),
];

fn mechanism_code(mechanism_type: MechanismType) -> Option<u64> {
    MECHANISM_TYPES
        .iter()
        .find(|(_, t)| *t == mechanism_type)
        .map(|(code, _)| *code)
}

fn key_type_code(key_type: KeyType) -> u64 {
    KEY_TYPES
        .iter()
        .find(|(_, t)| *t == key_type)
        .map_or(names::CKK_GENERIC_SECRET, |(code, _)| *code)
}

fn to_key_type(code: u64) -> KeyType {
    KEY_TYPES
        .iter()
        .find(|(c, _)| *c == code)
        // the HMAC key types collapse onto generic secrets here
        .map_or(KeyType::GENERIC_SECRET, |(_, t)| *t)
}

fn wrap_err(e: cryptoki::error::Error) -> TokenError {
    TokenError::Default(format!("PKCS#11 error: {e}"))
}

fn ssl_err(e: openssl::error::ErrorStack) -> TokenError {
    TokenError::Default(e.to_string())
}

fn pss_params(
    mechanism: u64,
    params: Option<&P11Params>,
) -> TokenResult<PkcsPssParams> {
    let (hash, mgf, salt) = match params {
        Some(P11Params::RsaPkcsPss {
            hash_algorithm,
            mask_generation_function,
            salt_length,
        }) => (*hash_algorithm, *mask_generation_function, *salt_length),
        _ => {
            let hash_mech = match mechanism {
                names::CKM_SHA1_RSA_PKCS_PSS => names::CKM_SHA_1,
                names::CKM_SHA256_RSA_PKCS_PSS => names::CKM_SHA256,
                names::CKM_SHA384_RSA_PKCS_PSS => names::CKM_SHA384,
                names::CKM_SHA512_RSA_PKCS_PSS => names::CKM_SHA512,
                _ => {
                    return Err(TokenError::Default(format!(
                        "{} requires RSA-PSS parameters",
                        names::ckm_display(mechanism)
                    )))
                }
            };
            match P11Params::rsa_pkcs_pss(hash_mech) {
                Some(P11Params::RsaPkcsPss {
                    hash_algorithm,
                    mask_generation_function,
                    salt_length,
                }) => (hash_algorithm, mask_generation_function, salt_length),
                _ => unreachable!("defaults exist for every listed hash"),
            }
        }
    };

    let mgf = match mgf {
        names::CKG_MGF1_SHA1 => PkcsMgfType::MGF1_SHA1,
        names::CKG_MGF1_SHA224 => PkcsMgfType::MGF1_SHA224,
        names::CKG_MGF1_SHA256 => PkcsMgfType::MGF1_SHA256,
        names::CKG_MGF1_SHA384 => PkcsMgfType::MGF1_SHA384,
        names::CKG_MGF1_SHA512 => PkcsMgfType::MGF1_SHA512,
        other => {
            return Err(TokenError::Default(format!(
                "MGF 0x{other:X} is not supported by this backend"
            )))
        }
    };
    let hash_alg = MechanismType::try_from(hash)
        .map_err(|_| TokenError::Default(format!("unknown hash mechanism 0x{hash:X}")))?;
    Ok(PkcsPssParams {
        hash_alg,
        mgf,
        s_len: Ulong::from(salt),
    })
}

pub struct NativeP11Slot {
    core: SlotCore,
    sessions: SessionPool,
    max_message_size: usize,
    // raw handle -> wrapper handle, refreshed by re-finding on miss
    handles_cache: Mutex<LruCache<u64, ObjectHandle>>,
}

impl NativeP11Slot {
    pub(super) fn new(
        conf: &P11ModuleConf,
        slot_id: SlotId,
        sessions: SessionPool,
        supported: HashMap<u64, MechanismInfo>,
    ) -> TokenResult<Self> {
        let mut core = SlotCore::new(
            conf.name(),
            slot_id,
            conf.is_read_only(),
            conf.secret_key_types().map(<[u64]>::to_vec),
            conf.key_pair_types().map(<[u64]>::to_vec),
            conf.new_object_conf().clone(),
        );
        core.init_mechanisms(supported, conf.mechanism_filter());

        Ok(Self {
            core,
            sessions,
            max_message_size: conf.max_message_size(),
            handles_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(HANDLES_CACHE_SIZE).expect("cache size is non-zero"),
            )),
        })
    }

    fn session(&self) -> TokenResult<PooledSession<'_>> {
        self.sessions.borrow()
    }

    /// Maps a raw object handle back onto the wrapper's handle, re-finding
    /// the object when it is not cached.
    fn resolve_handle(&self, session: &PooledSession<'_>, raw: u64) -> TokenResult<ObjectHandle> {
        if let Some(handle) = self
            .handles_cache
            .lock()
            .expect("handles cache poisoned")
            .get(&raw)
        {
            return Ok(*handle);
        }
        for handle in session.find_objects(&[]).map_err(wrap_err)? {
            if object_handle_value(handle) == raw {
                self.remember_handle(handle);
                return Ok(handle);
            }
        }
        Err(TokenError::Default(format!("no object with handle {raw}")))
    }

    fn remember_handle(&self, handle: ObjectHandle) {
        self.handles_cache
            .lock()
            .expect("handles cache poisoned")
            .put(object_handle_value(handle), handle);
    }

    fn forget_handle(&self, handle: ObjectHandle) {
        self.handles_cache
            .lock()
            .expect("handles cache poisoned")
            .pop(&object_handle_value(handle));
    }

    fn id_label_template(
        class: ObjectClass,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> Vec<Attribute> {
        let mut template = vec![Attribute::Class(class)];
        if let Some(id) = id {
            template.push(Attribute::Id(id.to_vec()));
        }
        if let Some(label) = label {
            template.push(Attribute::Label(label.as_bytes().to_vec()));
        }
        template
    }

    fn find_one(
        &self,
        session: &PooledSession<'_>,
        template: &[Attribute],
    ) -> TokenResult<Option<ObjectHandle>> {
        let handles = session.find_objects(template).map_err(wrap_err)?;
        Ok(handles.first().copied())
    }

    fn attributes(
        &self,
        session: &PooledSession<'_>,
        handle: ObjectHandle,
        types: &[AttributeType],
    ) -> TokenResult<Vec<Attribute>> {
        session.get_attributes(handle, types).map_err(wrap_err)
    }

    fn byte_attr(attrs: &[Attribute], pick: fn(&Attribute) -> Option<&Vec<u8>>) -> Option<Vec<u8>> {
        attrs.iter().find_map(|a| pick(a).cloned())
    }

    fn key_id_of(
        &self,
        session: &PooledSession<'_>,
        handle: ObjectHandle,
        object_class: u64,
    ) -> TokenResult<KeyId> {
        let attrs = self.attributes(
            session,
            handle,
            &[AttributeType::Id, AttributeType::Label, AttributeType::KeyType],
        )?;
        let id = Self::byte_attr(&attrs, |a| match a {
            Attribute::Id(v) => Some(v),
            _ => None,
        })
        .unwrap_or_default();
        let label = attrs
            .iter()
            .find_map(|a| match a {
                Attribute::Label(v) => Some(String::from_utf8_lossy(v).into_owned()),
                _ => None,
            })
            .unwrap_or_default();
        let key_type = attrs
            .iter()
            .find_map(|a| match a {
                Attribute::KeyType(t) => Some(key_type_code(*t)),
                _ => None,
            })
            .unwrap_or(names::CKK_GENERIC_SECRET);

        self.remember_handle(handle);
        let mut key_id = KeyId::new(
            object_handle_value(handle),
            object_class,
            key_type,
            id.clone(),
            label,
        );
        if object_class == names::CKO_PRIVATE_KEY && !id.is_empty() {
            let template = Self::id_label_template(ObjectClass::PUBLIC_KEY, Some(&id), None);
            if let Some(public) = self.find_one(session, &template)? {
                self.remember_handle(public);
                key_id = key_id.with_public_key_handle(object_handle_value(public));
            }
        }
        Ok(key_id)
    }

    fn spki_of(
        &self,
        session: &PooledSession<'_>,
        handle: ObjectHandle,
    ) -> TokenResult<Vec<u8>> {
        let attrs = self.attributes(session, handle, &[AttributeType::KeyType])?;
        let key_type = attrs
            .iter()
            .find_map(|a| match a {
                Attribute::KeyType(t) => Some(*t),
                _ => None,
            })
            .ok_or_else(|| TokenError::Default("object carries no key type".to_string()))?;

        if key_type == KeyType::RSA {
            let attrs = self.attributes(
                session,
                handle,
                &[AttributeType::Modulus, AttributeType::PublicExponent],
            )?;
            let n = Self::byte_attr(&attrs, |a| match a {
                Attribute::Modulus(v) => Some(v),
                _ => None,
            })
            .ok_or_else(|| TokenError::Default("RSA key carries no modulus".to_string()))?;
            let e = Self::byte_attr(&attrs, |a| match a {
                Attribute::PublicExponent(v) => Some(v),
                _ => None,
            })
            .ok_or_else(|| {
                TokenError::Default("RSA key carries no public exponent".to_string())
            })?;
            let rsa = Rsa::from_public_components(
                BigNum::from_slice(&n).map_err(ssl_err)?,
                BigNum::from_slice(&e).map_err(ssl_err)?,
            )
            .map_err(ssl_err)?;
            return PKey::from_rsa(rsa)
                .map_err(ssl_err)?
                .public_key_to_der()
                .map_err(ssl_err);
        }

        if key_type == KeyType::EC {
            let attrs = self.attributes(
                session,
                handle,
                &[AttributeType::EcParams, AttributeType::EcPoint],
            )?;
            let ec_params = Self::byte_attr(&attrs, |a| match a {
                Attribute::EcParams(v) => Some(v),
                _ => None,
            })
            .ok_or_else(|| TokenError::Default("EC key carries no parameters".to_string()))?;
            let ec_point = Self::byte_attr(&attrs, |a| match a {
                Attribute::EcPoint(v) => Some(v),
                _ => None,
            })
            .ok_or_else(|| TokenError::Default("EC key carries no point".to_string()))?;

            let curve = curves::require_by_oid(&asn1::decode_oid(&ec_params)?)?;
            let group = EcGroup::from_curve_name(curve.nid).map_err(ssl_err)?;
            let point_bytes = asn1::unwrap_octet_string(&ec_point)?;
            let mut ctx = BigNumContext::new().map_err(ssl_err)?;
            let point = EcPoint::from_bytes(&group, &point_bytes, &mut ctx).map_err(ssl_err)?;
            let ec = EcKey::from_public_key(&group, &point).map_err(ssl_err)?;
            return PKey::from_ec_key(ec)
                .map_err(ssl_err)?
                .public_key_to_der()
                .map_err(ssl_err);
        }

        Err(TokenError::Default(format!(
            "cannot encode a public key of type {key_type:?}"
        )))
    }

    fn keypair_templates(
        control: &NewKeyControl,
        mut public_extra: Vec<Attribute>,
    ) -> (Vec<Attribute>, Vec<Attribute>) {
        let id = control.id.clone().unwrap_or_default();
        let label = control.label.as_bytes().to_vec();

        let mut public_template = vec![
            Attribute::Token(true),
            Attribute::Id(id.clone()),
            Attribute::Label(label.clone()),
            Attribute::Verify(true),
        ];
        public_template.append(&mut public_extra);

        let private_template = vec![
            Attribute::Token(true),
            Attribute::Id(id),
            Attribute::Label(label),
            Attribute::Private(true),
            Attribute::Sign(true),
            Attribute::Sensitive(control.sensitive.unwrap_or(true)),
            Attribute::Extractable(control.extractable.unwrap_or(false)),
        ];
        (public_template, private_template)
    }

    /// Generates a session-only keypair with a readable private part, reads
    /// the components back and destroys the objects again.
    fn generate_otf<T>(
        &self,
        mechanism: &Mechanism,
        public_extra: Vec<Attribute>,
        read: impl FnOnce(&Self, &PooledSession<'_>, ObjectHandle, ObjectHandle) -> TokenResult<T>,
    ) -> TokenResult<T> {
        let session = self.session()?;
        let public_template = {
            let mut t = vec![Attribute::Token(false), Attribute::Verify(true)];
            t.extend(public_extra);
            t
        };
        let private_template = vec![
            Attribute::Token(false),
            Attribute::Sign(true),
            Attribute::Sensitive(false),
            Attribute::Extractable(true),
        ];
        let (public, private) = session
            .generate_key_pair(mechanism, &public_template, &private_template)
            .map_err(wrap_err)?;

        let result = read(self, &session, public, private);

        for handle in [public, private] {
            if let Err(e) = session.destroy_object(handle) {
                debug!("could not destroy ephemeral object {handle:?}: {e}");
            }
        }
        result
    }
}

impl P11Slot for NativeP11Slot {
    fn core(&self) -> &SlotCore {
        &self.core
    }

    fn key(&self, key_id: &KeyId) -> TokenResult<Option<P11Key>> {
        let session = self.session()?;
        let raw = key_id.handle();
        let Ok(handle) = self.resolve_handle(&session, raw) else {
            return Ok(None);
        };

        if key_id.object_class() == names::CKO_SECRET_KEY {
            return Ok(Some(P11Key::secret(key_id.clone())));
        }

        let key = P11Key::private(key_id.clone());
        Ok(Some(match key_id.key_type() {
            names::CKK_RSA => {
                let attrs = self.attributes(
                    &session,
                    handle,
                    &[AttributeType::Modulus, AttributeType::PublicExponent],
                )?;
                let n = Self::byte_attr(&attrs, |a| match a {
                    Attribute::Modulus(v) => Some(v),
                    _ => None,
                })
                .unwrap_or_default();
                let e = Self::byte_attr(&attrs, |a| match a {
                    Attribute::PublicExponent(v) => Some(v),
                    _ => None,
                })
                .unwrap_or_default();
                key.with_rsa_params(n, e)
            }
            names::CKK_EC => {
                let attrs = self.attributes(&session, handle, &[AttributeType::EcParams])?;
                let ec_params = Self::byte_attr(&attrs, |a| match a {
                    Attribute::EcParams(v) => Some(v),
                    _ => None,
                })
                .unwrap_or_default();
                key.with_ec_params(asn1::decode_oid(&ec_params)?)
            }
            _ => key,
        }))
    }

    fn key_id_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> TokenResult<Option<KeyId>> {
        let id = id.filter(|id| !id.is_empty());
        let label = label.filter(|l| !l.is_empty());
        if id.is_none() && label.is_none() {
            return Ok(None);
        }

        let session = self.session()?;
        let template = Self::id_label_template(ObjectClass::PRIVATE_KEY, id, label);
        if let Some(handle) = self.find_one(&session, &template)? {
            return Ok(Some(self.key_id_of(&session, handle, names::CKO_PRIVATE_KEY)?));
        }
        let template = Self::id_label_template(ObjectClass::SECRET_KEY, id, label);
        if let Some(handle) = self.find_one(&session, &template)? {
            return Ok(Some(self.key_id_of(&session, handle, names::CKO_SECRET_KEY)?));
        }
        Ok(None)
    }

    fn object_exists_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> TokenResult<bool> {
        let id = id.filter(|id| !id.is_empty());
        let label = label.filter(|l| !l.is_empty());
        if id.is_none() && label.is_none() {
            return Err(TokenError::Default(
                "at least one of id and label must be present".to_string(),
            ));
        }

        let session = self.session()?;
        for class in [ObjectClass::PRIVATE_KEY, ObjectClass::SECRET_KEY] {
            let template = Self::id_label_template(class, id, label);
            if self.find_one(&session, &template)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn public_key(&self, handle: u64) -> TokenResult<Option<Vec<u8>>> {
        let session = self.session()?;
        let Ok(handle) = self.resolve_handle(&session, handle) else {
            return Ok(None);
        };
        self.spki_of(&session, handle).map(Some)
    }

    fn show_details(
        &self,
        out: &mut dyn Write,
        object_handle: Option<u64>,
        verbose: bool,
    ) -> std::io::Result<()> {
        if verbose {
            self.write_supported_mechanisms(out)?;
        }

        let session = self.session().map_err(io_err)?;
        match object_handle {
            Some(raw) => {
                writeln!(out, "\nDetails of object with handle {raw}")?;
                match self.resolve_handle(&session, raw) {
                    Ok(handle) => {
                        let attrs = self
                            .attributes(
                                &session,
                                handle,
                                &[
                                    AttributeType::Id,
                                    AttributeType::Label,
                                    AttributeType::KeyType,
                                ],
                            )
                            .map_err(io_err)?;
                        for attr in attrs {
                            match attr {
                                Attribute::Id(v) => {
                                    writeln!(out, "  id:      {}", hex::encode(v))?;
                                }
                                Attribute::Label(v) => {
                                    writeln!(out, "  label:   {}", String::from_utf8_lossy(&v))?;
                                }
                                Attribute::KeyType(t) => {
                                    writeln!(
                                        out,
                                        "  keytype: {}",
                                        names::ckk_display(key_type_code(t))
                                    )?;
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(_) => writeln!(out, "  error: invalid object handle")?,
                }
            }
            None => {
                writeln!(out, "\nList of objects:")?;
                let mut no = 0;
                for (class, code) in [
                    (ObjectClass::SECRET_KEY, names::CKO_SECRET_KEY),
                    (ObjectClass::PRIVATE_KEY, names::CKO_PRIVATE_KEY),
                    (ObjectClass::PUBLIC_KEY, names::CKO_PUBLIC_KEY),
                ] {
                    let handles = session
                        .find_objects(&[Attribute::Class(class)])
                        .map_err(|e| io_err(wrap_err(e)))?;
                    for handle in handles {
                        no += 1;
                        let key_id = self.key_id_of(&session, handle, code).map_err(io_err)?;
                        writeln!(out, "  {no:3}. {key_id}")?;
                    }
                }
            }
        }
        Ok(())
    }

    fn do_sign(
        &self,
        mechanism: u64,
        params: Option<&P11Params>,
        _extra_params: Option<&ExtraParams>,
        key_handle: u64,
        content: &[u8],
    ) -> TokenResult<Vec<u8>> {
        if content.len() > self.max_message_size {
            return Err(TokenError::Default(format!(
                "content of {} bytes exceeds maxMessageSize {}",
                content.len(),
                self.max_message_size
            )));
        }

        let session = self.session()?;
        let handle = self.resolve_handle(&session, key_handle)?;

        let wrapped = match mechanism {
            names::CKM_RSA_PKCS => Mechanism::RsaPkcs,
            names::CKM_RSA_X_509 => Mechanism::RsaX509,
            names::CKM_SHA1_RSA_PKCS => Mechanism::Sha1RsaPkcs,
            names::CKM_SHA256_RSA_PKCS => Mechanism::Sha256RsaPkcs,
            names::CKM_SHA384_RSA_PKCS => Mechanism::Sha384RsaPkcs,
            names::CKM_SHA512_RSA_PKCS => Mechanism::Sha512RsaPkcs,
            names::CKM_RSA_PKCS_PSS => Mechanism::RsaPkcsPss(pss_params(mechanism, params)?),
            names::CKM_SHA1_RSA_PKCS_PSS => {
                Mechanism::Sha1RsaPkcsPss(pss_params(mechanism, params)?)
            }
            names::CKM_SHA256_RSA_PKCS_PSS => {
                Mechanism::Sha256RsaPkcsPss(pss_params(mechanism, params)?)
            }
            names::CKM_SHA384_RSA_PKCS_PSS => {
                Mechanism::Sha384RsaPkcsPss(pss_params(mechanism, params)?)
            }
            names::CKM_SHA512_RSA_PKCS_PSS => {
                Mechanism::Sha512RsaPkcsPss(pss_params(mechanism, params)?)
            }
            names::CKM_ECDSA => Mechanism::Ecdsa,
            names::CKM_ECDSA_SHA1 => Mechanism::EcdsaSha1,
            names::CKM_ECDSA_SHA256 => Mechanism::EcdsaSha256,
            names::CKM_ECDSA_SHA384 => Mechanism::EcdsaSha384,
            names::CKM_ECDSA_SHA512 => Mechanism::EcdsaSha512,
            other => {
                return Err(TokenError::UnsupportedMechanism(format!(
                    "{} cannot be expressed by this backend",
                    names::ckm_display(other)
                )))
            }
        };

        session.sign(&wrapped, handle, content).map_err(wrap_err)
    }

    fn do_digest_secret_key(&self, _mechanism: u64, _key_handle: u64) -> TokenResult<Vec<u8>> {
        Err(TokenError::Unsupported(
            "digesting a secret key is not supported by this backend".to_string(),
        ))
    }

    fn do_destroy_all_objects(&self) -> TokenResult<usize> {
        let session = self.session()?;
        let handles = session.find_objects(&[]).map_err(wrap_err)?;
        let mut destroyed = 0;
        for handle in handles {
            if session.destroy_object(handle).is_ok() {
                self.forget_handle(handle);
                destroyed += 1;
            }
        }
        Ok(destroyed)
    }

    fn do_destroy_objects_by_handle(&self, handles: &[u64]) -> TokenResult<Vec<u64>> {
        let session = self.session()?;
        let mut failed = Vec::new();
        for &raw in handles {
            match self.resolve_handle(&session, raw) {
                Ok(handle) => {
                    if session.destroy_object(handle).is_ok() {
                        self.forget_handle(handle);
                    } else {
                        failed.push(raw);
                    }
                }
                Err(_) => failed.push(raw),
            }
        }
        Ok(failed)
    }

    fn do_destroy_objects_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> TokenResult<usize> {
        let session = self.session()?;
        let mut destroyed = 0;
        for class in [
            ObjectClass::PRIVATE_KEY,
            ObjectClass::PUBLIC_KEY,
            ObjectClass::SECRET_KEY,
        ] {
            let template = Self::id_label_template(class, id, label);
            for handle in session.find_objects(&template).map_err(wrap_err)? {
                if session.destroy_object(handle).is_ok() {
                    self.forget_handle(handle);
                    destroyed += 1;
                }
            }
        }
        Ok(destroyed)
    }

    fn do_generate_secret_key(
        &self,
        key_type: u64,
        key_size: Option<u32>,
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        let session = self.session()?;
        let mut template = vec![
            Attribute::Token(true),
            Attribute::Id(control.id.clone().unwrap_or_default()),
            Attribute::Label(control.label.as_bytes().to_vec()),
            Attribute::Private(true),
            Attribute::Sign(true),
            Attribute::Verify(true),
            Attribute::Sensitive(control.sensitive.unwrap_or(true)),
            Attribute::Extractable(control.extractable.unwrap_or(false)),
        ];
        if let Some(bits) = key_size {
            template.push(Attribute::ValueLen(Ulong::from(u64::from(bits / 8))));
        }

        let handle = match key_type {
            names::CKK_AES => session.generate_key(&Mechanism::AesKeyGen, &template),
            names::CKK_DES3 => session.generate_key(&Mechanism::Des3KeyGen, &template),
            _ => session.generate_key(&Mechanism::GenericSecretKeyGen, &template),
        }
        .map_err(wrap_err)?;

        self.key_id_of(&session, handle, names::CKO_SECRET_KEY)
    }

    fn do_import_secret_key(
        &self,
        key_type: u64,
        key_value: &[u8],
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        let session = self.session()?;
        let template = vec![
            Attribute::Class(ObjectClass::SECRET_KEY),
            Attribute::KeyType(to_key_type(key_type)),
            Attribute::Token(true),
            Attribute::Id(control.id.clone().unwrap_or_default()),
            Attribute::Label(control.label.as_bytes().to_vec()),
            Attribute::Private(true),
            Attribute::Sign(true),
            Attribute::Verify(true),
            Attribute::Sensitive(control.sensitive.unwrap_or(true)),
            Attribute::Extractable(control.extractable.unwrap_or(false)),
            Attribute::Value(key_value.to_vec()),
        ];
        let handle = session.create_object(&template).map_err(wrap_err)?;
        self.key_id_of(&session, handle, names::CKO_SECRET_KEY)
    }

    fn do_generate_rsa_keypair(
        &self,
        key_size: u32,
        public_exponent: &[u8],
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        let session = self.session()?;
        let (public_template, private_template) = Self::keypair_templates(
            control,
            vec![
                Attribute::ModulusBits(Ulong::from(u64::from(key_size))),
                Attribute::PublicExponent(public_exponent.to_vec()),
            ],
        );
        let (_, private) = session
            .generate_key_pair(
                &Mechanism::RsaPkcsKeyPairGen,
                &public_template,
                &private_template,
            )
            .map_err(wrap_err)?;
        self.key_id_of(&session, private, names::CKO_PRIVATE_KEY)
    }

    fn do_generate_rsa_keypair_otf(
        &self,
        key_size: u32,
        public_exponent: &[u8],
    ) -> TokenResult<Vec<u8>> {
        self.generate_otf(
            &Mechanism::RsaPkcsKeyPairGen,
            vec![
                Attribute::ModulusBits(Ulong::from(u64::from(key_size))),
                Attribute::PublicExponent(public_exponent.to_vec()),
            ],
            |slot, session, _public, private| {
                let attrs = slot.attributes(
                    session,
                    private,
                    &[
                        AttributeType::Modulus,
                        AttributeType::PublicExponent,
                        AttributeType::PrivateExponent,
                        AttributeType::Prime1,
                        AttributeType::Prime2,
                        AttributeType::Exponent1,
                        AttributeType::Exponent2,
                        AttributeType::Coefficient,
                    ],
                )?;
                let component = |pick: fn(&Attribute) -> Option<&Vec<u8>>| {
                    Self::byte_attr(&attrs, pick).ok_or_else(|| {
                        TokenError::Default(
                            "token does not expose the RSA private components".to_string(),
                        )
                    })
                };
                let bn = |bytes: Vec<u8>| BigNum::from_slice(&bytes).map_err(ssl_err);

                let rsa = Rsa::from_private_components(
                    bn(component(|a| match a {
                        Attribute::Modulus(v) => Some(v),
                        _ => None,
                    })?)?,
                    bn(component(|a| match a {
                        Attribute::PublicExponent(v) => Some(v),
                        _ => None,
                    })?)?,
                    bn(component(|a| match a {
                        Attribute::PrivateExponent(v) => Some(v),
                        _ => None,
                    })?)?,
                    bn(component(|a| match a {
                        Attribute::Prime1(v) => Some(v),
                        _ => None,
                    })?)?,
                    bn(component(|a| match a {
                        Attribute::Prime2(v) => Some(v),
                        _ => None,
                    })?)?,
                    bn(component(|a| match a {
                        Attribute::Exponent1(v) => Some(v),
                        _ => None,
                    })?)?,
                    bn(component(|a| match a {
                        Attribute::Exponent2(v) => Some(v),
                        _ => None,
                    })?)?,
                    bn(component(|a| match a {
                        Attribute::Coefficient(v) => Some(v),
                        _ => None,
                    })?)?,
                )
                .map_err(ssl_err)?;
                PKey::from_rsa(rsa)
                    .map_err(ssl_err)?
                    .private_key_to_pkcs8()
                    .map_err(ssl_err)
            },
        )
    }

    fn do_generate_dsa_keypair(
        &self,
        _p: &[u8],
        _q: &[u8],
        _g: &[u8],
        _control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        Err(TokenError::Unsupported(
            "DSA keypair generation is not supported by this backend".to_string(),
        ))
    }

    fn do_generate_dsa_keypair_otf(&self, _p: &[u8], _q: &[u8], _g: &[u8]) -> TokenResult<Vec<u8>> {
        Err(TokenError::Unsupported(
            "DSA keypair generation is not supported by this backend".to_string(),
        ))
    }

    fn do_generate_ec_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        let curve = curves::require_by_oid(curve_oid)?;
        let session = self.session()?;
        let (public_template, private_template) = Self::keypair_templates(
            control,
            vec![Attribute::EcParams(asn1::encode_oid(curve.oid)?)],
        );
        let (_, private) = session
            .generate_key_pair(
                &Mechanism::EccKeyPairGen,
                &public_template,
                &private_template,
            )
            .map_err(wrap_err)?;
        self.key_id_of(&session, private, names::CKO_PRIVATE_KEY)
    }

    fn do_generate_ec_keypair_otf(&self, curve_oid: &str) -> TokenResult<Vec<u8>> {
        let curve = curves::require_by_oid(curve_oid)?;
        let group = EcGroup::from_curve_name(curve.nid).map_err(ssl_err)?;
        self.generate_otf(
            &Mechanism::EccKeyPairGen,
            vec![Attribute::EcParams(asn1::encode_oid(curve.oid)?)],
            move |slot, session, public, private| {
                let priv_attrs = slot.attributes(session, private, &[AttributeType::Value])?;
                let d = Self::byte_attr(&priv_attrs, |a| match a {
                    Attribute::Value(v) => Some(v),
                    _ => None,
                })
                .ok_or_else(|| {
                    TokenError::Default(
                        "token does not expose the EC private value".to_string(),
                    )
                })?;
                let pub_attrs = slot.attributes(session, public, &[AttributeType::EcPoint])?;
                let point_der = Self::byte_attr(&pub_attrs, |a| match a {
                    Attribute::EcPoint(v) => Some(v),
                    _ => None,
                })
                .ok_or_else(|| TokenError::Default("EC key carries no point".to_string()))?;

                let mut ctx = BigNumContext::new().map_err(ssl_err)?;
                let point = EcPoint::from_bytes(
                    &group,
                    &asn1::unwrap_octet_string(&point_der)?,
                    &mut ctx,
                )
                .map_err(ssl_err)?;
                let d = BigNum::from_slice(&d).map_err(ssl_err)?;
                let ec = EcKey::from_private_components(&group, &d, &point).map_err(ssl_err)?;
                PKey::from_ec_key(ec)
                    .map_err(ssl_err)?
                    .private_key_to_pkcs8()
                    .map_err(ssl_err)
            },
        )
    }

    fn do_generate_edwards_keypair(
        &self,
        _curve_oid: &str,
        _control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        Err(TokenError::Unsupported(
            "Edwards keypair generation is not supported by this backend".to_string(),
        ))
    }

    fn do_generate_edwards_keypair_otf(&self, _curve_oid: &str) -> TokenResult<Vec<u8>> {
        Err(TokenError::Unsupported(
            "Edwards keypair generation is not supported by this backend".to_string(),
        ))
    }

    fn do_generate_montgomery_keypair(
        &self,
        _curve_oid: &str,
        _control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        Err(TokenError::Unsupported(
            "Montgomery keypair generation is not supported by this backend".to_string(),
        ))
    }

    fn do_generate_montgomery_keypair_otf(&self, _curve_oid: &str) -> TokenResult<Vec<u8>> {
        Err(TokenError::Unsupported(
            "Montgomery keypair generation is not supported by this backend".to_string(),
        ))
    }

    fn do_generate_sm2_keypair(&self, _control: &NewKeyControl) -> TokenResult<KeyId> {
        Err(TokenError::Unsupported(
            "SM2 keypair generation is not supported by this backend".to_string(),
        ))
    }

    fn do_generate_sm2_keypair_otf(&self) -> TokenResult<Vec<u8>> {
        Err(TokenError::Unsupported(
            "SM2 keypair generation is not supported by this backend".to_string(),
        ))
    }
}

pub(super) fn mechanism_codes(
    types: &[MechanismType],
) -> impl Iterator<Item = (u64, MechanismType)> + '_ {
    types
        .iter()
        .filter_map(|t| mechanism_code(*t).map(|code| (code, *t)))
}

fn io_err(e: TokenError) -> std::io::Error {
    std::io::Error::other(e.to_string())
}
