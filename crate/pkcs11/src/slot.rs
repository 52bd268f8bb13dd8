//! The uniform slot contract shared by all backends.
//!
//! [`P11Slot`] enumerates the operations of a slot; its provided methods
//! carry the policies that hold for every backend (mechanism assertion,
//! read-only enforcement, key-type allow-lists, id/label uniqueness) and
//! dispatch to the `do_*` primitives the backends implement.

use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    io::Write,
    sync::{Mutex, MutexGuard},
};

use rand::{rngs::OsRng, TryRngCore};
use serde::{Deserialize, Serialize};

use crate::{
    conf::{P11MechanismFilter, P11NewObjectConf},
    error::{TokenError, TokenResult},
    key::P11Key,
    names::{self, CKF_DIGEST, CKF_GENERATE, CKF_GENERATE_KEY_PAIR, CKF_SIGN},
    params::{ExtraParams, P11Params},
};

pub const ED25519_OID: &str = "1.3.101.112";
pub const ED448_OID: &str = "1.3.101.113";
pub const X25519_OID: &str = "1.3.101.110";
pub const X448_OID: &str = "1.3.101.111";
pub const SM2_OID: &str = "1.2.156.10197.1.301";

pub fn is_edwards_curve(curve_oid: &str) -> bool {
    curve_oid == ED25519_OID || curve_oid == ED448_OID
}

pub fn is_montgomery_curve(curve_oid: &str) -> bool {
    curve_oid == X25519_OID || curve_oid == X448_OID
}

/// Identifier of a slot within a module: position in the enumeration order
/// plus the backend-assigned 64-bit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId {
    index: u32,
    id: u64,
}

impl SlotId {
    pub fn new(index: u32, id: u64) -> Self {
        Self { index, id }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(index={}, id={})", self.index, self.id)
    }
}

/// The 31-multiplier rolling hash over the object id bytes.
///
/// Emulator object handles are derived from it, so it must never change:
/// handles have to be stable across restarts.
pub fn stable_hash32(id: &[u8]) -> u32 {
    let mut h: i32 = 1;
    for &b in id {
        h = h.wrapping_mul(31).wrapping_add(i32::from(b as i8));
    }
    h as u32
}

/// Identifier of a key object within a slot.
///
/// Equality is on (class, id, label) when the id is set, otherwise on
/// (class, label).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyId {
    handle: u64,
    object_class: u64,
    key_type: u64,
    id: Vec<u8>,
    label: String,
    public_key_handle: Option<u64>,
}

impl KeyId {
    pub fn new(
        handle: u64,
        object_class: u64,
        key_type: u64,
        id: Vec<u8>,
        label: String,
    ) -> Self {
        Self {
            handle,
            object_class,
            key_type,
            id,
            label,
            public_key_handle: None,
        }
    }

    pub fn with_public_key_handle(mut self, handle: u64) -> Self {
        self.public_key_handle = Some(handle);
        self
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn object_class(&self) -> u64 {
        self.object_class
    }

    pub fn key_type(&self) -> u64 {
        self.key_type
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn public_key_handle(&self) -> Option<u64> {
        self.public_key_handle
    }
}

impl PartialEq for KeyId {
    fn eq(&self, other: &Self) -> bool {
        if self.object_class != other.object_class {
            return false;
        }
        if self.id.is_empty() && other.id.is_empty() {
            self.label == other.label
        } else {
            self.id == other.id && self.label == other.label
        }
    }
}

impl Eq for KeyId {}

impl Hash for KeyId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.object_class.hash(state);
        self.label.hash(state);
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(handle={}, class={}, id={}, label={})",
            self.handle,
            names::cko_name(self.object_class).unwrap_or("CKO_?"),
            hex::encode(&self.id),
            self.label
        )
    }
}

/// Capabilities of one mechanism as advertised by a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MechanismInfo {
    pub min_key_size: u64,
    pub max_key_size: u64,
    pub flags: u64,
}

impl MechanismInfo {
    pub fn new(min_key_size: u64, max_key_size: u64, flags: u64) -> Self {
        Self {
            min_key_size,
            max_key_size,
            flags,
        }
    }
}

/// The caller's request for attributes of a to-be-created object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewKeyControl {
    pub id: Option<Vec<u8>>,
    pub label: String,
    pub extractable: Option<bool>,
    pub sensitive: Option<bool>,
}

impl NewKeyControl {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: Vec<u8>) -> Self {
        self.id = Some(id);
        self
    }
}

/// State shared by every slot implementation.
pub struct SlotCore {
    module_name: String,
    slot_id: SlotId,
    read_only: bool,
    new_object_conf: P11NewObjectConf,
    secret_key_types: Option<Vec<u64>>,
    key_pair_types: Option<Vec<u64>>,
    mechanisms: HashMap<u64, MechanismInfo>,
    // serializes create/destroy so id/label uniqueness holds per slot
    object_lock: Mutex<()>,
}

impl SlotCore {
    pub fn new(
        module_name: impl Into<String>,
        slot_id: SlotId,
        read_only: bool,
        secret_key_types: Option<Vec<u64>>,
        key_pair_types: Option<Vec<u64>>,
        new_object_conf: P11NewObjectConf,
    ) -> Self {
        Self {
            module_name: module_name.into(),
            slot_id,
            read_only,
            new_object_conf,
            secret_key_types,
            key_pair_types,
            mechanisms: HashMap::new(),
            object_lock: Mutex::new(()),
        }
    }

    /// Installs the mechanisms the token advertises, filtered by the module's
    /// mechanism policy.
    pub fn init_mechanisms(
        &mut self,
        supported: HashMap<u64, MechanismInfo>,
        filter: &P11MechanismFilter,
    ) {
        let module_name = self.module_name.clone();
        self.mechanisms = supported
            .into_iter()
            .filter(|(code, _)| filter.is_permitted(&self.slot_id, *code, Some(&module_name)))
            .collect();
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn slot_id(&self) -> &SlotId {
        &self.slot_id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn new_object_conf(&self) -> &P11NewObjectConf {
        &self.new_object_conf
    }

    pub fn mechanisms(&self) -> &HashMap<u64, MechanismInfo> {
        &self.mechanisms
    }

    pub fn lock_objects(&self) -> MutexGuard<'_, ()> {
        self.object_lock.lock().expect("slot object lock poisoned")
    }
}

fn secret_key_gen_mechanism(key_type: u64) -> TokenResult<u64> {
    Ok(match key_type {
        names::CKK_AES => names::CKM_AES_KEY_GEN,
        names::CKK_DES3 => names::CKM_DES3_KEY_GEN,
        names::CKK_GENERIC_SECRET
        | names::CKK_SHA_1_HMAC
        | names::CKK_SHA224_HMAC
        | names::CKK_SHA256_HMAC
        | names::CKK_SHA384_HMAC
        | names::CKK_SHA512_HMAC
        | names::CKK_SHA3_224_HMAC
        | names::CKK_SHA3_256_HMAC
        | names::CKK_SHA3_384_HMAC
        | names::CKK_SHA3_512_HMAC => names::CKM_GENERIC_SECRET_KEY_GEN,
        _ => {
            return Err(TokenError::Default(format!(
                "unsupported secret key type {}",
                names::ckk_display(key_type)
            )))
        }
    })
}

/// A slot of a PKCS#11 module.
///
/// Backends implement the `do_*` primitives plus the lookup operations; the
/// provided methods are the uniform surface callers use.
pub trait P11Slot: Send + Sync {
    fn core(&self) -> &SlotCore;

    // ------------------------------------------------------------------
    // lookup
    // ------------------------------------------------------------------

    /// Returns the key for the given `key_id`, or `None` if absent.
    fn key(&self, key_id: &KeyId) -> TokenResult<Option<P11Key>>;

    /// Resolves the canonical [`KeyId`] for an id and/or label; `None` when
    /// both are absent or nothing matches.
    fn key_id_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> TokenResult<Option<KeyId>>;

    fn object_exists_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> TokenResult<bool>;

    /// DER-encoded SubjectPublicKeyInfo of the public key with `handle`.
    fn public_key(&self, handle: u64) -> TokenResult<Option<Vec<u8>>>;

    fn show_details(
        &self,
        out: &mut dyn Write,
        object_handle: Option<u64>,
        verbose: bool,
    ) -> std::io::Result<()>;

    fn close(&self) {}

    // ------------------------------------------------------------------
    // backend primitives
    // ------------------------------------------------------------------

    fn do_sign(
        &self,
        mechanism: u64,
        params: Option<&P11Params>,
        extra_params: Option<&ExtraParams>,
        key_handle: u64,
        content: &[u8],
    ) -> TokenResult<Vec<u8>>;

    fn do_digest_secret_key(&self, mechanism: u64, key_handle: u64) -> TokenResult<Vec<u8>>;

    fn do_destroy_all_objects(&self) -> TokenResult<usize>;

    /// Returns the handles that could not be destroyed.
    fn do_destroy_objects_by_handle(&self, handles: &[u64]) -> TokenResult<Vec<u64>>;

    fn do_destroy_objects_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> TokenResult<usize>;

    fn do_generate_secret_key(
        &self,
        key_type: u64,
        key_size: Option<u32>,
        control: &NewKeyControl,
    ) -> TokenResult<KeyId>;

    fn do_import_secret_key(
        &self,
        key_type: u64,
        key_value: &[u8],
        control: &NewKeyControl,
    ) -> TokenResult<KeyId>;

    fn do_generate_rsa_keypair(
        &self,
        key_size: u32,
        public_exponent: &[u8],
        control: &NewKeyControl,
    ) -> TokenResult<KeyId>;

    fn do_generate_rsa_keypair_otf(
        &self,
        key_size: u32,
        public_exponent: &[u8],
    ) -> TokenResult<Vec<u8>>;

    fn do_generate_dsa_keypair(
        &self,
        p: &[u8],
        q: &[u8],
        g: &[u8],
        control: &NewKeyControl,
    ) -> TokenResult<KeyId>;

    fn do_generate_dsa_keypair_otf(&self, p: &[u8], q: &[u8], g: &[u8]) -> TokenResult<Vec<u8>>;

    fn do_generate_ec_keypair(&self, curve_oid: &str, control: &NewKeyControl)
        -> TokenResult<KeyId>;

    fn do_generate_ec_keypair_otf(&self, curve_oid: &str) -> TokenResult<Vec<u8>>;

    fn do_generate_edwards_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> TokenResult<KeyId>;

    fn do_generate_edwards_keypair_otf(&self, curve_oid: &str) -> TokenResult<Vec<u8>>;

    fn do_generate_montgomery_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> TokenResult<KeyId>;

    fn do_generate_montgomery_keypair_otf(&self, curve_oid: &str) -> TokenResult<Vec<u8>>;

    fn do_generate_sm2_keypair(&self, control: &NewKeyControl) -> TokenResult<KeyId>;

    fn do_generate_sm2_keypair_otf(&self) -> TokenResult<Vec<u8>>;

    // ------------------------------------------------------------------
    // assertions shared by all backends
    // ------------------------------------------------------------------

    fn slot_id(&self) -> &SlotId {
        self.core().slot_id()
    }

    fn supports_mechanism(&self, mechanism: u64, flag: u64) -> bool {
        self.core()
            .mechanisms()
            .get(&mechanism)
            .is_some_and(|info| flag == 0 || info.flags & flag != 0)
    }

    fn assert_mechanism_supported(&self, mechanism: u64, flag: u64) -> TokenResult<()> {
        if self.supports_mechanism(mechanism, flag) {
            Ok(())
        } else {
            Err(TokenError::UnsupportedMechanism(names::ckm_display(
                mechanism,
            )))
        }
    }

    fn assert_any_mechanism_supported(&self, mechanisms: &[u64], flag: u64) -> TokenResult<()> {
        if mechanisms.iter().any(|m| self.supports_mechanism(*m, flag)) {
            Ok(())
        } else {
            Err(TokenError::UnsupportedMechanism(
                mechanisms
                    .iter()
                    .map(|m| names::ckm_display(*m))
                    .collect::<Vec<_>>()
                    .join(", "),
            ))
        }
    }

    fn assert_writable(&self, operation: &str) -> TokenResult<()> {
        if self.core().is_read_only() {
            Err(TokenError::ReadOnly(operation.to_string()))
        } else {
            Ok(())
        }
    }

    fn assert_secret_key_type_allowed(&self, key_type: u64) -> TokenResult<()> {
        match &self.core().secret_key_types {
            Some(allowed) if !allowed.contains(&key_type) => Err(TokenError::Default(format!(
                "secret key type {} is not allowed by the module configuration",
                names::ckk_display(key_type)
            ))),
            _ => Ok(()),
        }
    }

    fn assert_keypair_type_allowed(&self, key_type: u64) -> TokenResult<()> {
        match &self.core().key_pair_types {
            Some(allowed) if !allowed.contains(&key_type) => Err(TokenError::Default(format!(
                "keypair type {} is not allowed by the module configuration",
                names::ckk_display(key_type)
            ))),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // uniform operations
    // ------------------------------------------------------------------

    fn key_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> TokenResult<Option<P11Key>> {
        match self.key_id_by_id_label(id, label)? {
            Some(key_id) => self.key(&key_id),
            None => Ok(None),
        }
    }

    fn sign(
        &self,
        mechanism: u64,
        params: Option<&P11Params>,
        extra_params: Option<&ExtraParams>,
        key_handle: u64,
        content: &[u8],
    ) -> TokenResult<Vec<u8>> {
        self.assert_mechanism_supported(mechanism, CKF_SIGN)?;
        self.do_sign(mechanism, params, extra_params, key_handle, content)
    }

    fn digest_secret_key(&self, mechanism: u64, key_handle: u64) -> TokenResult<Vec<u8>> {
        self.assert_mechanism_supported(mechanism, CKF_DIGEST)?;
        self.do_digest_secret_key(mechanism, key_handle)
    }

    fn destroy_all_objects(&self) -> TokenResult<usize> {
        self.assert_writable("destroy_all_objects")?;
        let _guard = self.core().lock_objects();
        self.do_destroy_all_objects()
    }

    fn destroy_objects_by_handle(&self, handles: &[u64]) -> TokenResult<Vec<u64>> {
        self.assert_writable("destroy_objects_by_handle")?;
        let _guard = self.core().lock_objects();
        self.do_destroy_objects_by_handle(handles)
    }

    fn destroy_objects_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> TokenResult<usize> {
        if id.is_none_or(|id| id.is_empty()) && label.is_none_or(str::is_empty) {
            return Err(TokenError::Default(
                "at least one of id and label must be present".to_string(),
            ));
        }
        self.assert_writable("destroy_objects_by_id_label")?;
        let _guard = self.core().lock_objects();
        self.do_destroy_objects_by_id_label(id, label)
    }

    fn generate_secret_key(
        &self,
        key_type: u64,
        key_size: Option<u32>,
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        self.assert_writable("generate_secret_key")?;
        self.assert_secret_key_type_allowed(key_type)?;
        self.assert_mechanism_supported(secret_key_gen_mechanism(key_type)?, CKF_GENERATE)?;
        let _guard = self.core().lock_objects();
        let control = self.fill_control(control)?;
        self.do_generate_secret_key(key_type, key_size, &control)
    }

    fn import_secret_key(
        &self,
        key_type: u64,
        key_value: &[u8],
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        self.assert_writable("import_secret_key")?;
        self.assert_secret_key_type_allowed(key_type)?;
        let _guard = self.core().lock_objects();
        let control = self.fill_control(control)?;
        self.do_import_secret_key(key_type, key_value, &control)
    }

    fn generate_rsa_keypair(
        &self,
        key_size: u32,
        public_exponent: &[u8],
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        self.assert_writable("generate_rsa_keypair")?;
        self.assert_keypair_type_allowed(names::CKK_RSA)?;
        self.assert_any_mechanism_supported(
            &[
                names::CKM_RSA_PKCS_KEY_PAIR_GEN,
                names::CKM_RSA_X9_31_KEY_PAIR_GEN,
            ],
            CKF_GENERATE_KEY_PAIR,
        )?;
        let _guard = self.core().lock_objects();
        let control = self.fill_control(control)?;
        self.do_generate_rsa_keypair(key_size, public_exponent, &control)
    }

    fn generate_rsa_keypair_otf(
        &self,
        key_size: u32,
        public_exponent: &[u8],
    ) -> TokenResult<Vec<u8>> {
        self.assert_any_mechanism_supported(
            &[
                names::CKM_RSA_PKCS_KEY_PAIR_GEN,
                names::CKM_RSA_X9_31_KEY_PAIR_GEN,
            ],
            CKF_GENERATE_KEY_PAIR,
        )?;
        self.do_generate_rsa_keypair_otf(key_size, public_exponent)
    }

    /// Generates the DSA domain parameters for the requested sizes, then the
    /// keypair over them.
    fn generate_dsa_keypair_by_size(
        &self,
        p_bits: u32,
        q_bits: u32,
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        let (p, q, g) = generate_dsa_parameters(p_bits, q_bits)?;
        self.generate_dsa_keypair(&p, &q, &g, control)
    }

    fn generate_dsa_keypair(
        &self,
        p: &[u8],
        q: &[u8],
        g: &[u8],
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        self.assert_writable("generate_dsa_keypair")?;
        self.assert_keypair_type_allowed(names::CKK_DSA)?;
        self.assert_mechanism_supported(names::CKM_DSA_KEY_PAIR_GEN, CKF_GENERATE_KEY_PAIR)?;
        let _guard = self.core().lock_objects();
        let control = self.fill_control(control)?;
        self.do_generate_dsa_keypair(p, q, g, &control)
    }

    fn generate_dsa_keypair_otf(&self, p: &[u8], q: &[u8], g: &[u8]) -> TokenResult<Vec<u8>> {
        self.assert_mechanism_supported(names::CKM_DSA_KEY_PAIR_GEN, CKF_GENERATE_KEY_PAIR)?;
        self.do_generate_dsa_keypair_otf(p, q, g)
    }

    fn generate_ec_keypair(&self, curve_oid: &str, control: &NewKeyControl) -> TokenResult<KeyId> {
        self.assert_writable("generate_ec_keypair")?;
        let _guard = self.core().lock_objects();
        if is_edwards_curve(curve_oid) {
            self.assert_keypair_type_allowed(names::CKK_EC_EDWARDS)?;
            self.assert_mechanism_supported(
                names::CKM_EC_EDWARDS_KEY_PAIR_GEN,
                CKF_GENERATE_KEY_PAIR,
            )?;
            let control = self.fill_control(control)?;
            self.do_generate_edwards_keypair(curve_oid, &control)
        } else if is_montgomery_curve(curve_oid) {
            self.assert_keypair_type_allowed(names::CKK_EC_MONTGOMERY)?;
            self.assert_mechanism_supported(
                names::CKM_EC_MONTGOMERY_KEY_PAIR_GEN,
                CKF_GENERATE_KEY_PAIR,
            )?;
            let control = self.fill_control(control)?;
            self.do_generate_montgomery_keypair(curve_oid, &control)
        } else {
            self.assert_keypair_type_allowed(names::CKK_EC)?;
            self.assert_mechanism_supported(names::CKM_EC_KEY_PAIR_GEN, CKF_GENERATE_KEY_PAIR)?;
            let control = self.fill_control(control)?;
            self.do_generate_ec_keypair(curve_oid, &control)
        }
    }

    fn generate_ec_keypair_otf(&self, curve_oid: &str) -> TokenResult<Vec<u8>> {
        if is_edwards_curve(curve_oid) {
            self.assert_mechanism_supported(
                names::CKM_EC_EDWARDS_KEY_PAIR_GEN,
                CKF_GENERATE_KEY_PAIR,
            )?;
            self.do_generate_edwards_keypair_otf(curve_oid)
        } else if is_montgomery_curve(curve_oid) {
            self.assert_mechanism_supported(
                names::CKM_EC_MONTGOMERY_KEY_PAIR_GEN,
                CKF_GENERATE_KEY_PAIR,
            )?;
            self.do_generate_montgomery_keypair_otf(curve_oid)
        } else {
            self.assert_mechanism_supported(names::CKM_EC_KEY_PAIR_GEN, CKF_GENERATE_KEY_PAIR)?;
            self.do_generate_ec_keypair_otf(curve_oid)
        }
    }

    fn generate_edwards_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        if !is_edwards_curve(curve_oid) {
            return Err(TokenError::Default(format!(
                "unknown Edwards curve {curve_oid}"
            )));
        }
        self.generate_ec_keypair(curve_oid, control)
    }

    fn generate_montgomery_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> TokenResult<KeyId> {
        if !is_montgomery_curve(curve_oid) {
            return Err(TokenError::Default(format!(
                "unknown Montgomery curve {curve_oid}"
            )));
        }
        self.generate_ec_keypair(curve_oid, control)
    }

    fn generate_sm2_keypair(&self, control: &NewKeyControl) -> TokenResult<KeyId> {
        self.assert_writable("generate_sm2_keypair")?;
        self.assert_keypair_type_allowed(names::CKK_VENDOR_SM2)?;
        self.assert_mechanism_supported(
            names::CKM_VENDOR_SM2_KEY_PAIR_GEN,
            CKF_GENERATE_KEY_PAIR,
        )?;
        let _guard = self.core().lock_objects();
        let control = self.fill_control(control)?;
        self.do_generate_sm2_keypair(&control)
    }

    fn generate_sm2_keypair_otf(&self) -> TokenResult<Vec<u8>> {
        self.assert_mechanism_supported(
            names::CKM_VENDOR_SM2_KEY_PAIR_GEN,
            CKF_GENERATE_KEY_PAIR,
        )?;
        self.do_generate_sm2_keypair_otf()
    }

    // ------------------------------------------------------------------
    // id / label management
    // ------------------------------------------------------------------

    /// Completes a [`NewKeyControl`]: draws a fresh random id when absent,
    /// rejects a caller-supplied duplicate id, and uniquifies the label
    /// unless the backend ignores labels.
    fn fill_control(&self, control: &NewKeyControl) -> TokenResult<NewKeyControl> {
        let mut control = control.clone();
        match &control.id {
            None => control.id = Some(self.generate_id()?),
            Some(id) => {
                if self.object_exists_by_id_label(Some(id), None)? {
                    return Err(TokenError::Default(format!(
                        "duplicate id {}",
                        hex::encode(id)
                    )));
                }
            }
        }
        if !self.core().new_object_conf().ignore_label && !control.label.is_empty() {
            control.label = self.generate_label(&control.label)?;
        }
        Ok(control)
    }

    fn generate_id(&self) -> TokenResult<Vec<u8>> {
        let id_length = self.core().new_object_conf().id_length;
        loop {
            let mut id = vec![0_u8; id_length];
            OsRng
                .try_fill_bytes(&mut id)
                .map_err(|e| TokenError::Default(format!("error generating random id: {e}")))?;
            if !self.object_exists_by_id_label(Some(&id), None)? {
                return Ok(id);
            }
        }
    }

    fn generate_label(&self, label: &str) -> TokenResult<String> {
        let mut candidate = label.to_string();
        let mut idx = 0;
        while self.object_exists_by_id_label(None, Some(&candidate))? {
            idx += 1;
            candidate = format!("{label}-{idx}");
        }
        Ok(candidate)
    }

    /// Writes the sorted list of mechanisms this slot advertises.
    fn write_supported_mechanisms(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let mut codes: Vec<u64> = self.core().mechanisms().keys().copied().collect();
        codes.sort_unstable();
        writeln!(out, "Supported mechanisms ({}):", codes.len())?;
        for code in codes {
            writeln!(out, "  {}", names::ckm_display(code))?;
        }
        Ok(())
    }
}

/// Generates DSA domain parameters of the requested prime size in software.
pub(crate) fn generate_dsa_parameters(
    p_bits: u32,
    _q_bits: u32,
) -> TokenResult<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let dsa = openssl::dsa::Dsa::generate(p_bits)
        .map_err(|e| TokenError::Default(format!("could not generate DSA parameters: {e}")))?;
    Ok((
        dsa.p().to_vec(),
        dsa.q().to_vec(),
        dsa.g().to_vec(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::{CKO_PRIVATE_KEY, CKO_SECRET_KEY};

    #[test]
    fn hash_is_stable() {
        // the handle scheme must never change across releases
        assert_eq!(stable_hash32(&[1, 2, 3, 4]), 955_331);
        assert_eq!(stable_hash32(&[]), 1);
        assert_eq!(stable_hash32(&[0xFF]), 31 - 1);
    }

    #[test]
    fn key_id_equality_with_id() {
        let a = KeyId::new(1, CKO_PRIVATE_KEY, 0, vec![1, 2], "k".to_string());
        let b = KeyId::new(99, CKO_PRIVATE_KEY, 3, vec![1, 2], "k".to_string());
        let c = KeyId::new(1, CKO_PRIVATE_KEY, 0, vec![1, 3], "k".to_string());
        let d = KeyId::new(1, CKO_SECRET_KEY, 0, vec![1, 2], "k".to_string());
        assert_eq!(a, b); // handle and key type do not participate
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn key_id_equality_label_only() {
        let a = KeyId::new(1, CKO_SECRET_KEY, 0, vec![], "mac".to_string());
        let b = KeyId::new(2, CKO_SECRET_KEY, 0, vec![], "mac".to_string());
        let c = KeyId::new(2, CKO_SECRET_KEY, 0, vec![], "other".to_string());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn edwards_and_montgomery_detection() {
        assert!(is_edwards_curve(ED25519_OID));
        assert!(is_edwards_curve(ED448_OID));
        assert!(!is_edwards_curve(X25519_OID));
        assert!(is_montgomery_curve(X448_OID));
        assert!(!is_montgomery_curve(SM2_OID));
    }
}
