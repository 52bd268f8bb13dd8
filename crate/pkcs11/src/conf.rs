//! Declarative module configuration and its validated form.
//!
//! A [`Pkcs11Conf`] is the raw serde model of the configuration file. It is
//! validated into immutable [`P11ModuleConf`] values at build time; everything
//! that can be rejected is rejected here, before any backend is touched.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use serde::Deserialize;
use tracing::warn;

use crate::{
    error::ConfError,
    names,
    password::{P11PasswordsRetriever, PasswordResolver},
    slot::SlotId,
};

pub const MODULE_TYPE_NATIVE: &str = "native";
pub const MODULE_TYPE_EMULATOR: &str = "emulator";
pub const MODULE_TYPE_HSMPROXY: &str = "hsmproxy";

const MIN_MAX_MESSAGE_SIZE: usize = 256;

fn default_max_message_size() -> usize {
    16384
}

fn default_user() -> String {
    "CKU_USER".to_string()
}

/// Raw configuration file model.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pkcs11Conf {
    pub modules: Vec<ModuleConfig>,
    #[serde(default)]
    pub mechanism_sets: Vec<MechanismSetConfig>,
}

impl Pkcs11Conf {
    pub fn from_json(json: &str) -> Result<Self, ConfError> {
        serde_json::from_str(json).map_err(|e| ConfError(format!("malformed configuration: {e}")))
    }

    pub fn from_reader(reader: impl std::io::Read) -> Result<Self, ConfError> {
        serde_json::from_reader(reader)
            .map_err(|e| ConfError(format!("malformed configuration: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub module_type: String,
    #[serde(default)]
    pub native_libraries: Vec<NativeLibraryConfig>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default)]
    pub num_sessions: Option<usize>,
    #[serde(default)]
    pub new_session_timeout: Option<u64>,
    #[serde(default)]
    pub secret_key_types: Option<Vec<String>>,
    #[serde(default)]
    pub key_pair_types: Option<Vec<String>>,
    #[serde(default)]
    pub include_slots: Vec<SlotConfig>,
    #[serde(default)]
    pub exclude_slots: Vec<SlotConfig>,
    #[serde(default)]
    pub mechanism_filters: Vec<MechanismFilterConfig>,
    #[serde(default)]
    pub password_sets: Vec<PasswordSetConfig>,
    #[serde(default)]
    pub new_object_conf: Option<NewObjectConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeLibraryConfig {
    pub path: String,
    #[serde(default)]
    pub operation_systems: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotConfig {
    #[serde(default)]
    pub index: Option<u32>,
    /// Slot id, decimal or `0x`-prefixed hexadecimal.
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MechanismSetConfig {
    pub name: String,
    #[serde(default)]
    pub mechanisms: Vec<String>,
    #[serde(default)]
    pub exclude_mechanisms: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MechanismFilterConfig {
    #[serde(default)]
    pub slots: Vec<SlotConfig>,
    pub mechanism_set: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordSetConfig {
    #[serde(default)]
    pub slots: Vec<SlotConfig>,
    pub passwords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewObjectConfig {
    #[serde(default)]
    pub id_length: Option<usize>,
    #[serde(default)]
    pub ignore_label: Option<bool>,
}

/// Matches a [`SlotId`] by index, by id, or by both.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct P11SlotIdFilter {
    index: Option<u32>,
    id: Option<u64>,
}

impl P11SlotIdFilter {
    pub fn new(index: Option<u32>, id: Option<u64>) -> Result<Self, ConfError> {
        if index.is_none() && id.is_none() {
            return Err(ConfError(
                "at least one of index and id must be present in a slot filter".to_string(),
            ));
        }
        Ok(Self { index, id })
    }

    pub fn matches(&self, slot_id: &SlotId) -> bool {
        if let Some(index) = self.index {
            if index != slot_id.index() {
                return false;
            }
        }
        if let Some(id) = self.id {
            return id == slot_id.id();
        }
        true
    }
}

/// Defaults applied to attributes of newly created objects.
#[derive(Debug, Clone)]
pub struct P11NewObjectConf {
    pub id_length: usize,
    pub ignore_label: bool,
}

impl Default for P11NewObjectConf {
    fn default() -> Self {
        Self {
            id_length: 8,
            ignore_label: false,
        }
    }
}

impl From<&NewObjectConfig> for P11NewObjectConf {
    fn from(conf: &NewObjectConfig) -> Self {
        Self {
            id_length: conf.id_length.unwrap_or(8),
            ignore_label: conf.ignore_label.unwrap_or(false),
        }
    }
}

#[derive(Debug)]
struct SingleMechanismFilter {
    slots: Option<Vec<P11SlotIdFilter>>,
    /// `None` means all mechanisms are included.
    include: Option<Vec<String>>,
    exclude: Vec<String>,
    /// Resolved codes per module identity. Entries may be attached to several
    /// modules; codes are resolved lazily the first time a module is seen.
    resolved: Mutex<HashMap<Option<String>, ResolvedCodes>>,
}

#[derive(Debug, Clone)]
struct ResolvedCodes {
    include: Option<HashSet<u64>>,
    exclude: HashSet<u64>,
}

impl SingleMechanismFilter {
    fn matches(&self, slot_id: &SlotId) -> bool {
        match &self.slots {
            None => true,
            Some(filters) => filters.iter().any(|f| f.matches(slot_id)),
        }
    }

    fn is_mechanism_supported(&self, mechanism: u64, module: Option<&str>) -> bool {
        if self.include.is_none() && self.exclude.is_empty() {
            return true;
        }

        let codes = {
            let mut resolved = self
                .resolved
                .lock()
                .expect("mechanism filter cache poisoned");
            resolved
                .entry(module.map(str::to_string))
                .or_insert_with(|| ResolvedCodes {
                    include: self.include.as_ref().map(|list| {
                        list.iter().filter_map(|n| names::ckm_code(n)).collect()
                    }),
                    exclude: self
                        .exclude
                        .iter()
                        .filter_map(|n| names::ckm_code(n))
                        .collect(),
                })
                .clone()
        };

        if codes.exclude.contains(&mechanism) {
            return false;
        }
        match &codes.include {
            None => true,
            Some(include) => include.contains(&mechanism),
        }
    }
}

/// Ordered per-slot mechanism policy. The first entry whose slot filter
/// matches decides; a mechanism with no matching entry is permitted.
#[derive(Debug, Default)]
pub struct P11MechanismFilter {
    filters: Vec<SingleMechanismFilter>,
}

impl P11MechanismFilter {
    fn add_entry(
        &mut self,
        slots: Option<Vec<P11SlotIdFilter>>,
        include: Option<Vec<String>>,
        exclude: Vec<String>,
    ) {
        self.filters.push(SingleMechanismFilter {
            slots,
            include,
            exclude,
            resolved: Mutex::new(HashMap::new()),
        });
    }

    pub fn is_permitted(&self, slot_id: &SlotId, mechanism: u64, module: Option<&str>) -> bool {
        for filter in &self.filters {
            if filter.matches(slot_id) {
                return filter.is_mechanism_supported(mechanism, module);
            }
        }
        true
    }
}

/// Validated, immutable configuration of one PKCS#11 module.
pub struct P11ModuleConf {
    name: String,
    module_type: String,
    native_library: String,
    read_only: bool,
    user_type: u64,
    user_name: Option<String>,
    max_message_size: usize,
    num_sessions: Option<usize>,
    new_session_timeout: Option<u64>,
    secret_key_types: Option<Vec<u64>>,
    key_pair_types: Option<Vec<u64>>,
    include_slots: Option<Vec<P11SlotIdFilter>>,
    exclude_slots: Option<Vec<P11SlotIdFilter>>,
    mechanism_filter: P11MechanismFilter,
    password_retriever: P11PasswordsRetriever,
    new_object_conf: P11NewObjectConf,
}

impl std::fmt::Debug for P11ModuleConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P11ModuleConf")
            .field("name", &self.name)
            .field("module_type", &self.module_type)
            .field("native_library", &self.native_library)
            .field("read_only", &self.read_only)
            .field("user_type", &self.user_type)
            .field("user_name", &self.user_name)
            .field("max_message_size", &self.max_message_size)
            .field("num_sessions", &self.num_sessions)
            .field("new_session_timeout", &self.new_session_timeout)
            .field("secret_key_types", &self.secret_key_types)
            .field("key_pair_types", &self.key_pair_types)
            .field("include_slots", &self.include_slots)
            .field("exclude_slots", &self.exclude_slots)
            .field("mechanism_filter", &self.mechanism_filter)
            .field("new_object_conf", &self.new_object_conf)
            .finish_non_exhaustive()
    }
}

impl P11ModuleConf {
    /// Validates `module` against the named `mechanism_sets` registry.
    pub fn new(
        module: &ModuleConfig,
        mechanism_sets: &[MechanismSetConfig],
        password_resolver: Option<Arc<dyn PasswordResolver>>,
    ) -> Result<Self, ConfError> {
        if module.max_message_size < MIN_MAX_MESSAGE_SIZE {
            return Err(ConfError(format!(
                "invalid maxMessageSize (< {MIN_MAX_MESSAGE_SIZE}): {}",
                module.max_message_size
            )));
        }

        let user = module.user.to_uppercase();
        let user_type = names::cku_code(&user)
            .ok_or_else(|| ConfError(format!("unknown user type {user}")))?;
        if user_type == names::CKU_SO {
            return Err(ConfError(
                "CKU_SO is not allowed as module user, too dangerous".to_string(),
            ));
        }

        let secret_key_types = module
            .secret_key_types
            .as_ref()
            .map(|list| parse_key_types(list));
        let key_pair_types = module
            .key_pair_types
            .as_ref()
            .map(|list| parse_key_types(list));

        // mechanism set registry
        struct MechanismSet {
            include: Option<Vec<String>>,
            exclude: Vec<String>,
        }
        let mut sets: HashMap<&str, MechanismSet> = HashMap::new();
        for set in mechanism_sets {
            if sets.contains_key(set.name.as_str()) {
                return Err(ConfError(format!(
                    "duplicate mechanismSet named {}",
                    set.name
                )));
            }
            let mut include = Some(Vec::new());
            for mechanism in &set.mechanisms {
                let mechanism = mechanism.trim().to_uppercase();
                if mechanism == "ALL" {
                    include = None; // accept all mechanisms
                    break;
                }
                if let Some(list) = include.as_mut() {
                    list.push(mechanism);
                }
            }
            let exclude = set
                .exclude_mechanisms
                .iter()
                .map(|m| m.trim().to_uppercase())
                .collect();
            sets.insert(set.name.as_str(), MechanismSet { include, exclude });
        }

        let mut mechanism_filter = P11MechanismFilter::default();
        for filter in &module.mechanism_filters {
            let slots = slot_id_filters(&filter.slots)?;
            let set = sets.get(filter.mechanism_set.as_str()).ok_or_else(|| {
                ConfError(format!(
                    "mechanismSet '{}' is not defined",
                    filter.mechanism_set
                ))
            })?;
            mechanism_filter.add_entry(slots, set.include.clone(), set.exclude.clone());
        }

        let mut password_retriever = P11PasswordsRetriever::default();
        if !module.password_sets.is_empty() {
            if let Some(resolver) = password_resolver {
                password_retriever.set_resolver(resolver);
            }
            for password_set in &module.password_sets {
                let slots = slot_id_filters(&password_set.slots)?;
                password_retriever.add_entry(slots, password_set.passwords.clone());
            }
        }

        let include_slots = slot_id_filters(&module.include_slots)?;
        let exclude_slots = slot_id_filters(&module.exclude_slots)?;

        // Pick the native library for the current OS: first entry whose OS
        // list contains the current OS name, or with an empty OS list.
        let os_name = std::env::consts::OS.to_lowercase();
        let mut native_library = None;
        for library in &module.native_libraries {
            if library.operation_systems.is_empty()
                || library
                    .operation_systems
                    .iter()
                    .any(|os| os_name.contains(&os.to_lowercase()))
            {
                native_library = Some(library.path.clone());
                break;
            }
        }
        // The emulator treats the library path as its base directory and may
        // omit it entirely.
        let native_library = match native_library {
            Some(path) => path,
            None if module.module_type != MODULE_TYPE_NATIVE => String::new(),
            None => {
                return Err(ConfError(format!(
                    "could not find PKCS#11 library for OS {os_name}"
                )))
            }
        };

        Ok(Self {
            name: module.name.clone(),
            module_type: module.module_type.clone(),
            native_library,
            read_only: module.readonly,
            user_type,
            user_name: module.user_name.clone(),
            max_message_size: module.max_message_size,
            num_sessions: module.num_sessions,
            new_session_timeout: module.new_session_timeout,
            secret_key_types,
            key_pair_types,
            include_slots,
            exclude_slots,
            mechanism_filter,
            password_retriever,
            new_object_conf: module
                .new_object_conf
                .as_ref()
                .map(P11NewObjectConf::from)
                .unwrap_or_default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_type(&self) -> &str {
        &self.module_type
    }

    pub fn native_library(&self) -> &str {
        &self.native_library
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn user_type(&self) -> u64 {
        self.user_type
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn num_sessions(&self) -> Option<usize> {
        self.num_sessions
    }

    pub fn new_session_timeout(&self) -> Option<u64> {
        self.new_session_timeout
    }

    pub fn secret_key_types(&self) -> Option<&[u64]> {
        self.secret_key_types.as_deref()
    }

    pub fn key_pair_types(&self) -> Option<&[u64]> {
        self.key_pair_types.as_deref()
    }

    pub fn mechanism_filter(&self) -> &P11MechanismFilter {
        &self.mechanism_filter
    }

    pub fn password_retriever(&self) -> &P11PasswordsRetriever {
        &self.password_retriever
    }

    pub fn new_object_conf(&self) -> &P11NewObjectConf {
        &self.new_object_conf
    }

    /// Does the include/exclude slot filtering admit `slot_id`?
    pub fn is_slot_included(&self, slot_id: &SlotId) -> bool {
        let included = match &self.include_slots {
            None => true,
            Some(filters) => filters.iter().any(|f| f.matches(slot_id)),
        };
        if !included {
            return false;
        }
        match &self.exclude_slots {
            None => true,
            Some(filters) => !filters.iter().any(|f| f.matches(slot_id)),
        }
    }
}

fn slot_id_filters(slots: &[SlotConfig]) -> Result<Option<Vec<P11SlotIdFilter>>, ConfError> {
    if slots.is_empty() {
        return Ok(None);
    }
    let mut filters = Vec::with_capacity(slots.len());
    for slot in slots {
        let id = match &slot.id {
            None => None,
            Some(s) => {
                let s = s.trim();
                let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
                {
                    u64::from_str_radix(hex, 16)
                } else {
                    s.parse::<u64>()
                };
                Some(parsed.map_err(|_| ConfError(format!("invalid slotId '{s}'")))?)
            }
        };
        filters.push(P11SlotIdFilter::new(slot.index, id)?);
    }
    Ok(Some(filters))
}

/// Parses `CKK_*` names and numeric key types; unparseable entries are
/// dropped with a warning.
fn parse_key_types(list: &[String]) -> Vec<u64> {
    let mut types = Vec::with_capacity(list.len());
    for entry in list {
        match parse_key_type(entry) {
            Some(code) => types.push(code),
            None => warn!("dropping unparseable key type '{entry}'"),
        }
    }
    types
}

fn parse_key_type(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.to_uppercase().starts_with("CKK_") {
        return names::ckk_code(s);
    }
    let (s, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    let s = s
        .strip_suffix("UL")
        .or_else(|| s.strip_suffix("ul"))
        .or_else(|| s.strip_suffix('L'))
        .or_else(|| s.strip_suffix('l'))
        .unwrap_or(s);
    u64::from_str_radix(s, radix).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::{CKK_AES, CKK_EC, CKK_RSA, CKM_RSA_X_509};

    fn module_json(extra: &str) -> String {
        format!(
            r#"{{
              "name": "test-module",
              "type": "emulator",
              "nativeLibraries": [{{ "path": "/tmp/p11" }}]{extra}
            }}"#
        )
    }

    fn parse_module(extra: &str) -> ModuleConfig {
        serde_json::from_str(&module_json(extra)).unwrap()
    }

    #[test]
    fn key_type_parsing() {
        assert_eq!(parse_key_type("CKK_AES"), Some(CKK_AES));
        assert_eq!(parse_key_type("ckk_rsa"), Some(CKK_RSA));
        assert_eq!(parse_key_type("0x03"), Some(CKK_EC));
        assert_eq!(parse_key_type("31L"), Some(31));
        assert_eq!(parse_key_type("0x1FUL"), Some(CKK_AES));
        assert_eq!(parse_key_type("CKK_NOPE"), None);
        assert_eq!(parse_key_type("zzz"), None);
    }

    #[test]
    fn rejects_small_max_message_size() {
        let mut module = parse_module("");
        module.max_message_size = 255;
        let err = P11ModuleConf::new(&module, &[], None).unwrap_err();
        assert!(err.to_string().contains("maxMessageSize"));
    }

    #[test]
    fn rejects_so_user() {
        let mut module = parse_module("");
        module.user = "cku_so".to_string();
        assert!(P11ModuleConf::new(&module, &[], None).is_err());
    }

    #[test]
    fn rejects_undefined_mechanism_set() {
        let module = parse_module(
            r#", "mechanismFilters": [{ "slots": [], "mechanismSet": "missing" }]"#,
        );
        let err = P11ModuleConf::new(&module, &[], None).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn mechanism_filter_first_match_decides() {
        let module = parse_module(
            r#", "mechanismFilters": [
                 { "slots": [{ "index": 0 }], "mechanismSet": "basic" }
               ]"#,
        );
        let sets = vec![MechanismSetConfig {
            name: "basic".to_string(),
            mechanisms: vec!["ALL".to_string()],
            exclude_mechanisms: vec!["CKM_RSA_X_509".to_string()],
        }];
        let conf = P11ModuleConf::new(&module, &sets, None).unwrap();

        let slot0 = SlotId::new(0, 800_000);
        let slot1 = SlotId::new(1, 800_001);
        let filter = conf.mechanism_filter();
        assert!(!filter.is_permitted(&slot0, CKM_RSA_X_509, Some("test-module")));
        // no entry matches slot 1, so everything is permitted there
        assert!(filter.is_permitted(&slot1, CKM_RSA_X_509, Some("test-module")));
    }

    #[test]
    fn include_exclude_slots() {
        let module = parse_module(
            r#", "includeSlots": [{ "index": 0 }, { "id": "0xC3502" }],
                "excludeSlots": [{ "index": 3 }]"#,
        );
        let conf = P11ModuleConf::new(&module, &[], None).unwrap();
        assert!(conf.is_slot_included(&SlotId::new(0, 1)));
        assert!(conf.is_slot_included(&SlotId::new(7, 800_002)));
        assert!(!conf.is_slot_included(&SlotId::new(2, 17)));
        assert!(!conf.is_slot_included(&SlotId::new(3, 800_002)));
    }

    #[test]
    fn malformed_slot_id_rejected() {
        let module = parse_module(r#", "includeSlots": [{ "id": "zz" }]"#);
        assert!(P11ModuleConf::new(&module, &[], None).is_err());
    }
}
