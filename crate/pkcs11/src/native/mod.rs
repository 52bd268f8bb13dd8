//! Backend speaking the PKCS#11 C ABI through a vendor library.

mod session_pool;
mod slot;

use std::{collections::HashMap, sync::Arc};

use cryptoki::{
    context::{CInitializeArgs, Pkcs11},
    error::{Error as CryptokiError, RvError},
    session::UserType,
    types::AuthPin,
};
pub use slot::NativeP11Slot;
use tracing::{info, warn};

use crate::{
    conf::P11ModuleConf,
    error::{TokenError, TokenResult},
    module::{ModuleSlots, P11Module},
    names,
    slot::{MechanismInfo, P11Slot, SlotId},
};

pub struct NativeP11Module {
    conf: P11ModuleConf,
    slots: ModuleSlots,
    description: String,
    // keeps the library and its login sessions alive until close
    _pkcs11: Arc<Pkcs11>,
}

impl NativeP11Module {
    pub fn new(conf: P11ModuleConf) -> TokenResult<Self> {
        let path = conf.native_library();
        let pkcs11 = Pkcs11::new(path).map_err(|e| {
            TokenError::Default(format!("could not load the PKCS#11 module {path}: {e}"))
        })?;

        match pkcs11.initialize(CInitializeArgs::OsThreads) {
            Ok(()) => {}
            Err(CryptokiError::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {
                info!("PKCS#11 module already initialized");
            }
            Err(e) => {
                return Err(TokenError::Default(format!(
                    "could not initialize the PKCS#11 module {path}: {e}"
                )))
            }
        }
        let pkcs11 = Arc::new(pkcs11);

        let description = match pkcs11.get_library_info() {
            Ok(info) => format!(
                "PKCS#11 wrapper\n\tPath: {path}\n\tManufacturerID: {}\n\tLibrary Description: \
                 {}\n\tLibrary Version: {}",
                info.manufacturer_id(),
                info.library_description(),
                info.library_version(),
            ),
            Err(_) => format!("PKCS#11 wrapper\n\tPath: {path}"),
        };
        info!("PKCS#11 module\n{description}");

        let user_type = match conf.user_type() {
            names::CKU_USER => UserType::User,
            names::CKU_CONTEXT_SPECIFIC => UserType::ContextSpecific,
            other => {
                return Err(TokenError::Default(format!(
                    "unsupported user type {other}"
                )))
            }
        };

        let all_slots = pkcs11
            .get_all_slots()
            .map_err(|e| TokenError::Default(format!("could not list slots: {e}")))?;
        if all_slots.is_empty() {
            return Err(TokenError::Default("no slot could be found".to_string()));
        }

        let mut slots: Vec<Arc<dyn P11Slot>> = Vec::new();
        for (index, raw_slot) in all_slots.into_iter().enumerate() {
            let slot_id = SlotId::new(index as u32, raw_slot.id());

            match pkcs11.get_slot_info(raw_slot) {
                Ok(slot_info) if slot_info.token_present() => {}
                Ok(_) => {
                    info!("ignore slot {slot_id} without token");
                    continue;
                }
                Err(e) => {
                    warn!("ignore slot {slot_id} with error: {e}");
                    continue;
                }
            }
            if !conf.is_slot_included(&slot_id) {
                info!("skipped slot {slot_id}");
                continue;
            }
            match pkcs11.get_token_info(raw_slot) {
                Ok(token_info) if token_info.token_initialized() => {}
                _ => {
                    info!("slot {slot_id} not initialized, skipped it");
                    continue;
                }
            }

            // log in once per token; pooled sessions inherit the login state
            let passwords = conf
                .password_retriever()
                .passwords(&slot_id)
                .map_err(TokenError::Password)?;
            let pin = passwords.as_ref().and_then(|pwds| pwds.first()).map(|p| {
                AuthPin::new(String::from_utf8_lossy(p).into_owned())
            });
            let login_session = pkcs11
                .open_rw_session(raw_slot)
                .map_err(|e| TokenError::Default(format!("could not open session: {e}")))?;
            match login_session.login(user_type, pin.as_ref()) {
                Ok(()) => {}
                Err(CryptokiError::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => {
                    warn!("user already logged in, continuing");
                }
                Err(e) => {
                    return Err(TokenError::Default(format!(
                        "could not log into slot {slot_id}: {e}"
                    )))
                }
            }
            // the logged-in session seeds the pool and keeps the login state
            // alive for the lifetime of the slot
            let pool = session_pool::SessionPool::new(
                pkcs11.clone(),
                raw_slot,
                !conf.is_read_only(),
                conf.num_sessions(),
                conf.new_session_timeout(),
                login_session,
            );

            let supported = Self::supported_mechanisms(&pkcs11, raw_slot);
            slots.push(Arc::new(slot::NativeP11Slot::new(
                &conf, slot_id, pool, supported,
            )?));
        }

        Ok(Self {
            conf,
            slots: ModuleSlots::new(slots),
            description,
            _pkcs11: pkcs11,
        })
    }

    fn supported_mechanisms(
        pkcs11: &Pkcs11,
        raw_slot: cryptoki::slot::Slot,
    ) -> HashMap<u64, MechanismInfo> {
        let Ok(types) = pkcs11.get_mechanism_list(raw_slot) else {
            warn!("could not list mechanisms of slot {}", raw_slot.id());
            return HashMap::new();
        };

        let mut supported = HashMap::new();
        for (code, mechanism_type) in slot::mechanism_codes(&types) {
            let Ok(info) = pkcs11.get_mechanism_info(raw_slot, mechanism_type) else {
                continue;
            };
            let mut flags = 0_u64;
            for (set, bit) in [
                (info.sign(), names::CKF_SIGN),
                (info.verify(), names::CKF_VERIFY),
                (info.digest(), names::CKF_DIGEST),
                (info.encrypt(), names::CKF_ENCRYPT),
                (info.decrypt(), names::CKF_DECRYPT),
                (info.generate(), names::CKF_GENERATE),
                (info.generate_key_pair(), names::CKF_GENERATE_KEY_PAIR),
            ] {
                if set {
                    flags |= bit;
                }
            }
            supported.insert(
                code,
                MechanismInfo::new(
                    info.min_key_size() as u64,
                    info.max_key_size() as u64,
                    flags,
                ),
            );
        }
        supported
    }
}

impl P11Module for NativeP11Module {
    fn conf(&self) -> &P11ModuleConf {
        &self.conf
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn slot_ids(&self) -> Vec<SlotId> {
        self.slots.slot_ids()
    }

    fn slot(&self, slot_id: &SlotId) -> TokenResult<Arc<dyn P11Slot>> {
        self.slots.slot(slot_id)
    }

    fn close(&self) {
        info!("close PKCS#11 module {}", self.conf.name());
        self.slots.close_all();
        // the library itself is finalized when the last Arc is dropped
    }
}
