//! A fully software PKCS#11 module storing keys as encrypted files on disk.
//!
//! The base directory holds one `<index>-<id>` subdirectory per slot; the
//! layout inside a slot directory is the contract of the on-disk key store.

mod cryptor;
mod sign;
mod slot;

use std::{fs, path::PathBuf, sync::Arc};

pub use cryptor::KeyCryptor;
pub use slot::EmulatorP11Slot;
use tracing::{error, info, warn};

use crate::{
    conf::P11ModuleConf,
    error::{TokenError, TokenResult},
    module::{ModuleSlots, P11Module},
    slot::{P11Slot, SlotId},
};

const DFLT_BASEDIR_NAME: &str = "pkcs11-emulator";
const DFLT_NUM_SLOTS: u32 = 2;
const FIRST_SLOT_ID: u64 = 800_000;

pub struct EmulatorP11Module {
    conf: P11ModuleConf,
    slots: ModuleSlots,
    description: String,
}

impl EmulatorP11Module {
    pub fn new(conf: P11ModuleConf) -> TokenResult<Self> {
        let mut module_path = conf.native_library().trim().to_string();
        let mut parameters = String::new();
        if let Some(idx) = module_path.find('?') {
            parameters = module_path[idx..].to_string();
            module_path.truncate(idx);
        }

        let base_dir = if module_path.is_empty() {
            let dir = std::env::temp_dir().join(DFLT_BASEDIR_NAME);
            info!("using default base directory {}", dir.display());
            dir
        } else {
            let dir = PathBuf::from(&module_path);
            info!("using explicit base directory {}", dir.display());
            dir
        };

        if !base_dir.exists() {
            Self::create_example_repository(&base_dir, DFLT_NUM_SLOTS).map_err(|e| {
                TokenError::Default(format!(
                    "could not initialize the base directory {}: {e}",
                    base_dir.display()
                ))
            })?;
            info!(
                "created and initialized the base directory {}",
                base_dir.display()
            );
        }

        let description = format!(
            "PKCS#11 emulator\nPath: {}{parameters}",
            base_dir.display()
        );

        let mut slot_ids: Vec<SlotId> = Vec::new();
        let mut seen_indexes = std::collections::HashSet::new();
        let mut seen_ids = std::collections::HashSet::new();

        let mut children: Vec<PathBuf> = fs::read_dir(&base_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        children.sort();

        for child in children {
            if !child.is_dir() {
                continue;
            }
            let Some(name) = child.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let parsed = name.split_once('-').and_then(|(index, id)| {
                Some((index.parse::<u32>().ok()?, id.parse::<u64>().ok()?))
            });
            let Some((index, id)) = parsed else {
                warn!("ignoring dir {}, invalid name syntax", child.display());
                continue;
            };

            if !seen_indexes.insert(index) {
                error!(
                    "ignoring slot dir {name}, the same slot index has already been assigned"
                );
                continue;
            }
            if !seen_ids.insert(id) {
                error!(
                    "ignoring slot dir {name}, the same slot identifier has already been assigned"
                );
                continue;
            }

            let slot_id = SlotId::new(index, id);
            if !conf.is_slot_included(&slot_id) {
                info!("skipped slot {slot_id}");
                continue;
            }
            slot_ids.push(slot_id);
        }

        let mut slots: Vec<Arc<dyn P11Slot>> = Vec::with_capacity(slot_ids.len());
        for slot_id in slot_ids {
            let passwords = conf
                .password_retriever()
                .passwords(&slot_id)
                .map_err(TokenError::Password)?
                .ok_or_else(|| TokenError::Default("no password is configured".to_string()))?;
            if passwords.len() != 1 {
                return Err(TokenError::Default(format!(
                    "{} passwords are configured, but 1 is permitted",
                    passwords.len()
                )));
            }

            let slot_dir = base_dir.join(format!("{}-{}", slot_id.index(), slot_id.id()));
            let slot = EmulatorP11Slot::new(
                conf.name(),
                &slot_dir,
                slot_id,
                conf.is_read_only(),
                KeyCryptor::new(&passwords[0])?,
                conf.mechanism_filter(),
                conf.new_object_conf().clone(),
                conf.secret_key_types().map(<[u64]>::to_vec),
                conf.key_pair_types().map(<[u64]>::to_vec),
            )?;
            slots.push(Arc::new(slot));
        }

        if slots.is_empty() {
            error!("found no slots");
        }

        Ok(Self {
            conf,
            slots: ModuleSlots::new(slots),
            description,
        })
    }

    fn create_example_repository(base_dir: &std::path::Path, num_slots: u32) -> std::io::Result<()> {
        for i in 0..num_slots {
            let slot_dir = base_dir.join(format!("{i}-{}", FIRST_SLOT_ID + u64::from(i)));
            fs::create_dir_all(&slot_dir)?;
            fs::write(
                slot_dir.join(slot::FILE_SLOT_INFO),
                format!("{}=true\n", slot::PROP_NAMED_CURVE_SUPPORTED),
            )?;
        }
        Ok(())
    }
}

impl P11Module for EmulatorP11Module {
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
    }
}
