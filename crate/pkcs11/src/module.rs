//! Module-level contract and slot bookkeeping.

use std::{collections::HashMap, sync::Arc};

use crate::{
    conf::P11ModuleConf,
    error::{TokenError, TokenResult},
    slot::{P11Slot, SlotId},
};

/// A PKCS#11 module: a set of slots behind one backend.
pub trait P11Module: Send + Sync {
    fn conf(&self) -> &P11ModuleConf;

    fn description(&self) -> String;

    fn slot_ids(&self) -> Vec<SlotId>;

    fn slot(&self, slot_id: &SlotId) -> TokenResult<Arc<dyn P11Slot>>;

    fn close(&self);

    fn name(&self) -> &str {
        self.conf().name()
    }

    fn is_read_only(&self) -> bool {
        self.conf().is_read_only()
    }

    fn slot_id_for_index(&self, index: u32) -> TokenResult<SlotId> {
        self.slot_ids()
            .into_iter()
            .find(|id| id.index() == index)
            .ok_or_else(|| {
                TokenError::Default(format!("could not find slot with index {index}"))
            })
    }

    fn slot_id_for_id(&self, id: u64) -> TokenResult<SlotId> {
        self.slot_ids()
            .into_iter()
            .find(|slot_id| slot_id.id() == id)
            .ok_or_else(|| TokenError::Default(format!("could not find slot with id {id}")))
    }
}

/// Slot registry embedded by the module implementations.
pub(crate) struct ModuleSlots {
    slot_ids: Vec<SlotId>,
    slots: HashMap<SlotId, Arc<dyn P11Slot>>,
}

impl ModuleSlots {
    pub(crate) fn new(slots: Vec<Arc<dyn P11Slot>>) -> Self {
        let mut slot_ids = Vec::with_capacity(slots.len());
        let mut by_id = HashMap::with_capacity(slots.len());
        for slot in slots {
            let slot_id = *slot.slot_id();
            slot_ids.push(slot_id);
            by_id.insert(slot_id, slot);
        }
        Self {
            slot_ids,
            slots: by_id,
        }
    }

    pub(crate) fn slot_ids(&self) -> Vec<SlotId> {
        self.slot_ids.clone()
    }

    pub(crate) fn slot(&self, slot_id: &SlotId) -> TokenResult<Arc<dyn P11Slot>> {
        self.slots
            .get(slot_id)
            .cloned()
            .ok_or_else(|| TokenError::Default(format!("unknown slot {slot_id}")))
    }

    pub(crate) fn close_all(&self) {
        for slot in self.slots.values() {
            slot.close();
        }
    }
}
