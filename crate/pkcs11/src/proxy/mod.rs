//! Client of the HSM proxy protocol.
//!
//! The transport is injected: it ships opaque byte arrays tagged with a
//! [`ProxyAction`] and returns the server's reply bytes. Framing below the
//! request/response level (length prefixes, connection handling) is the
//! transport's business.

pub mod msg;
mod slot;

use std::sync::Arc;

pub use msg::{ProxyAction, ProxyMessage};
pub use slot::HsmProxyP11Slot;
use tracing::info;

use crate::{
    conf::P11ModuleConf,
    error::TokenResult,
    module::{ModuleSlots, P11Module},
    slot::{P11Slot, SlotId},
};

/// Ships one tagged request to the remote HSM server and returns the reply.
pub trait ProxyTransport: Send + Sync {
    fn send(&self, action: ProxyAction, request: &[u8]) -> TokenResult<Vec<u8>>;
}

/// Module-level requests are framed with slot id 0.
const MODULE_SLOT_ID: u64 = 0;

pub struct HsmProxyP11Module {
    conf: P11ModuleConf,
    slots: ModuleSlots,
    description: String,
}

impl HsmProxyP11Module {
    pub fn new(conf: P11ModuleConf, transport: Arc<dyn ProxyTransport>) -> TokenResult<Self> {
        let caps = msg::expect_module_caps(slot::send(
            &transport,
            MODULE_SLOT_ID,
            ProxyAction::ModuleCaps,
            None::<&()>,
        )?)?;
        // the module is read-only if either side says so
        let read_only = conf.is_read_only() || caps.read_only;

        let description = format!(
            "HSM proxy client\nModule: {}\nRemote maxMessageSize: {}",
            conf.name(),
            caps.max_message_size
        );
        info!("PKCS#11 module\n{description}");

        let remote_slot_ids = msg::expect_slot_ids(slot::send(
            &transport,
            MODULE_SLOT_ID,
            ProxyAction::SlotIds,
            None::<&()>,
        )?)?;

        let mut slots: Vec<Arc<dyn P11Slot>> = Vec::with_capacity(remote_slot_ids.len());
        for slot_id in remote_slot_ids {
            if !conf.is_slot_included(&slot_id) {
                info!("skipped slot {slot_id}");
                continue;
            }
            slots.push(Arc::new(HsmProxyP11Slot::new(
                &conf,
                slot_id,
                read_only,
                transport.clone(),
            )?));
        }

        Ok(Self {
            conf,
            slots: ModuleSlots::new(slots),
            description,
        })
    }
}

impl P11Module for HsmProxyP11Module {
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
