//! Signer engines backed by a PKCS#11 slot.

use std::sync::Arc;

use tessera_pkcs11::{names, ExtraParams, P11Key, P11Params, P11Slot};
use tracing::debug;

use crate::{
    concurrent::{ConcurrentContentSigner, ContentSigner},
    error::SecurityError,
};

/// One engine: a slot, a key handle and a fixed mechanism. The engine itself
/// is single-threaded; the pool serializes access to it.
pub struct P11ContentSigner {
    slot: Arc<dyn P11Slot>,
    key_handle: u64,
    mechanism: u64,
    params: Option<P11Params>,
    extra_params: Option<ExtraParams>,
}

impl ContentSigner for P11ContentSigner {
    fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
        Ok(self.slot.sign(
            self.mechanism,
            self.params.as_ref(),
            self.extra_params.as_ref(),
            self.key_handle,
            data,
        )?)
    }
}

/// Pre-builds N engines over one key and wraps them into a pool.
pub struct P11ContentSignerBuilder {
    slot: Arc<dyn P11Slot>,
    key: P11Key,
    mechanism: u64,
    params: Option<P11Params>,
    parallelism: usize,
}

impl P11ContentSignerBuilder {
    pub fn new(slot: Arc<dyn P11Slot>, key: P11Key, mechanism: u64) -> Self {
        Self {
            slot,
            key,
            mechanism,
            params: None,
            parallelism: 4,
        }
    }

    pub fn with_params(mut self, params: P11Params) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn build(self) -> Result<ConcurrentContentSigner, SecurityError> {
        if self.parallelism == 0 {
            return Err(SecurityError::InvalidArgument(
                "parallelism must be positive".to_string(),
            ));
        }
        if !self.slot.supports_mechanism(self.mechanism, names::CKF_SIGN) {
            return Err(SecurityError::Default(format!(
                "slot does not support signing with {}",
                names::ckm_display(self.mechanism)
            )));
        }

        let mac = self.key.is_secret();
        let key_handle = self.key.key_id().handle();
        let engines = (0..self.parallelism)
            .map(|_| {
                Box::new(P11ContentSigner {
                    slot: self.slot.clone(),
                    key_handle,
                    mechanism: self.mechanism,
                    params: self.params.clone(),
                    extra_params: None,
                }) as Box<dyn ContentSigner>
            })
            .collect();

        let signer = ConcurrentContentSigner::new(mac, engines)?;
        if mac {
            // the digest of the MAC key identifies it in issued certificates
            match self.slot.digest_secret_key(names::CKM_SHA_1, key_handle) {
                Ok(digest) => signer.set_sha1_of_mac_key(&digest)?,
                Err(e) => debug!("could not compute the MAC key digest: {e}"),
            }
        }
        Ok(signer)
    }
}
