//! Thread-safe signing over a bounded set of single-threaded engines.

use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use once_cell::sync::Lazy;
use tracing::{error, info};

use crate::{
    bag::ConcurrentBag,
    error::{NoIdleSignerError, SecurityError},
};

/// Default borrow timeout in milliseconds, clamped to [0, 60_000].
pub const TIMEOUT_ENV: &str = "TESSERA_SIGNSERVICE_TIMEOUT";

const DFLT_TIMEOUT_MS: u64 = 10_000;
const MAX_TIMEOUT_MS: u64 = 60_000;

static DEFAULT_TIMEOUT: Lazy<Duration> = Lazy::new(|| {
    let mut timeout = DFLT_TIMEOUT_MS;
    if let Ok(value) = std::env::var(TIMEOUT_ENV) {
        match value.parse::<u64>() {
            Ok(ms) if ms <= MAX_TIMEOUT_MS => {
                info!("using {TIMEOUT_ENV}: {ms}");
                timeout = ms;
            }
            _ => error!("invalid {TIMEOUT_ENV}: {value}"),
        }
    }
    Duration::from_millis(timeout)
});

static NAME_INDEX: AtomicUsize = AtomicUsize::new(1);

/// A single-threaded signer engine. One engine is never used by two threads
/// at the same time; the pool guarantees that.
pub trait ContentSigner: Send {
    fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>, SecurityError>;
}

/// Multiplexes parallel signing over a bounded set of pre-built engines.
pub struct ConcurrentContentSigner {
    name: String,
    mac: bool,
    sha1_of_mac_key: Mutex<Option<[u8; 20]>>,
    signers: ConcurrentBag<Box<dyn ContentSigner>>,
}

impl std::fmt::Debug for ConcurrentContentSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentContentSigner")
            .field("name", &self.name)
            .field("mac", &self.mac)
            .finish_non_exhaustive()
    }
}

impl ConcurrentContentSigner {
    pub fn new(
        mac: bool,
        engines: Vec<Box<dyn ContentSigner>>,
    ) -> Result<Self, SecurityError> {
        if engines.is_empty() {
            return Err(SecurityError::InvalidArgument(
                "at least one signer engine is required".to_string(),
            ));
        }
        let signers = ConcurrentBag::new();
        for engine in engines {
            signers.add(engine);
        }
        Ok(Self {
            name: format!("signer-{}", NAME_INDEX.fetch_add(1, Ordering::Relaxed)),
            mac,
            sha1_of_mac_key: Mutex::new(None),
            signers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_mac(&self) -> bool {
        self.mac
    }

    /// Records the SHA-1 digest of the MAC key; only meaningful for MAC
    /// signers and the digest must be exactly 20 bytes.
    pub fn set_sha1_of_mac_key(&self, digest: &[u8]) -> Result<(), SecurityError> {
        if !self.mac {
            return Err(SecurityError::InvalidArgument(
                "not a MAC signer".to_string(),
            ));
        }
        let digest: [u8; 20] = digest.try_into().map_err(|_| {
            SecurityError::InvalidArgument(format!(
                "invalid sha1 digest length ({} != 20)",
                digest.len()
            ))
        })?;
        *self.sha1_of_mac_key.lock().expect("mac key digest poisoned") = Some(digest);
        Ok(())
    }

    pub fn sha1_of_mac_key(&self) -> Option<[u8; 20]> {
        *self.sha1_of_mac_key.lock().expect("mac key digest poisoned")
    }

    /// Borrows an engine with the process-wide default timeout.
    pub fn borrow_signer(&self) -> Result<BorrowedSigner<'_>, NoIdleSignerError> {
        self.borrow_signer_with_timeout(*DEFAULT_TIMEOUT)
    }

    /// Borrows an engine, blocking up to `timeout`. The engine returns to the
    /// pool when the guard is dropped.
    pub fn borrow_signer_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<BorrowedSigner<'_>, NoIdleSignerError> {
        let signer = self.signers.borrow(timeout).ok_or(NoIdleSignerError)?;
        Ok(BorrowedSigner {
            pool: self,
            signer: Some(signer),
        })
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let mut signer = self.borrow_signer()?;
        signer.sign(data)
    }

    /// Signs each element over a single borrow.
    pub fn sign_batch(&self, data: &[&[u8]]) -> Result<Vec<Vec<u8>>, SecurityError> {
        let mut signer = self.borrow_signer()?;
        let mut signatures = Vec::with_capacity(data.len());
        for chunk in data {
            signatures.push(signer.sign(chunk)?);
        }
        Ok(signatures)
    }

    /// Probes the pool with a fixed content; never fails, an unusable pool
    /// reports unhealthy.
    pub fn is_healthy(&self) -> bool {
        match self.borrow_signer() {
            Ok(mut signer) => match signer.sign(&[1, 2, 3, 4]) {
                Ok(signature) => !signature.is_empty(),
                Err(e) => {
                    error!("health check of {} failed: {e}", self.name);
                    false
                }
            },
            Err(e) => {
                error!("health check of {} failed: {e}", self.name);
                false
            }
        }
    }

    /// Engines currently idle; engines on loan are excluded.
    pub fn idle_signers(&self) -> usize {
        self.signers.idle_count()
    }
}

/// Scoped loan of one engine; dropping it requites the engine.
pub struct BorrowedSigner<'a> {
    pool: &'a ConcurrentContentSigner,
    signer: Option<Box<dyn ContentSigner>>,
}

impl Deref for BorrowedSigner<'_> {
    type Target = dyn ContentSigner;

    fn deref(&self) -> &Self::Target {
        self.signer.as_ref().expect("signer already requited").as_ref()
    }
}

impl DerefMut for BorrowedSigner<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.signer.as_mut().expect("signer already requited").as_mut()
    }
}

impl Drop for BorrowedSigner<'_> {
    fn drop(&mut self) {
        if let Some(signer) = self.signer.take() {
            self.pool.signers.requite(signer);
        }
    }
}
