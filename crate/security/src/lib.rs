//! Signing services on top of the PKCS#11 abstraction: a concurrent content
//! signer multiplexing a bounded set of engines, and a shared hash service.

mod bag;
pub mod concurrent;
mod error;
pub mod hash;
pub mod p11;

#[cfg(test)]
mod tests;

pub use bag::ConcurrentBag;
pub use concurrent::{BorrowedSigner, ConcurrentContentSigner, ContentSigner};
pub use error::{NoIdleSignerError, SecurityError};
pub use hash::HashAlgo;
pub use p11::{P11ContentSigner, P11ContentSignerBuilder};
