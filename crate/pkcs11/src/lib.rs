//! Uniform PKCS#11 abstraction for the Tessera PKI stack.
//!
//! Three interchangeable backends sit behind one slot contract: a native
//! backend speaking the PKCS#11 C ABI through a vendor library, a software
//! emulator storing keys as encrypted files on disk, and a proxy client
//! tunneling operations to a remote HSM server over CBOR.

mod asn1;
pub mod conf;
mod curves;
pub mod emulator;
mod error;
mod factory;
mod key;
mod module;
pub mod names;
pub mod native;
mod params;
pub mod password;
pub mod proxy;
mod slot;

#[cfg(test)]
mod tests;

pub use conf::{P11MechanismFilter, P11ModuleConf, P11NewObjectConf, P11SlotIdFilter, Pkcs11Conf};
pub use error::{ConfError, PasswordError, TokenError, TokenResult};
pub use factory::{P11CryptService, P11CryptServiceFactory};
pub use key::{DsaKeyParams, EcKeyParams, P11Key, RsaKeyParams};
pub use module::P11Module;
pub use params::{ExtraParams, P11Params};
pub use slot::{stable_hash32, KeyId, MechanismInfo, NewKeyControl, P11Slot, SlotCore, SlotId};
