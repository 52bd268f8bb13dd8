//! Password resolution for token logins.
//!
//! The resolver itself is an injected collaborator; this module only defines
//! the consumed interface, the per-slot retriever and a demo pass-through
//! resolver. Resolved passwords are handed out as [`Zeroizing`] buffers that
//! the caller owns and may wipe.

use zeroize::Zeroizing;

use crate::{
    conf::P11SlotIdFilter,
    error::PasswordError,
    slot::SlotId,
};

/// Resolves a configured password string into the actual password bytes.
///
/// A hint may be a cleartext password, an encrypted blob, or a prompt
/// instruction; the implementation decides.
pub trait PasswordResolver: Send + Sync {
    fn resolve_password(&self, password_hint: &str) -> Result<Zeroizing<Vec<u8>>, PasswordError>;
}

/// A single protocol-scoped resolver, e.g. for `PBE:` or `THRU:` hints.
pub trait SinglePasswordResolver: Send + Sync {
    fn can_resolve_protocol(&self, protocol: &str) -> bool;

    fn resolve_password(&self, password_hint: &str) -> Result<Zeroizing<Vec<u8>>, PasswordError>;

    fn protect_password(&self, password: &[u8]) -> Result<String, PasswordError>;
}

const THRU: &str = "THRU";

/// Demo resolver that passes the password through unchanged.
///
/// Only for demonstration purposes, do not use it in production.
pub struct PassThroughPasswordResolver;

impl SinglePasswordResolver for PassThroughPasswordResolver {
    fn can_resolve_protocol(&self, protocol: &str) -> bool {
        protocol == THRU
    }

    fn resolve_password(&self, password_hint: &str) -> Result<Zeroizing<Vec<u8>>, PasswordError> {
        let prefix = format!("{THRU}:");
        let value = password_hint.strip_prefix(&prefix).ok_or_else(|| {
            PasswordError(format!("password hint does not start with '{prefix}'"))
        })?;
        Ok(Zeroizing::new(value.as_bytes().to_vec()))
    }

    fn protect_password(&self, password: &[u8]) -> Result<String, PasswordError> {
        Ok(format!("{THRU}:{}", String::from_utf8_lossy(password)))
    }
}

struct SinglePasswordEntry {
    slots: Option<Vec<P11SlotIdFilter>>,
    passwords: Option<Vec<String>>,
}

impl SinglePasswordEntry {
    fn matches(&self, slot_id: &SlotId) -> bool {
        match &self.slots {
            None => true,
            Some(filters) => filters.iter().any(|f| f.matches(slot_id)),
        }
    }
}

/// Per-slot password chains, consulted in insertion order; the first entry
/// whose slot filter matches decides.
#[derive(Default)]
pub struct P11PasswordsRetriever {
    entries: Vec<SinglePasswordEntry>,
    resolver: Option<std::sync::Arc<dyn PasswordResolver>>,
}

impl P11PasswordsRetriever {
    pub fn set_resolver(&mut self, resolver: std::sync::Arc<dyn PasswordResolver>) {
        self.resolver = Some(resolver);
    }

    pub(crate) fn add_entry(
        &mut self,
        slots: Option<Vec<P11SlotIdFilter>>,
        passwords: Vec<String>,
    ) {
        self.entries.push(SinglePasswordEntry {
            slots,
            passwords: if passwords.is_empty() {
                None
            } else {
                Some(passwords)
            },
        });
    }

    /// Returns the passwords to log into the token of `slot_id`, or `None`
    /// when no entry applies.
    pub fn passwords(
        &self,
        slot_id: &SlotId,
    ) -> Result<Option<Vec<Zeroizing<Vec<u8>>>>, PasswordError> {
        for entry in &self.entries {
            if !entry.matches(slot_id) {
                continue;
            }
            let Some(passwords) = &entry.passwords else {
                return Ok(None);
            };
            let mut resolved = Vec::with_capacity(passwords.len());
            for password in passwords {
                resolved.push(match &self.resolver {
                    Some(resolver) => resolver.resolve_password(password)?,
                    None => Zeroizing::new(password.as_bytes().to_vec()),
                });
            }
            return Ok(Some(resolved));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_through_protocol() {
        let resolver = PassThroughPasswordResolver;
        assert!(resolver.can_resolve_protocol("THRU"));
        assert!(!resolver.can_resolve_protocol("PBE"));

        let pwd = resolver.resolve_password("THRU:test-1234").unwrap();
        assert_eq!(pwd.as_slice(), b"test-1234");
        assert!(resolver.resolve_password("PBE:xyz").is_err());
        assert_eq!(resolver.protect_password(b"abc").unwrap(), "THRU:abc");
    }

    #[test]
    fn first_matching_entry_wins() {
        let mut retriever = P11PasswordsRetriever::default();
        retriever.add_entry(
            Some(vec![P11SlotIdFilter::new(Some(0), None).unwrap()]),
            vec!["slot0-pwd".to_string()],
        );
        retriever.add_entry(None, vec!["fallback".to_string()]);

        let slot0 = SlotId::new(0, 800_000);
        let slot1 = SlotId::new(1, 800_001);

        let pwds = retriever.passwords(&slot0).unwrap().unwrap();
        assert_eq!(pwds[0].as_slice(), b"slot0-pwd");
        let pwds = retriever.passwords(&slot1).unwrap().unwrap();
        assert_eq!(pwds[0].as_slice(), b"fallback");
    }
}
