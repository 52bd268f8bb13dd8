use thiserror::Error;

pub type TokenResult<T> = Result<T, TokenError>;

/// Error raised while validating a module configuration.
#[derive(Error, Debug)]
#[error("invalid configuration: {0}")]
pub struct ConfError(pub String);

impl ConfError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Error raised by the injected password resolver.
#[derive(Error, Debug)]
#[error("could not resolve password: {0}")]
pub struct PasswordError(pub String);

/// The unified per-operation error of the PKCS#11 layer.
///
/// All backend-specific failures are funneled into this type so that callers
/// never have to distinguish the native driver, the emulator and the proxy.
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("{0}")]
    Default(String),

    #[error("unsupported mechanism: {0}")]
    UnsupportedMechanism(String),

    #[error("the slot is read-only, operation {0} is not permitted")]
    ReadOnly(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Password(#[from] PasswordError),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl TokenError {
    /// Is this the read-only rejection?
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly(_))
    }

    pub fn is_unsupported_mechanism(&self) -> bool {
        matches!(self, Self::UnsupportedMechanism(_))
    }
}
