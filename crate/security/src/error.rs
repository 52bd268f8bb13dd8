use thiserror::Error;

/// A borrow on the signer pool timed out.
#[derive(Error, Debug)]
#[error("no idle signer available")]
pub struct NoIdleSignerError;

#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("{0}")]
    Default(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    NoIdleSigner(#[from] NoIdleSignerError),

    #[error("{0}")]
    Token(#[from] tessera_pkcs11::TokenError),
}
