//! Error types for the daemon core.
//!
//! The variants here form the stable external surface: REST layers map them
//! onto response codes via [`Error::status_code`], and the reconciler uses
//! them to distinguish fatal kernel failures from transient store hiccups.

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core errors with a stable taxonomy.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Attempt to create a duplicate virtual service or backend.
    #[error("specified object already exists: {0}")]
    ObjectExists(String),

    /// Referenced virtual service or backend is unknown.
    #[error("unable to locate specified object: {0}")]
    ObjectNotFound(String),

    /// Backend address family differs from its service.
    #[error("incompatible address families")]
    IncompatibleAfs,

    /// The kernel IPVS layer rejected an operation.
    ///
    /// Driver-level details are abstracted here so the binding stays
    /// replaceable; the concrete failure is logged at the call site.
    #[error("error while calling into IPVS: {0}")]
    IpvsSyscall(String),

    /// Missing, out-of-range or unknown option value.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Daemon configuration problem outside the option taxonomy, such as a
    /// missing VIP interface.
    #[error("configuration error: {0}")]
    Config(String),

    /// The external store is misconfigured (bad URL set, unknown scheme).
    #[error("store configuration error: {0}")]
    StoreConfig(String),

    /// A store operation failed; the current reconciliation cycle is
    /// abandoned and retried on the next tick.
    #[error("store operation failed: {0}")]
    Store(#[source] anyhow::Error),
}

impl Error {
    /// Create an [`Error::IpvsSyscall`] from any displayable failure.
    pub fn ipvs(reason: impl std::fmt::Display) -> Self {
        Self::IpvsSyscall(reason.to_string())
    }

    /// Get the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ObjectExists(_) => 409,
            Self::ObjectNotFound(_) => 404,
            Self::IpvsSyscall(_) | Self::Store(_) => 500,
            Self::IncompatibleAfs | Self::Validation(_) | Self::Config(_) | Self::StoreConfig(_) => {
                400
            }
        }
    }
}

/// Option validation errors, one kind per unknown enum or missing field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ValidationError {
    /// Host or port information is absent and no default applies.
    #[error("endpoint information is missing")]
    MissingEndpoint,

    /// Host did not resolve to an address.
    #[error("unable to resolve host: {0}")]
    HostResolution(String),

    /// Protocol is neither tcp nor udp.
    #[error("specified protocol is unknown: {0}")]
    UnknownProtocol(String),

    /// Forwarding method is not one of nat, dr, tunnel or ipip.
    #[error("specified forwarding method is unknown: {0}")]
    UnknownForwardingMethod(String),

    /// A scheduler flag token is not in the fixed table.
    #[error("specified scheduler flag is unknown: {0}")]
    UnknownSchedulerFlag(String),

    /// A fallback token is not in the fixed table.
    #[error("specified fallback flag is unknown: {0}")]
    UnknownFallbackFlag(String),

    /// A pulse option could not be interpreted.
    #[error("invalid pulse options: {0}")]
    InvalidPulse(String),
}
