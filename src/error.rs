use thiserror::Error;

/// Policy status values surfaced to the channel and returned from `update`.
///
/// `Clone` so a status can be stored as an endpoint list's last failure and
/// replayed by the failing picker on every pick.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PolicyError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("empty address list")]
    EmptyAddressList,

    #[error("address resolution failed: {0}")]
    Resolution(String),

    #[error("connections to all backends failing; last error: {0}")]
    AllBackendsFailing(String),

    /// Aggregated per-endpoint construction failures. The endpoint list keeps
    /// serving the endpoints that did construct.
    #[error("errors from children: [{0}]")]
    ChildErrors(String),

    #[error("{0}")]
    Other(String),
}
