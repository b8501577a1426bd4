pub mod policy;

pub use policy::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("Unsupported content policy: {0}")]
    Unsupported(String),
    #[error("Invalid content policy: {0}")]
    Invalid(String),
    #[error("Policy violation: {0}")]
    Violation(String),
}
