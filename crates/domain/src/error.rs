/// Shared error type used across all Slipway crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with the entity's current state
    /// (e.g. summarization already running, session mid-turn).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("capacity: {0}")]
    Capacity(String),

    /// Refused by the quota allocator.
    #[error("blocked: {0}")]
    Blocked(String),

    #[error("nothing to do: {0}")]
    EmptyInput(String),

    /// The agent process ran but reported a failure.
    #[error("agent: {0}")]
    Agent(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Short machine-readable category, used in error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Capacity(_) => "capacity",
            Error::Blocked(_) => "blocked",
            Error::EmptyInput(_) => "empty_input",
            Error::Agent(_) => "agent",
            Error::Transient(_) => "transient",
            Error::Timeout(_) => "timeout",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable() {
        assert_eq!(Error::Conflict("x".into()).kind(), "conflict");
        assert_eq!(Error::Capacity("x".into()).kind(), "capacity");
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(Error::from(io).kind(), "io");
    }

    #[test]
    fn display_includes_context() {
        let err = Error::NotFound("session abc".into());
        assert_eq!(err.to_string(), "not found: session abc");
    }
}
