//! Error types for DIMSE operations

use thiserror::Error;

/// Result type alias for DIMSE operations
pub type Result<T> = std::result::Result<T, DimseError>;

/// Error types that can occur during DIMSE operations
#[derive(Error, Debug)]
pub enum DimseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// The association was never established or dropped mid-exchange
    #[error("Connection error: {0}")]
    Connection(String),

    /// The peer answered with an explicit non-success DIMSE status
    #[error("Protocol error (status 0x{status:04X}): {description}")]
    Protocol { status: u16, description: String },

    /// A dataset was rejected locally before any network or storage side effect
    #[error("Validation error: {0}")]
    Validation(String),

    /// A job-wide export condition which stops further scheduling
    #[error("Critical export error: {0}")]
    CriticalJob(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("DICOM object error: {0}")]
    DicomObject(String),

    #[error("Invalid AE Title: {0}")]
    InvalidAeTitle(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DimseError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a new protocol error from a peer status
    pub fn protocol(status: u16, description: impl Into<String>) -> Self {
        Self::Protocol {
            status,
            description: description.into(),
        }
    }

    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error came from a transport timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            DimseError::Timeout(_) => true,
            DimseError::Network(e) => is_timeout_kind(e.kind()),
            _ => false,
        }
    }

    /// Peer status carried by a protocol error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            DimseError::Protocol { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify a transport-level failure, walking the source chain for an I/O timeout.
    pub(crate) fn from_transport(context: &str, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(e) = current {
            if let Some(io) = e.downcast_ref::<std::io::Error>() {
                if is_timeout_kind(io.kind()) {
                    return DimseError::Timeout(format!("{}: {}", context, err));
                }
            }
            current = e.source();
        }
        DimseError::Connection(format!("{}: {}", context, err))
    }
}

fn is_timeout_kind(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_found_in_source_chain() {
        #[derive(Debug)]
        struct Wrapper(std::io::Error);
        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "receive failed")
            }
        }
        impl std::error::Error for Wrapper {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }

        let err = Wrapper(std::io::Error::new(std::io::ErrorKind::WouldBlock, "slow"));
        let classified = DimseError::from_transport("C-STORE", &err);
        assert!(classified.is_timeout());

        let err = Wrapper(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        let classified = DimseError::from_transport("C-STORE", &err);
        assert!(matches!(classified, DimseError::Connection(_)));
        assert!(!classified.is_timeout());
    }

    #[test]
    fn test_protocol_error_exposes_status() {
        let err = DimseError::protocol(0xA700, "Out of resources");
        assert_eq!(err.status(), Some(0xA700));
        assert!(err.to_string().contains("0xA700"));
    }
}
