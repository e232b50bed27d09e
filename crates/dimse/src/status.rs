//! DIMSE status codes
//!
//! Status values are re-exported verbatim so callers can show the peer's own
//! code. Conventions follow DICOM PS3.7 Annex C:
//! - `0x0000`: Success
//! - `0xFF00`, `0xFF01`: Pending (C-FIND, C-MOVE)
//! - `0xFE00`: Cancel
//! - `0x0001`, `0xB000-0xBFFF`: Warning
//! - everything else: Failure

/// Success
pub const SUCCESS: u16 = 0x0000;

/// Pending, all optional keys supported
pub const PENDING: u16 = 0xFF00;

/// Pending, some optional keys not supported
pub const PENDING_WARNING: u16 = 0xFF01;

/// Cancelled by the SCU
pub const CANCEL: u16 = 0xFE00;

/// C-MOVE refused: move destination unknown
pub const C_MOVE_UNKNOWN_AE: u16 = 0xA801;

/// A required attribute is missing from the received dataset
pub const DATA_ELEMENT_DOES_NOT_EXIST: u16 = 0x0120;

/// C-STORE refused: out of resources
pub const OUT_OF_RESOURCES: u16 = 0xA700;

/// C-STORE error: cannot understand
pub const CANNOT_UNDERSTAND: u16 = 0xC000;

/// Generic processing failure
pub const PROCESSING_FAILURE: u16 = 0x0110;

/// Sub-operations completed with one or more failures
pub const SUB_OPERATIONS_WARNING: u16 = 0xB000;

/// Classified DIMSE status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    /// Operation completed successfully
    Success,
    /// Operation is pending (more responses to follow)
    Pending(u16),
    /// Operation cancelled by user
    Cancel,
    /// Warning occurred during operation
    Warning(u16),
    /// Operation failed with error
    Failure(u16),
}

impl DimseStatus {
    /// Classify a raw status code
    pub fn from_code(code: u16) -> Self {
        match code {
            SUCCESS => DimseStatus::Success,
            PENDING | PENDING_WARNING => DimseStatus::Pending(code),
            CANCEL => DimseStatus::Cancel,
            0x0001 | 0x0107 | 0x0116 | SUB_OPERATIONS_WARNING..=0xBFFF => DimseStatus::Warning(code),
            _ => DimseStatus::Failure(code),
        }
    }

    /// The raw status code
    pub fn code(&self) -> u16 {
        match self {
            DimseStatus::Success => SUCCESS,
            DimseStatus::Cancel => CANCEL,
            DimseStatus::Pending(c) | DimseStatus::Warning(c) | DimseStatus::Failure(c) => *c,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DimseStatus::Success)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, DimseStatus::Pending(_))
    }

    /// Whether no further responses follow this one
    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }
}

impl std::fmt::Display for DimseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X} ({})", self.code(), describe(self.code()))
    }
}

/// Short human-readable description of a status code
pub fn describe(code: u16) -> &'static str {
    match code {
        SUCCESS => "Success",
        PENDING => "Pending",
        PENDING_WARNING => "Pending, optional keys not supported",
        CANCEL => "Cancelled",
        C_MOVE_UNKNOWN_AE => "Move destination unknown",
        DATA_ELEMENT_DOES_NOT_EXIST => "Required data element does not exist",
        PROCESSING_FAILURE => "Processing failure",
        SUB_OPERATIONS_WARNING => "Sub-operations complete, one or more failures",
        0x0122 => "SOP class not supported",
        0x0124 => "Not authorized",
        0xA701 => "Out of resources: unable to calculate number of matches",
        0xA702 => "Out of resources: unable to perform sub-operations",
        0xA700..=0xA7FF => "Out of resources",
        0xA900..=0xA9FF => "Dataset does not match SOP class",
        0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => "Warning",
        0xC000..=0xCFFF => "Cannot understand",
        _ => "Failure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(DimseStatus::from_code(0x0000), DimseStatus::Success);
        assert_eq!(DimseStatus::from_code(0xFF00), DimseStatus::Pending(0xFF00));
        assert_eq!(DimseStatus::from_code(0xFF01), DimseStatus::Pending(0xFF01));
        assert_eq!(DimseStatus::from_code(0xFE00), DimseStatus::Cancel);
        assert_eq!(DimseStatus::from_code(SUB_OPERATIONS_WARNING), DimseStatus::Warning(0xB000));
        assert_eq!(DimseStatus::from_code(0xA801), DimseStatus::Failure(0xA801));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!DimseStatus::from_code(PENDING).is_terminal());
        assert!(DimseStatus::from_code(SUCCESS).is_terminal());
        assert!(DimseStatus::from_code(C_MOVE_UNKNOWN_AE).is_terminal());
    }

    #[test]
    fn test_round_trip_code() {
        for code in [0x0000, 0xFF00, 0xFE00, 0xB000, 0xA801, 0xC000] {
            assert_eq!(DimseStatus::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe(C_MOVE_UNKNOWN_AE), "Move destination unknown");
        assert_eq!(describe(0xC123), "Cannot understand");
        assert_eq!(
            describe(SUB_OPERATIONS_WARNING),
            "Sub-operations complete, one or more failures"
        );
        assert_eq!(describe(0xB007), "Warning");
    }
}
