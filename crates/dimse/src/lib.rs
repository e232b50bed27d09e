//! DIMSE (DICOM Message Service Element) implementation
//!
//! This crate provides both Service Class Provider (SCP) and Service Class User (SCU)
//! implementations for DICOM networking using the DIMSE protocol.
//!
//! # Features
//! - Outbound DIMSE services (SCU): C-ECHO, C-FIND, C-MOVE, C-STORE
//! - Bulk export of stored patients over a bounded pool of associations
//! - Inbound Storage SCP with validation and duplicate suppression
//! - Every operation runs on its own association, always released afterwards

pub mod association;
pub mod config;
pub mod context;
pub mod error;
pub mod export;
pub mod message;
pub mod scp;
pub mod scu;
pub mod status;
pub mod types;

#[cfg(test)]
mod mock;

// Re-export commonly used types
pub use association::{Association, Connector, UlConnector};
pub use config::{DimseConfig, Endpoint, Timeouts};
pub use context::ServiceClass;
pub use error::{DimseError, Result};
pub use export::{ExportEvent, ExportHandle, ExportJob, ExportProgress, ExportSummary, Exporter, RetryPolicy};
pub use scp::{Anonymizer, Claim, InstanceRegistry, ServerState, StorageServer, StoreHandler};
pub use scu::DimseScu;
pub use status::DimseStatus;
pub use types::{result_queue, FindResponse, MoveOutcome, MoveProgress, QueryIdentifier, ResultQueue};

/// Default DICOM port
pub const DEFAULT_DIMSE_PORT: u16 = 11112;
