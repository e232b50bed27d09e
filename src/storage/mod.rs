use serde::Deserialize;
use std::path::Path;

use dicom_object::DefaultDicomObject;
use dimse::{Anonymizer, Endpoint};

pub mod filesystem;

pub use filesystem::FilesystemStorage;

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path error: {0}")]
    Path(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("DICOM error: {0}")]
    Dicom(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Configuration for the local instance store
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory; one subdirectory per patient
    #[serde(default = "default_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
        }
    }
}

fn default_path() -> String {
    "./data".to_string()
}

/// Writes received instances unchanged into the storage root
///
/// De-identification proper plugs in behind the same [`Anonymizer`] seam.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughAnonymizer;

impl Anonymizer for PassthroughAnonymizer {
    fn anonymize_and_store(
        &self,
        source: &Endpoint,
        dataset: DefaultDicomObject,
        storage_root: &Path,
    ) -> anyhow::Result<()> {
        let path = filesystem::write_instance(storage_root, &dataset)?;
        tracing::debug!("Wrote instance from {} to {}", source, path.display());
        Ok(())
    }
}
