use crate::storage::{StorageError, StorageResult};
use dicom_dictionary_std::tags;
use dicom_object::DefaultDicomObject;
use std::path::{Path, PathBuf};

/// Filesystem-based instance store
///
/// Instances live at `<root>/<PatientID>/<StudyInstanceUID>/<SeriesInstanceUID>/<SOPInstanceUID>.dcm`,
/// which is the layout the exporter walks.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root_path: PathBuf,
}

impl FilesystemStorage {
    /// Create a new store rooted at `root_path`, creating the directory if needed
    pub fn new<P: AsRef<Path>>(root_path: P) -> StorageResult<Self> {
        let root_path = root_path.as_ref().to_path_buf();

        if !root_path.exists() {
            std::fs::create_dir_all(&root_path).map_err(|e| {
                StorageError::Config(format!(
                    "Failed to create storage root directory '{}': {}",
                    root_path.display(),
                    e
                ))
            })?;
        }

        // Keep the path as given; canonicalizing resolves symlinks such as /var -> /private/var
        Ok(Self { root_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.root_path
    }

    /// Directory holding every instance of a patient
    pub fn patient_dir(&self, patient_id: &str) -> PathBuf {
        self.root_path.join(path_component(patient_id))
    }

    /// Write an instance below this store's root
    pub fn store(&self, dataset: &DefaultDicomObject) -> StorageResult<PathBuf> {
        write_instance(&self.root_path, dataset)
    }

    /// Patient directories currently present, sorted
    pub fn patient_ids(&self) -> StorageResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() && !name.starts_with('.') {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Write `dataset` below `root` in the patient/study/series layout
pub fn write_instance(root: &Path, dataset: &DefaultDicomObject) -> StorageResult<PathBuf> {
    let value = |tag, name: &str| -> StorageResult<String> {
        dataset
            .element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|v| v.trim_end_matches(|c: char| c == '\0' || c == ' ').to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| StorageError::Dicom(format!("missing {}", name)))
    };

    let patient = value(tags::PATIENT_ID, "PatientID")?;
    let study = value(tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?;
    let series = value(tags::SERIES_INSTANCE_UID, "SeriesInstanceUID").unwrap_or_else(|_| "UNKNOWN".into());
    let instance = value(tags::SOP_INSTANCE_UID, "SOPInstanceUID")?;

    let dir = root
        .join(path_component(&patient))
        .join(path_component(&study))
        .join(path_component(&series));
    std::fs::create_dir_all(&dir)?;

    let path = dir.join(format!("{}.dcm", path_component(&instance)));
    dataset
        .write_to_file(&path)
        .map_err(|e| StorageError::Dicom(format!("cannot write {}: {}", path.display(), e)))?;
    Ok(path)
}

/// Attribute value made safe for use as a single path component
fn path_component(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '^') {
                c
            } else {
                '_'
            }
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "UNKNOWN".to_string(),
        _ => cleaned,
    }
}
