//! Bulk export of stored patients to a remote Storage SCP
//!
//! Each patient gets its own task and its own association. At most
//! `export_pool_size` patients are in flight at once. A critical failure in
//! any task stops the job: patients not yet started are skipped while tasks
//! already running finish on their own. A cancel request additionally stops
//! running tasks before their next file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::association::{open_association, AssociationGuard, Connector, UlConnector};
use crate::config::{DimseConfig, Endpoint, Timeouts};
use crate::context::{build_contexts_with, PresentationContextSpec, ServiceClass};
use crate::scu::store_file;
use crate::status;
use crate::types::ResultQueue;
use crate::{DimseError, Result};

/// What to send, from where, to where
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub patient_ids: Vec<String>,
    /// Root of the local store; each patient lives in `<storage_root>/<patient_id>/`
    pub storage_root: PathBuf,
    pub source: Endpoint,
    pub destination: Endpoint,
}

/// Per-patient progress; emitted after every file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportProgress {
    pub patient_id: String,
    pub files_to_send: usize,
    pub files_sent: usize,
    pub errors: usize,
}

impl ExportProgress {
    pub fn new(patient_id: impl Into<String>, files_to_send: usize) -> Self {
        Self {
            patient_id: patient_id.into(),
            files_to_send,
            files_sent: 0,
            errors: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.files_sent + self.errors >= self.files_to_send
    }
}

/// Items pushed to the caller's export queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExportEvent {
    Progress(ExportProgress),
    /// The job stopped scheduling new patients because of this failure
    CriticalError { patient_id: String, error: String },
}

/// Totals once every task of a job has finished
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSummary {
    pub job_id: Uuid,
    pub patients: usize,
    pub patients_completed: usize,
    /// Never started because the job stopped first
    pub patients_skipped: usize,
    /// Started, then stopped between two files by a cancel request
    pub patients_cancelled: usize,
    pub files_to_send: usize,
    pub files_sent: usize,
    pub errors: usize,
    /// Stopped early by a critical error or a cancel request
    pub aborted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// How often a single file is retried after a transport timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Run `op`, repeating it while it fails with a timeout and retries remain
    ///
    /// `op` receives the zero-based attempt number.
    pub fn run<T>(&self, mut op: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Err(e) if e.is_timeout() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!("Timeout ({}), retry {}/{}", e, attempt, self.max_retries);
                }
                other => return other,
            }
        }
    }
}

/// Running export; dropping it leaves the job running in the background
pub struct ExportHandle {
    job_id: Uuid,
    cancel: CancellationToken,
    join: JoinHandle<ExportSummary>,
}

impl ExportHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Stop scheduling new patients and stop running ones before their next file
    ///
    /// Files already handed to the peer are not interrupted.
    pub fn cancel(&self) {
        info!("Cancelling export {}", self.job_id);
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for every task of the job to finish
    pub async fn wait(self) -> Result<ExportSummary> {
        self.join
            .await
            .map_err(|e| DimseError::internal(format!("export {} panicked: {}", self.job_id, e)))
    }
}

/// Bulk export orchestrator
pub struct Exporter {
    config: DimseConfig,
    connector: Arc<dyn Connector>,
}

impl Exporter {
    pub fn new(config: DimseConfig) -> Self {
        let connector = Arc::new(UlConnector::new(config.max_pdu));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: DimseConfig, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    /// Start exporting every patient of `job`; returns immediately
    ///
    /// Progress records and critical errors are pushed into `queue`.
    pub fn export_patients(&self, job: ExportJob, queue: ResultQueue<ExportEvent>) -> ExportHandle {
        let job_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let stop = cancel.child_token();
        let pool = Arc::new(Semaphore::new(self.config.export_pool_size.max(1)));

        let shared = Arc::new(PatientTaskContext {
            connector: self.connector.clone(),
            local: job.source.clone(),
            remote: job.destination.clone(),
            storage_root: job.storage_root.clone(),
            contexts: build_contexts_with(ServiceClass::RadiologyStorage, &self.config.transfer_syntaxes),
            timeouts: self.config.timeouts(),
            retry: RetryPolicy::new(self.config.max_store_retries),
            cancel: cancel.clone(),
            stop,
            queue,
        });

        info!(
            "Starting export {} of {} patients to {} (pool size {})",
            job_id,
            job.patient_ids.len(),
            job.destination,
            self.config.export_pool_size
        );

        let span = info_span!("export", job = %job_id);
        let join = tokio::spawn(
            async move {
                let started_at = Utc::now();
                let patients = job.patient_ids.len();
                let mut tasks = JoinSet::new();

                for patient_id in job.patient_ids {
                    let pool = pool.clone();
                    let shared = shared.clone();
                    tasks.spawn(async move {
                        // the permit is held until the blocking task finishes
                        let _permit = match pool.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => return PatientOutcome::Skipped,
                        };
                        if shared.stop.is_cancelled() {
                            debug!("Skipping patient {}: export stopped", patient_id);
                            return PatientOutcome::Skipped;
                        }
                        let worker = shared.clone();
                        match tokio::task::spawn_blocking(move || worker.export_patient(&patient_id)).await {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                error!("Patient export task failed: {}", e);
                                shared.stop.cancel();
                                PatientOutcome::Critical(None)
                            }
                        }
                    });
                }

                let mut summary = ExportSummary {
                    job_id,
                    patients,
                    patients_completed: 0,
                    patients_skipped: 0,
                    patients_cancelled: 0,
                    files_to_send: 0,
                    files_sent: 0,
                    errors: 0,
                    aborted: false,
                    started_at,
                    finished_at: started_at,
                };

                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok(PatientOutcome::Finished(progress)) => {
                            summary.patients_completed += 1;
                            summary.add(&progress);
                        }
                        Ok(PatientOutcome::Critical(progress)) => {
                            summary.aborted = true;
                            if let Some(progress) = progress {
                                summary.add(&progress);
                            }
                        }
                        Ok(PatientOutcome::Cancelled(progress)) => {
                            summary.aborted = true;
                            summary.patients_cancelled += 1;
                            summary.add(&progress);
                        }
                        Ok(PatientOutcome::Skipped) => summary.patients_skipped += 1,
                        Err(e) => {
                            error!("Export scheduling task failed: {}", e);
                            summary.aborted = true;
                        }
                    }
                }

                summary.aborted |= shared.stop.is_cancelled();
                summary.finished_at = Utc::now();
                info!(
                    "Export finished: {}/{} files sent, {} errors, {} patients skipped{}",
                    summary.files_sent,
                    summary.files_to_send,
                    summary.errors,
                    summary.patients_skipped,
                    if summary.aborted { " (aborted)" } else { "" }
                );
                summary
            }
            .instrument(span),
        );

        ExportHandle { job_id, cancel, join }
    }
}

impl ExportSummary {
    fn add(&mut self, progress: &ExportProgress) {
        self.files_to_send += progress.files_to_send;
        self.files_sent += progress.files_sent;
        self.errors += progress.errors;
    }
}

enum PatientOutcome {
    Finished(ExportProgress),
    Critical(Option<ExportProgress>),
    Cancelled(ExportProgress),
    Skipped,
}

struct PatientTaskContext {
    connector: Arc<dyn Connector>,
    local: Endpoint,
    remote: Endpoint,
    storage_root: PathBuf,
    contexts: Vec<PresentationContextSpec>,
    timeouts: Timeouts,
    retry: RetryPolicy,
    /// Cancel requested by the caller
    cancel: CancellationToken,
    /// Admission stop; child of `cancel`, also tripped by critical errors
    stop: CancellationToken,
    queue: ResultQueue<ExportEvent>,
}

impl PatientTaskContext {
    fn emit(&self, event: ExportEvent) {
        if self.queue.send(event).is_err() {
            debug!("Export queue closed");
        }
    }

    fn connect(&self) -> Result<AssociationGuard> {
        open_association(
            self.connector.as_ref(),
            &self.local,
            &self.remote,
            &self.contexts,
            self.timeouts,
        )
    }

    /// Count `remaining` files as failed, report, and stop the whole job
    fn critical(&self, mut progress: ExportProgress, remaining: usize, err: DimseError) -> PatientOutcome {
        let err = DimseError::CriticalJob(err.to_string());
        error!("Exporting patient {} failed: {}", progress.patient_id, err);
        progress.errors += remaining;
        self.emit(ExportEvent::Progress(progress.clone()));
        self.emit(ExportEvent::CriticalError {
            patient_id: progress.patient_id.clone(),
            error: err.to_string(),
        });
        self.stop.cancel();
        PatientOutcome::Critical(Some(progress))
    }

    fn export_patient(&self, patient_id: &str) -> PatientOutcome {
        let files = discover_patient_files(&self.storage_root, patient_id);
        let mut progress = ExportProgress::new(patient_id, files.len());
        info!("Exporting patient {} ({} files)", patient_id, files.len());

        if files.is_empty() {
            self.emit(ExportEvent::Progress(progress.clone()));
            return PatientOutcome::Finished(progress);
        }

        let mut slot = match self.connect() {
            Ok(guard) => Some(guard),
            Err(e) => return self.critical(progress, files.len(), e),
        };

        let mut message_id: u16 = 0;
        for (index, path) in files.iter().enumerate() {
            if index > 0 && self.cancel.is_cancelled() {
                let remaining = files.len() - index;
                info!("Export cancelled, {} files of patient {} not sent", remaining, patient_id);
                progress.errors += remaining;
                self.emit(ExportEvent::Progress(progress.clone()));
                if let Some(guard) = slot {
                    guard.release();
                }
                return PatientOutcome::Cancelled(progress);
            }
            message_id = message_id.wrapping_add(1).max(1);

            let result = self.retry.run(|attempt| {
                if attempt > 0 {
                    debug!("Reconnecting to {} for {}", self.remote, path.display());
                }
                if slot.is_none() {
                    slot = Some(self.connect()?);
                }
                let guard = match slot.as_mut() {
                    Some(guard) => guard,
                    None => return Err(DimseError::internal("association slot empty")),
                };
                match store_file(guard.association()?, path, message_id) {
                    Err(e) if e.is_timeout() => {
                        // a timed out association is unusable
                        if let Some(stale) = slot.take() {
                            stale.abort();
                        }
                        Err(e)
                    }
                    other => other,
                }
            });

            match result {
                Ok(status::SUCCESS) => progress.files_sent += 1,
                Ok(code) => {
                    progress.errors += 1;
                    warn!(
                        "C-STORE of {} returned 0x{:04X} ({})",
                        path.display(),
                        code,
                        status::describe(code)
                    );
                }
                Err(DimseError::Validation(msg)) | Err(DimseError::DicomObject(msg)) => {
                    progress.errors += 1;
                    warn!("Skipping {}: {}", path.display(), msg);
                }
                Err(e) => {
                    drop(slot);
                    return self.critical(progress, files.len() - index, e);
                }
            }

            self.emit(ExportEvent::Progress(progress.clone()));
        }

        if let Some(guard) = slot {
            guard.release();
        }

        info!(
            "Patient {} done: {}/{} sent, {} errors",
            patient_id, progress.files_sent, progress.files_to_send, progress.errors
        );
        PatientOutcome::Finished(progress)
    }
}

/// Regular, non-hidden files under `<storage_root>/<patient_id>/`, in path order
pub fn discover_patient_files(storage_root: &Path, patient_id: &str) -> Vec<PathBuf> {
    if patient_id.is_empty() || patient_id.contains(|c| c == '/' || c == '\\') || patient_id == ".." {
        warn!("Refusing patient id '{}' as a directory name", patient_id);
        return Vec::new();
    }

    let dir = storage_root.join(patient_id);
    if !dir.is_dir() {
        warn!("No stored data for patient {} under {}", patient_id, storage_root.display());
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = WalkDir::new(&dir)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}
