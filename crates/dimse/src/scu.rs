//! Service Class User (SCU) implementation for outbound DIMSE operations
//!
//! Each operation opens its own association, runs the exchange on a blocking
//! worker thread and releases the association before returning.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::association::{with_association, Association, Connector, UlConnector};
use crate::config::{validate_ae_title, DimseConfig, Endpoint, Timeouts};
use crate::context::{
    build_contexts_with, find_context, find_context_for_transfer, is_native_transfer_syntax,
    trim_uid, PresentationContextSpec, ServiceClass, STUDY_ROOT_FIND, STUDY_ROOT_MOVE,
    VERIFICATION,
};
use crate::message::{
    decode_dataset, echo_rq, encode_dataset, find_rq, move_rq, store_rq, DimseMessage,
};
use crate::status::{self, DimseStatus};
use crate::types::{FindResponse, MoveOutcome, MoveProgress, QueryIdentifier, ResultQueue};
use crate::{DimseError, Result};

/// DIMSE Service Class User
#[derive(Clone)]
pub struct DimseScu {
    config: DimseConfig,
    connector: Arc<dyn Connector>,
}

impl DimseScu {
    /// Create a new SCU talking over real TCP associations
    pub fn new(config: DimseConfig) -> Self {
        let connector = Arc::new(UlConnector::new(config.max_pdu));
        Self::with_connector(config, connector)
    }

    /// Create a new SCU with a custom association connector
    pub fn with_connector(config: DimseConfig, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    pub fn config(&self) -> &DimseConfig {
        &self.config
    }

    fn session(&self, service: ServiceClass) -> Session {
        Session {
            connector: self.connector.clone(),
            contexts: build_contexts_with(service, &self.config.transfer_syntaxes),
            timeouts: self.config.timeouts(),
        }
    }

    /// Send a C-ECHO request; true only when the peer answered with success
    pub async fn echo(&self, local: &Endpoint, remote: &Endpoint) -> bool {
        info!("Sending C-ECHO to {}", remote);

        let session = self.session(ServiceClass::Verification);
        let (local, remote) = (local.clone(), remote.clone());
        let outcome = tokio::task::spawn_blocking(move || session.echo(&local, &remote)).await;

        match outcome {
            Ok(Ok(true)) => {
                info!("C-ECHO completed successfully");
                true
            }
            Ok(Ok(false)) => false,
            Ok(Err(e)) => {
                warn!("C-ECHO failed: {}", e);
                false
            }
            Err(e) => {
                error!("C-ECHO worker failed: {}", e);
                false
            }
        }
    }

    /// Send a study-level C-FIND and collect every matching identifier
    pub async fn find(
        &self,
        local: &Endpoint,
        remote: &Endpoint,
        query: &QueryIdentifier,
    ) -> Result<Vec<QueryIdentifier>> {
        info!("Sending C-FIND to {}", remote);
        debug!("C-FIND query: {:?}", query);

        let session = self.session(ServiceClass::StudyRootFind);
        let (local, remote, query) = (local.clone(), remote.clone(), query.clone());

        let results = tokio::task::spawn_blocking(move || {
            let mut results = Vec::new();
            session.find(&local, &remote, &query, &mut |response: FindResponse| {
                if let Some(identifier) = response.identifier {
                    results.push(identifier);
                }
            })?;
            Ok::<_, DimseError>(results)
        })
        .await
        .map_err(|e| DimseError::internal(format!("C-FIND worker failed: {}", e)))??;

        info!("C-FIND completed with {} matches", results.len());
        Ok(results)
    }

    /// Run a C-FIND in the background, pushing each response into `queue`
    ///
    /// A failure is pushed as the last item of the queue.
    pub fn find_background(
        &self,
        local: &Endpoint,
        remote: &Endpoint,
        query: &QueryIdentifier,
        queue: ResultQueue<Result<FindResponse>>,
    ) -> JoinHandle<()> {
        info!("Sending background C-FIND to {}", remote);

        let session = self.session(ServiceClass::StudyRootFind);
        let (local, remote, query) = (local.clone(), remote.clone(), query.clone());

        tokio::task::spawn_blocking(move || {
            let outcome = session.find(&local, &remote, &query, &mut |response: FindResponse| {
                if queue.send(Ok(response)).is_err() {
                    debug!("C-FIND result queue closed");
                }
            });
            if let Err(e) = outcome {
                warn!("Background C-FIND failed: {}", e);
                if queue.send(Err(e)).is_err() {
                    debug!("C-FIND result queue closed");
                }
            }
        })
    }

    /// Ask the peer to send a study to `destination_aet`, collecting every progress record
    ///
    /// A refused move (for example an unknown destination) is returned as the final
    /// record. A lost connection sets `error` and keeps the records seen before it.
    pub async fn move_study(
        &self,
        local: &Endpoint,
        remote: &Endpoint,
        study_instance_uid: &str,
        destination_aet: &str,
    ) -> MoveOutcome {
        info!(
            "Sending C-MOVE to {} (study: {}, dest: {})",
            remote, study_instance_uid, destination_aet
        );
        if let Err(e) = validate_ae_title(destination_aet) {
            return MoveOutcome {
                records: Vec::new(),
                error: Some(e),
            };
        }

        let session = self.session(ServiceClass::StudyRootMove);
        let (local, remote) = (local.clone(), remote.clone());
        let (study, destination) = (study_instance_uid.to_string(), destination_aet.to_string());

        let worker = tokio::task::spawn_blocking(move || {
            let mut records = Vec::new();
            let result = session.move_study(&local, &remote, &study, &destination, &mut |progress: MoveProgress| {
                records.push(progress)
            });
            MoveOutcome {
                records,
                error: result.err(),
            }
        })
        .await;

        let outcome = worker.unwrap_or_else(|e| MoveOutcome {
            records: Vec::new(),
            error: Some(DimseError::internal(format!("C-MOVE worker failed: {}", e))),
        });

        match (&outcome.error, outcome.last()) {
            (Some(e), _) => warn!("C-MOVE failed after {} records: {}", outcome.records.len(), e),
            (None, Some(last)) => info!("C-MOVE finished: {}", last),
            (None, None) => {}
        }
        outcome
    }

    /// Run a C-MOVE in the background, pushing each progress record into `queue`
    pub fn move_background(
        &self,
        local: &Endpoint,
        remote: &Endpoint,
        study_instance_uid: &str,
        destination_aet: &str,
        queue: ResultQueue<Result<MoveProgress>>,
    ) -> JoinHandle<()> {
        info!(
            "Sending background C-MOVE to {} (study: {}, dest: {})",
            remote, study_instance_uid, destination_aet
        );

        let session = self.session(ServiceClass::StudyRootMove);
        let (local, remote) = (local.clone(), remote.clone());
        let (study, destination) = (study_instance_uid.to_string(), destination_aet.to_string());

        tokio::task::spawn_blocking(move || {
            let outcome = validate_ae_title(&destination).and_then(|_| {
                session.move_study(&local, &remote, &study, &destination, &mut |progress: MoveProgress| {
                    if queue.send(Ok(progress)).is_err() {
                        debug!("C-MOVE progress queue closed");
                    }
                })
            });
            if let Err(e) = outcome {
                warn!("Background C-MOVE failed: {}", e);
                if queue.send(Err(e)).is_err() {
                    debug!("C-MOVE progress queue closed");
                }
            }
        })
    }

    /// Send files over one storage association, stopping at the first failure
    pub async fn send_files(
        &self,
        local: &Endpoint,
        remote: &Endpoint,
        files: Vec<PathBuf>,
    ) -> Result<bool> {
        info!("Sending {} files to {}", files.len(), remote);

        let session = self.session(ServiceClass::RadiologyStorage);
        let (local, remote) = (local.clone(), remote.clone());

        tokio::task::spawn_blocking(move || session.send_files(&local, &remote, &files))
            .await
            .map_err(|e| DimseError::internal(format!("C-STORE worker failed: {}", e)))?
    }
}

/// What one blocking exchange needs: how to connect and what to propose
struct Session {
    connector: Arc<dyn Connector>,
    contexts: Vec<PresentationContextSpec>,
    timeouts: Timeouts,
}

impl Session {
    fn run<T>(
        &self,
        local: &Endpoint,
        remote: &Endpoint,
        f: impl FnOnce(&mut dyn Association) -> Result<T>,
    ) -> Result<T> {
        with_association(
            self.connector.as_ref(),
            local,
            remote,
            &self.contexts,
            self.timeouts,
            f,
        )
    }

    fn echo(&self, local: &Endpoint, remote: &Endpoint) -> Result<bool> {
        self.run(local, remote, |assoc| {
            let pc_id = find_context(assoc.contexts(), VERIFICATION)
                .map(|pc| pc.id)
                .ok_or_else(|| DimseError::connection("Verification context was not accepted"))?;

            assoc.send(&DimseMessage::command(pc_id, echo_rq(1)))?;
            let status = assoc.receive()?.command_set()?.status;
            debug!("C-ECHO response status: {:?}", status);
            Ok(status == Some(status::SUCCESS))
        })
    }

    fn find(
        &self,
        local: &Endpoint,
        remote: &Endpoint,
        query: &QueryIdentifier,
        on_response: &mut dyn FnMut(FindResponse),
    ) -> Result<()> {
        self.run(local, remote, |assoc| {
            let pc = find_context(assoc.contexts(), STUDY_ROOT_FIND)
                .cloned()
                .ok_or_else(|| DimseError::connection("Study Root FIND context was not accepted"))?;

            let identifier = encode_dataset(&query.to_request_dataset(), &pc.transfer_syntax)?;
            assoc.send(&DimseMessage::with_data(pc.id, find_rq(1, STUDY_ROOT_FIND), identifier))?;

            loop {
                let response = assoc.receive().map_err(lost_connection)?;
                let cmd = response.command_set()?;
                let status = cmd
                    .status
                    .ok_or_else(|| DimseError::connection("C-FIND response carried no status"))?;

                match DimseStatus::from_code(status) {
                    DimseStatus::Success | DimseStatus::Pending(_) => {
                        let identifier = match &response.data {
                            Some(data) => Some(QueryIdentifier::from_response(decode_dataset(
                                data,
                                &pc.transfer_syntax,
                            )?)),
                            None => None,
                        };
                        on_response(FindResponse { status, identifier });
                        if status == status::SUCCESS {
                            return Ok(());
                        }
                    }
                    _ => {
                        let description = cmd.status_description();
                        warn!("C-FIND failed with status 0x{:04X}: {}", status, description);
                        return Err(DimseError::protocol(status, description));
                    }
                }
            }
        })
    }

    fn move_study(
        &self,
        local: &Endpoint,
        remote: &Endpoint,
        study_instance_uid: &str,
        destination_aet: &str,
        on_progress: &mut dyn FnMut(MoveProgress),
    ) -> Result<()> {
        self.run(local, remote, |assoc| {
            let pc = find_context(assoc.contexts(), STUDY_ROOT_MOVE)
                .cloned()
                .ok_or_else(|| DimseError::connection("Study Root MOVE context was not accepted"))?;

            let mut identifier = InMemDicomObject::new_empty();
            identifier.put(DataElement::new(
                tags::QUERY_RETRIEVE_LEVEL,
                VR::CS,
                PrimitiveValue::from("STUDY"),
            ));
            identifier.put(DataElement::new(
                tags::STUDY_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(study_instance_uid),
            ));
            let data = encode_dataset(&identifier, &pc.transfer_syntax)?;
            assoc.send(&DimseMessage::with_data(
                pc.id,
                move_rq(1, STUDY_ROOT_MOVE, destination_aet),
                data,
            ))?;

            loop {
                let cmd = assoc.receive().map_err(lost_connection)?.command_set()?;
                let status = cmd
                    .status
                    .ok_or_else(|| DimseError::connection("C-MOVE response carried no status"))?;

                let progress = MoveProgress::from_command(&cmd, status);
                debug!("C-MOVE progress: {}", progress);
                on_progress(progress);

                if progress.is_terminal() {
                    if progress.is_unknown_destination() {
                        warn!("{} does not know move destination {}", remote, destination_aet);
                    }
                    return Ok(());
                }
            }
        })
    }

    fn send_files(&self, local: &Endpoint, remote: &Endpoint, files: &[PathBuf]) -> Result<bool> {
        self.run(local, remote, |assoc| {
            let mut message_id: u16 = 0;
            for path in files {
                message_id = message_id.wrapping_add(1).max(1);
                let status = store_file(assoc, path, message_id)?;
                if status != status::SUCCESS {
                    return Err(DimseError::protocol(status, status::describe(status)));
                }
            }
            Ok(true)
        })
    }
}

/// A failed receive in the middle of a response sequence
fn lost_connection(err: DimseError) -> DimseError {
    match err {
        DimseError::Timeout(msg) => DimseError::Connection(msg),
        other => other,
    }
}

/// Send one file with C-STORE over an open association and return the peer's status
///
/// Files in a native encoding are re-encoded to whatever native syntax was
/// negotiated; encapsulated files only go over a context with their own syntax.
pub(crate) fn store_file(assoc: &mut dyn Association, path: &Path, message_id: u16) -> Result<u16> {
    let file = dicom_object::open_file(path).map_err(|e| {
        DimseError::validation(format!("cannot read {}: {}", path.display(), e))
    })?;

    let meta = file.meta();
    let sop_class = trim_uid(meta.media_storage_sop_class_uid()).to_string();
    let sop_instance = trim_uid(meta.media_storage_sop_instance_uid()).to_string();
    let file_syntax = trim_uid(meta.transfer_syntax()).to_string();

    let pc = find_context_for_transfer(assoc.contexts(), &sop_class, &file_syntax)
        .cloned()
        .ok_or_else(|| {
            DimseError::validation(format!(
                "{}: no accepted presentation context for SOP class {}",
                path.display(),
                sop_class
            ))
        })?;

    let compatible = pc.transfer_syntax == file_syntax
        || (is_native_transfer_syntax(&file_syntax) && is_native_transfer_syntax(&pc.transfer_syntax));
    if !compatible {
        return Err(DimseError::validation(format!(
            "{}: encoded in {} but the peer accepted {}",
            path.display(),
            file_syntax,
            pc.transfer_syntax
        )));
    }

    let data = encode_dataset(&file, &pc.transfer_syntax)?;
    debug!("C-STORE {} ({} bytes) on context {}", sop_instance, data.len(), pc.id);

    assoc.send(&DimseMessage::with_data(
        pc.id,
        store_rq(message_id, &sop_class, &sop_instance),
        data,
    ))?;

    assoc
        .receive()?
        .command_set()?
        .status
        .ok_or_else(|| DimseError::connection("C-STORE response carried no status"))
}
