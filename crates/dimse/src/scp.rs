//! Service Class Provider (SCP) implementation for inbound DIMSE operations
//!
//! The storage server answers C-ECHO and C-STORE for the radiology storage
//! classes. Every accepted dataset is validated, deduplicated by SOP Instance
//! UID and handed to an [`Anonymizer`] which persists it.

use std::collections::HashSet;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dicom_dictionary_std::tags;
use dicom_object::{DefaultDicomObject, FileMetaTableBuilder, InMemDicomObject};
use dicom_ul::association::ServerAssociationOptions;
use dicom_ul::Pdu;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::association::{command_pdu, MessageAssembler};
use crate::config::{DimseConfig, Endpoint, Timeouts};
use crate::context::{trim_uid, RADIOLOGY_STORAGE_CLASSES, VERIFICATION};
use crate::message::{
    decode_dataset, echo_rsp, read_string, store_rsp, DimseMessage, C_ECHO_RQ, C_STORE_RQ,
};
use crate::status;
use crate::{DimseError, Result};

/// Attributes every stored instance must carry, with their keywords for logging
pub const REQUIRED_ATTRIBUTES: [(dicom_core::Tag, &str); 8] = [
    (tags::PATIENT_ID, "PatientID"),
    (tags::PATIENT_NAME, "PatientName"),
    (tags::STUDY_INSTANCE_UID, "StudyInstanceUID"),
    (tags::STUDY_DATE, "StudyDate"),
    (tags::MODALITY, "Modality"),
    (tags::SERIES_NUMBER, "SeriesNumber"),
    (tags::INSTANCE_NUMBER, "InstanceNumber"),
    (tags::SOP_INSTANCE_UID, "SOPInstanceUID"),
];

/// Only one storage server may listen per process
static LISTENING: AtomicBool = AtomicBool::new(false);

/// Receives accepted instances, de-identifies them and writes them below the storage root
pub trait Anonymizer: Send + Sync {
    fn anonymize_and_store(
        &self,
        source: &Endpoint,
        dataset: DefaultDicomObject,
        storage_root: &Path,
    ) -> anyhow::Result<()>;
}

/// Outcome of [`InstanceRegistry::begin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns the UID and must call `finish` or `abandon`
    Owned,
    /// The instance has already been written
    Stored,
    /// Another association is writing the instance right now
    InFlight,
}

#[derive(Debug, Default)]
struct Instances {
    stored: HashSet<String>,
    in_flight: HashSet<String>,
}

/// SOP Instance UIDs written by this process, plus those currently being written
///
/// Only `finish` moves a UID into the stored set, so `contains` never reports an
/// instance whose write has not completed.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: Mutex<Instances>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Instances> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take ownership of a UID before writing it
    pub fn begin(&self, sop_instance_uid: &str) -> Claim {
        let mut instances = self.lock();
        if instances.stored.contains(sop_instance_uid) {
            Claim::Stored
        } else if !instances.in_flight.insert(sop_instance_uid.to_string()) {
            Claim::InFlight
        } else {
            Claim::Owned
        }
    }

    /// Record a completed write
    pub fn finish(&self, sop_instance_uid: &str) {
        let mut instances = self.lock();
        instances.in_flight.remove(sop_instance_uid);
        instances.stored.insert(sop_instance_uid.to_string());
    }

    /// Drop ownership after a failed write; a retransmission is processed again
    pub fn abandon(&self, sop_instance_uid: &str) {
        self.lock().in_flight.remove(sop_instance_uid);
    }

    /// Whether the instance has been written
    pub fn contains(&self, sop_instance_uid: &str) -> bool {
        self.lock().stored.contains(sop_instance_uid)
    }

    pub fn is_in_flight(&self, sop_instance_uid: &str) -> bool {
        self.lock().in_flight.contains(sop_instance_uid)
    }

    /// Number of written instances
    pub fn len(&self) -> usize {
        self.lock().stored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Check that every required attribute is present
pub fn validate_dataset(dataset: &InMemDicomObject) -> Result<()> {
    let missing: Vec<&str> = REQUIRED_ATTRIBUTES
        .iter()
        .filter(|(tag, _)| dataset.element(*tag).is_err())
        .map(|(_, name)| *name)
        .collect();

    if !missing.is_empty() {
        return Err(DimseError::validation(format!(
            "missing required attributes: {}",
            missing.join(", ")
        )));
    }

    match read_string(dataset, tags::SOP_INSTANCE_UID) {
        Some(uid) if !uid.is_empty() => Ok(()),
        _ => Err(DimseError::validation("SOPInstanceUID is empty")),
    }
}

/// Decides the status of each inbound C-ECHO and C-STORE
pub struct StoreHandler {
    storage_root: PathBuf,
    anonymizer: Arc<dyn Anonymizer>,
    registry: Arc<InstanceRegistry>,
}

impl StoreHandler {
    pub fn new(storage_root: impl Into<PathBuf>, anonymizer: Arc<dyn Anonymizer>) -> Self {
        Self {
            storage_root: storage_root.into(),
            anonymizer,
            registry: Arc::new(InstanceRegistry::new()),
        }
    }

    pub fn registry(&self) -> Arc<InstanceRegistry> {
        self.registry.clone()
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Verification is always answered with success
    pub fn handle_echo(&self, source: &Endpoint) -> u16 {
        info!("C-ECHO from {}", source);
        status::SUCCESS
    }

    /// Validate, deduplicate and persist one received instance
    pub fn handle_store(
        &self,
        source: &Endpoint,
        dataset: InMemDicomObject,
        transfer_syntax: &str,
        sop_class_uid: &str,
    ) -> u16 {
        if let Err(e) = validate_dataset(&dataset) {
            warn!("Rejecting instance from {}: {}", source, e);
            return status::DATA_ELEMENT_DOES_NOT_EXIST;
        }

        let sop_instance_uid = read_string(&dataset, tags::SOP_INSTANCE_UID).unwrap_or_default();
        match self.registry.begin(&sop_instance_uid) {
            Claim::Owned => {}
            Claim::Stored => {
                debug!("Instance {} already stored, ignoring duplicate", sop_instance_uid);
                return status::SUCCESS;
            }
            Claim::InFlight => {
                // the peer retries once the first write has an outcome
                warn!(
                    "Instance {} from {} is still being stored by another association",
                    sop_instance_uid, source
                );
                return status::OUT_OF_RESOURCES;
            }
        }

        match self.persist(source, dataset, transfer_syntax, sop_class_uid, &sop_instance_uid) {
            Ok(()) => {
                self.registry.finish(&sop_instance_uid);
                info!("Stored instance {} from {}", sop_instance_uid, source);
                status::SUCCESS
            }
            Err(e) => {
                self.registry.abandon(&sop_instance_uid);
                error!("Failed to store instance {} from {}: {:#}", sop_instance_uid, source, e);
                status::PROCESSING_FAILURE
            }
        }
    }

    fn persist(
        &self,
        source: &Endpoint,
        dataset: InMemDicomObject,
        transfer_syntax: &str,
        sop_class_uid: &str,
        sop_instance_uid: &str,
    ) -> anyhow::Result<()> {
        let sop_class_uid = read_string(&dataset, tags::SOP_CLASS_UID)
            .filter(|uid| !uid.is_empty())
            .unwrap_or_else(|| sop_class_uid.to_string());

        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(sop_class_uid)
            .media_storage_sop_instance_uid(sop_instance_uid)
            .transfer_syntax(transfer_syntax)
            .build()?;
        let file = dataset.with_exact_meta(meta);

        // a panicking anonymizer must not take the association down with it
        let anonymizer = self.anonymizer.clone();
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            anonymizer.anonymize_and_store(source, file, &self.storage_root)
        }))
        .map_err(|_| anyhow::anyhow!("anonymizer panicked"))?
    }
}

/// Lifecycle of a [`StorageServer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Listening,
}

/// Per-association settings shared by every connection of one server
struct AssociationSettings {
    ae_title: String,
    max_pdu: u32,
    transfer_syntaxes: Vec<String>,
    timeouts: Timeouts,
    handler: Arc<StoreHandler>,
}

struct Running {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_loop: JoinHandle<()>,
}

/// Storage SCP listening for inbound associations
pub struct StorageServer {
    local: Endpoint,
    config: DimseConfig,
    handler: Arc<StoreHandler>,
    state: ServerState,
    running: Option<Running>,
}

impl StorageServer {
    pub fn new(
        local: Endpoint,
        storage_root: impl Into<PathBuf>,
        anonymizer: Arc<dyn Anonymizer>,
        config: DimseConfig,
    ) -> Self {
        Self {
            local,
            config,
            handler: Arc::new(StoreHandler::new(storage_root, anonymizer)),
            state: ServerState::Stopped,
            running: None,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Address actually bound, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    pub fn handler(&self) -> Arc<StoreHandler> {
        self.handler.clone()
    }

    /// Bind the listener and start accepting associations
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.state != ServerState::Stopped {
            return Err(DimseError::Runtime(format!(
                "storage server {} is already running",
                self.local
            )));
        }
        if LISTENING.swap(true, Ordering::SeqCst) {
            return Err(DimseError::Runtime(
                "another storage server is already listening in this process".into(),
            ));
        }

        self.state = ServerState::Starting;
        match self.bind().await {
            Ok(running) => {
                let addr = running.local_addr;
                self.running = Some(running);
                self.state = ServerState::Listening;
                info!("Storage SCP {} listening on {}", self.local.ae_title, addr);
                Ok(addr)
            }
            Err(e) => {
                self.state = ServerState::Stopped;
                LISTENING.store(false, Ordering::SeqCst);
                error!("Storage SCP failed to start: {}", e);
                Err(e)
            }
        }
    }

    async fn bind(&self) -> Result<Running> {
        let mut local = self.local.clone();
        local.is_server = true;
        local.validate()?;
        self.config.validate()?;

        tokio::fs::create_dir_all(self.handler.storage_root())
            .await
            .map_err(|e| {
                DimseError::Storage(format!(
                    "cannot create storage root {}: {}",
                    self.handler.storage_root().display(),
                    e
                ))
            })?;

        let listener = TcpListener::bind(local.socket_address()).await?;
        let local_addr = listener.local_addr()?;

        let settings = Arc::new(AssociationSettings {
            ae_title: local.ae_title.clone(),
            max_pdu: self.config.max_pdu,
            transfer_syntaxes: self.config.transfer_syntaxes.clone(),
            timeouts: self.config.timeouts(),
            handler: self.handler.clone(),
        });

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            settings,
            cancel.clone(),
            tracker.clone(),
        ));

        Ok(Running {
            local_addr,
            cancel,
            tracker,
            accept_loop,
        })
    }

    /// Stop accepting, let in-flight associations finish, then release the port
    ///
    /// `final_shutdown` marks process exit as opposed to a restartable stop.
    pub async fn stop(&mut self, final_shutdown: bool) {
        let Some(running) = self.running.take() else {
            return;
        };

        if !final_shutdown {
            info!("Stopping storage SCP {} on request", self.local.ae_title);
        }

        running.cancel.cancel();
        if let Err(e) = running.accept_loop.await {
            warn!("Accept loop ended abnormally: {}", e);
        }
        running.tracker.close();
        running.tracker.wait().await;

        self.state = ServerState::Stopped;
        LISTENING.store(false, Ordering::SeqCst);
        debug!("Storage SCP stopped");
    }
}

impl Drop for StorageServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            LISTENING.store(false, Ordering::SeqCst);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    settings: Arc<AssociationSettings>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    let stream = match stream.into_std() {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!("Dropping connection from {}: {}", peer, e);
                            continue;
                        }
                    };
                    let settings = settings.clone();
                    tracker.spawn_blocking(move || {
                        if let Err(e) = serve_association(stream, peer, &settings) {
                            warn!("Association with {} ended with error: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }
}

fn serve_association(stream: TcpStream, peer: SocketAddr, settings: &AssociationSettings) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(settings.timeouts.network))?;
    stream.set_write_timeout(Some(settings.timeouts.network))?;

    let mut options = ServerAssociationOptions::new()
        .accept_any()
        .ae_title(settings.ae_title.clone())
        .max_pdu_length(settings.max_pdu)
        .with_abstract_syntax(VERIFICATION);
    for class in RADIOLOGY_STORAGE_CLASSES {
        options = options.with_abstract_syntax(*class);
    }
    for ts in &settings.transfer_syntaxes {
        options = options.with_transfer_syntax(ts.clone());
    }

    let mut association = options
        .establish(stream)
        .map_err(|e| DimseError::from_transport("association negotiation failed", &e))?;

    let calling_ae = association.client_ae_title().to_string();
    let source = Endpoint::new(peer.ip().to_string(), peer.port(), calling_ae);
    let contexts: Vec<(u8, String)> = association
        .presentation_contexts()
        .iter()
        .map(|pc| (pc.id, trim_uid(&pc.transfer_syntax).to_string()))
        .collect();
    info!("Association from {} ({} contexts)", source, contexts.len());

    let mut assembler = MessageAssembler::default();
    loop {
        let pdu = match association.receive() {
            Ok(pdu) => pdu,
            Err(e) => {
                let err = DimseError::from_transport("receive", &e);
                if err.is_timeout() {
                    info!("Association from {} idle, closing", source);
                    let _ = association.abort();
                    return Ok(());
                }
                return Err(err);
            }
        };

        match pdu {
            Pdu::PData { data } => {
                for pdv in data {
                    let message = match assembler.push(pdv) {
                        Ok(Some(message)) => message,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!("Malformed message from {}: {}", source, e);
                            continue;
                        }
                    };
                    if let Some(reply) = dispatch(&settings.handler, &source, &contexts, message) {
                        let pdu = command_pdu(reply.presentation_context_id, &reply.command)?;
                        association
                            .send(&pdu)
                            .map_err(|e| DimseError::from_transport("send response", &e))?;
                    }
                }
            }
            Pdu::ReleaseRQ => {
                association
                    .send(&Pdu::ReleaseRP)
                    .map_err(|e| DimseError::from_transport("send release response", &e))?;
                info!("Association from {} released", source);
                return Ok(());
            }
            Pdu::AbortRQ { source: abort_source } => {
                warn!("Association from {} aborted: {:?}", source, abort_source);
                return Ok(());
            }
            other => {
                debug!("Ignoring {} from {}", other.short_description(), source);
            }
        }
    }
}

/// Response for one complete inbound message
fn dispatch(
    handler: &StoreHandler,
    source: &Endpoint,
    contexts: &[(u8, String)],
    message: DimseMessage,
) -> Option<DimseMessage> {
    let cmd = match message.command_set() {
        Ok(cmd) => cmd,
        Err(e) => {
            warn!("Unreadable command set from {}: {}", source, e);
            return None;
        }
    };
    let message_id = cmd.message_id.unwrap_or(1);
    let pc_id = message.presentation_context_id;

    match cmd.command_field {
        C_ECHO_RQ => Some(DimseMessage::command(pc_id, echo_rsp(message_id, handler.handle_echo(source)))),
        C_STORE_RQ => {
            let sop_class = cmd.affected_sop_class_uid.unwrap_or_default();
            let sop_instance = cmd.affected_sop_instance_uid.unwrap_or_default();
            let transfer_syntax = contexts
                .iter()
                .find(|(id, _)| *id == pc_id)
                .map(|(_, ts)| ts.as_str());

            let status = match (message.data.as_deref(), transfer_syntax) {
                (Some(data), Some(ts)) => match decode_dataset(data, ts) {
                    Ok(dataset) => handler.handle_store(source, dataset, ts, &sop_class),
                    Err(e) => {
                        warn!("Cannot decode instance {} from {}: {}", sop_instance, source, e);
                        status::CANNOT_UNDERSTAND
                    }
                },
                _ => {
                    warn!("C-STORE from {} without a usable data set", source);
                    status::CANNOT_UNDERSTAND
                }
            };
            Some(DimseMessage::command(
                pc_id,
                store_rsp(message_id, &sop_class, &sop_instance, status),
            ))
        }
        other => {
            warn!("Unsupported command 0x{:04X} from {}", other, source);
            None
        }
    }
}
