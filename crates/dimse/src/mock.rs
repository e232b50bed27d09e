//! Scripted associations for unit tests

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};

use crate::association::{Association, Connector};
use crate::config::{Endpoint, Timeouts};
use crate::context::{AcceptedContext, PresentationContextSpec};
use crate::message::{echo_rsp, encode_dataset, DimseMessage, C_FIND_RSP, C_MOVE_RSP, NO_DATA_SET};
use crate::{DimseError, Result};

/// Produces the replies to one request sent over a mock association
pub type Responder = Box<dyn FnMut(&DimseMessage) -> Vec<Result<DimseMessage>> + Send>;

/// Builds a fresh responder for each new association
pub struct MockPeer {
    factory: Box<dyn Fn() -> Responder + Send + Sync>,
}

impl MockPeer {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Responder + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
        }
    }

    /// Peer answering every request with a single reply built from it
    pub fn replying<F>(reply: F) -> Self
    where
        F: Fn(&DimseMessage) -> Vec<Result<DimseMessage>> + Clone + Send + Sync + 'static,
    {
        Self::new(move || {
            let reply = reply.clone();
            Box::new(move |request: &DimseMessage| reply(request))
        })
    }

    pub fn echo(status: u16) -> Self {
        Self::replying(move |request: &DimseMessage| {
            vec![Ok(DimseMessage::command(
                request.presentation_context_id,
                echo_rsp(1, status),
            ))]
        })
    }

    /// Peer that sends the given responses in order after the first request
    pub fn scripted(responses: Vec<DimseMessage>) -> Self {
        Self::replying(move |_: &DimseMessage| responses.iter().cloned().map(Ok).collect())
    }
}

/// Connector accepting every proposed context with its first transfer syntax
pub struct MockConnector {
    peer: MockPeer,
    pub open: Arc<AtomicUsize>,
    pub max_open: Arc<AtomicUsize>,
    pub connects: Arc<AtomicUsize>,
    pub releases: Arc<AtomicUsize>,
    pub aborts: Arc<AtomicUsize>,
    pub sent: Arc<Mutex<Vec<DimseMessage>>>,
    unreachable: AtomicBool,
    failing_release: bool,
    delay: Duration,
}

impl MockConnector {
    pub fn new(peer: MockPeer) -> Self {
        Self {
            peer,
            open: Arc::new(AtomicUsize::new(0)),
            max_open: Arc::new(AtomicUsize::new(0)),
            connects: Arc::new(AtomicUsize::new(0)),
            releases: Arc::new(AtomicUsize::new(0)),
            aborts: Arc::new(AtomicUsize::new(0)),
            sent: Arc::new(Mutex::new(Vec::new())),
            unreachable: AtomicBool::new(false),
            failing_release: false,
            delay: Duration::ZERO,
        }
    }

    /// Every connection attempt fails
    pub fn unreachable(self) -> Self {
        self.unreachable.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_release(mut self) -> Self {
        self.failing_release = true;
        self
    }

    /// Sleep this long before answering each request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn sent_messages(&self) -> Vec<DimseMessage> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        _local: &Endpoint,
        remote: &Endpoint,
        contexts: &[PresentationContextSpec],
        _timeouts: Timeouts,
    ) -> Result<Box<dyn Association>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DimseError::connection(format!("{} refused the connection", remote)));
        }

        let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now_open, Ordering::SeqCst);

        let contexts = contexts
            .iter()
            .enumerate()
            .map(|(i, pc)| AcceptedContext {
                id: (2 * i + 1) as u8,
                abstract_syntax: pc.abstract_syntax.clone(),
                transfer_syntax: pc.transfer_syntaxes[0].clone(),
            })
            .collect();

        Ok(Box::new(MockAssociation {
            contexts,
            responder: (self.peer.factory)(),
            replies: VecDeque::new(),
            open: self.open.clone(),
            releases: self.releases.clone(),
            aborts: self.aborts.clone(),
            sent: self.sent.clone(),
            closed: false,
            failing_release: self.failing_release,
            delay: self.delay,
        }))
    }
}

struct MockAssociation {
    contexts: Vec<AcceptedContext>,
    responder: Responder,
    replies: VecDeque<Result<DimseMessage>>,
    open: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
    aborts: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<DimseMessage>>>,
    closed: bool,
    failing_release: bool,
    delay: Duration,
}

impl MockAssociation {
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Association for MockAssociation {
    fn contexts(&self) -> &[AcceptedContext] {
        &self.contexts
    }

    fn send(&mut self, message: &DimseMessage) -> Result<()> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message.clone());
        }
        let replies = (self.responder)(message);
        self.replies.extend(replies);
        Ok(())
    }

    fn receive(&mut self) -> Result<DimseMessage> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.replies
            .pop_front()
            .unwrap_or_else(|| Err(DimseError::connection("connection closed by peer")))
    }

    fn release(&mut self) -> Result<()> {
        if self.failing_release {
            return Err(DimseError::connection("release not acknowledged"));
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.close();
        Ok(())
    }

    fn abort(&mut self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.close();
    }
}

impl Drop for MockAssociation {
    fn drop(&mut self) {
        self.close();
    }
}

/// C-FIND response with an optional identifier encoded in Implicit VR Little Endian
pub fn find_rsp(status: u16, identifier: Option<&InMemDicomObject>) -> DimseMessage {
    let command = InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_FIND_RSP])),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [1])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [if identifier.is_some() { 0x0001 } else { NO_DATA_SET }]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
    ]);
    match identifier {
        Some(obj) => DimseMessage::with_data(
            1,
            command,
            encode_dataset(obj, crate::context::IMPLICIT_VR_LITTLE_ENDIAN).unwrap(),
        ),
        None => DimseMessage::command(1, command),
    }
}

/// C-MOVE response with sub-operation counters
pub fn move_rsp(status: u16, remaining: u16, completed: u16, failed: u16, warning: u16) -> DimseMessage {
    let command = InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_MOVE_RSP])),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [1])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [NO_DATA_SET])),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [remaining]),
        ),
        DataElement::new(
            tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [completed]),
        ),
        DataElement::new(tags::NUMBER_OF_FAILED_SUBOPERATIONS, VR::US, dicom_value!(U16, [failed])),
        DataElement::new(
            tags::NUMBER_OF_WARNING_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [warning]),
        ),
    ]);
    DimseMessage::command(1, command)
}

/// Minimal CT instance carrying every attribute the storage handler requires
pub fn test_instance(patient_id: &str, sop_instance_uid: &str) -> InMemDicomObject {
    let text = |tag, vr, value: &str| DataElement::new(tag, vr, PrimitiveValue::from(value));
    InMemDicomObject::from_element_iter([
        text(tags::SOP_CLASS_UID, VR::UI, CT_IMAGE_STORAGE),
        text(tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid),
        text(tags::STUDY_DATE, VR::DA, "20240315"),
        text(tags::MODALITY, VR::CS, "CT"),
        text(tags::PATIENT_NAME, VR::PN, "DOE^JANE"),
        text(tags::PATIENT_ID, VR::LO, patient_id),
        text(tags::STUDY_INSTANCE_UID, VR::UI, "1.2.826.0.1.3680043.2.1"),
        text(tags::SERIES_INSTANCE_UID, VR::UI, "1.2.826.0.1.3680043.2.1.1"),
        text(tags::SERIES_NUMBER, VR::IS, "1"),
        text(tags::INSTANCE_NUMBER, VR::IS, "1"),
    ])
}

/// Write a test instance to `<root>/<patient_id>/<sop_instance_uid>.dcm`
pub fn write_test_instance(root: &Path, patient_id: &str, sop_instance_uid: &str) -> PathBuf {
    let dir = root.join(patient_id);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.dcm", sop_instance_uid));

    test_instance(patient_id, sop_instance_uid)
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(crate::context::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(sop_instance_uid),
        )
        .unwrap()
        .write_to_file(&path)
        .unwrap();
    path
}

pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
