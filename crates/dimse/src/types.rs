//! Common types for DIMSE operations

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::message::{read_string, CommandSet};
use crate::status::{self, DimseStatus};
use crate::{DimseError, Result};

/// Unbounded queue a background operation pushes its results into
pub type ResultQueue<T> = mpsc::UnboundedSender<T>;

/// Create a result queue and the receiver the caller drains
pub fn result_queue<T>() -> (ResultQueue<T>, mpsc::UnboundedReceiver<T>) {
    mpsc::unbounded_channel()
}

/// Bookkeeping attributes removed from every C-FIND response before it is handed out
pub const STRIPPED_RESPONSE_TAGS: [Tag; 3] = [
    tags::QUERY_RETRIEVE_LEVEL,
    tags::RETRIEVE_AE_TITLE,
    tags::SPECIFIC_CHARACTER_SET,
];

/// Study-level query keys, used both as C-FIND request and as parsed response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryIdentifier {
    pub patient_name: String,
    pub patient_id: String,
    pub accession_number: String,
    /// Single date (`YYYYMMDD`) or range (`YYYYMMDD-YYYYMMDD`)
    pub study_date: String,
    /// Matched against ModalitiesInStudy
    pub modality: String,
    pub study_instance_uid: String,
    pub study_description: String,
    pub number_of_series: Option<u32>,
    pub number_of_instances: Option<u32>,

    /// Full response identifier, bookkeeping attributes removed
    #[serde(skip)]
    pub dataset: Option<InMemDicomObject>,
}

/// Two identifiers describe the same study when their Study Instance UIDs match
impl PartialEq for QueryIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.study_instance_uid == other.study_instance_uid
    }
}

impl QueryIdentifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_patient_name(mut self, name: impl Into<String>) -> Self {
        self.patient_name = name.into();
        self
    }

    pub fn with_patient_id(mut self, id: impl Into<String>) -> Self {
        self.patient_id = id.into();
        self
    }

    pub fn with_accession_number(mut self, accession: impl Into<String>) -> Self {
        self.accession_number = accession.into();
        self
    }

    pub fn with_study_date(mut self, date: impl Into<String>) -> Self {
        self.study_date = date.into();
        self
    }

    pub fn with_modality(mut self, modality: impl Into<String>) -> Self {
        self.modality = modality.into();
        self
    }

    pub fn with_study_instance_uid(mut self, uid: impl Into<String>) -> Self {
        self.study_instance_uid = uid.into();
        self
    }

    /// Study-level C-FIND identifier; empty keys ask the peer to return them
    pub fn to_request_dataset(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from("STUDY"),
        ));

        put_key(&mut obj, tags::PATIENT_NAME, VR::PN, &self.patient_name);
        put_key(&mut obj, tags::PATIENT_ID, VR::LO, &self.patient_id);
        put_key(&mut obj, tags::ACCESSION_NUMBER, VR::SH, &self.accession_number);
        put_key(&mut obj, tags::STUDY_DATE, VR::DA, &self.study_date);
        put_key(&mut obj, tags::MODALITIES_IN_STUDY, VR::CS, &self.modality);
        put_key(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, &self.study_instance_uid);
        put_key(&mut obj, tags::STUDY_DESCRIPTION, VR::LO, "");
        put_key(&mut obj, tags::NUMBER_OF_STUDY_RELATED_SERIES, VR::IS, "");
        put_key(&mut obj, tags::NUMBER_OF_STUDY_RELATED_INSTANCES, VR::IS, "");
        obj
    }

    /// Parse a C-FIND response identifier
    pub fn from_response(mut obj: InMemDicomObject) -> Self {
        for tag in STRIPPED_RESPONSE_TAGS {
            obj.remove_element(tag);
        }

        let text = |tag| read_string(&obj, tag).unwrap_or_default();
        let count = |tag| read_string(&obj, tag).and_then(|v| v.trim().parse::<u32>().ok());

        Self {
            patient_name: text(tags::PATIENT_NAME),
            patient_id: text(tags::PATIENT_ID),
            accession_number: text(tags::ACCESSION_NUMBER),
            study_date: text(tags::STUDY_DATE),
            modality: text(tags::MODALITIES_IN_STUDY),
            study_instance_uid: text(tags::STUDY_INSTANCE_UID),
            study_description: text(tags::STUDY_DESCRIPTION),
            number_of_series: count(tags::NUMBER_OF_STUDY_RELATED_SERIES),
            number_of_instances: count(tags::NUMBER_OF_STUDY_RELATED_INSTANCES),
            dataset: Some(obj),
        }
    }
}

fn put_key(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
    let value = if value.is_empty() {
        PrimitiveValue::Empty
    } else {
        PrimitiveValue::from(value)
    };
    obj.put(DataElement::new(tag, vr, value));
}

/// One C-FIND response as delivered to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct FindResponse {
    pub status: u16,
    pub identifier: Option<QueryIdentifier>,
}

/// One C-MOVE progress record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveProgress {
    pub status: u16,
    pub remaining: u32,
    pub completed: u32,
    pub failed: u32,
    pub warning: u32,
}

impl MoveProgress {
    /// Progress record from a C-MOVE response; absent counters read as zero
    pub fn from_command(cmd: &CommandSet, status: u16) -> Self {
        Self {
            status,
            remaining: cmd.remaining.unwrap_or(0),
            completed: cmd.completed.unwrap_or(0),
            failed: cmd.failed.unwrap_or(0),
            warning: cmd.warning.unwrap_or(0),
        }
    }

    /// Whether this is the last record of the sequence
    pub fn is_terminal(&self) -> bool {
        DimseStatus::from_code(self.status).is_terminal()
    }

    /// The peer does not know the requested move destination
    pub fn is_unknown_destination(&self) -> bool {
        self.status == status::C_MOVE_UNKNOWN_AE
    }
}

/// Everything a synchronous C-MOVE observed
///
/// Records received before a failure are kept alongside the error that ended
/// the exchange.
#[derive(Debug, Default)]
pub struct MoveOutcome {
    pub records: Vec<MoveProgress>,
    pub error: Option<DimseError>,
}

impl MoveOutcome {
    /// The final record, when the exchange reached one
    pub fn last(&self) -> Option<&MoveProgress> {
        self.records.last()
    }

    /// The exchange ended with a terminal record and no error
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.last().is_some_and(MoveProgress::is_terminal)
    }

    /// Drop the partial records and keep only the failure, if any
    pub fn into_result(self) -> Result<Vec<MoveProgress>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.records),
        }
    }
}

impl std::fmt::Display for MoveProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: remaining {}, completed {}, failed {}, warning {}",
            DimseStatus::from_code(self.status),
            self.remaining,
            self.completed,
            self.failed,
            self.warning
        )
    }
}
