//! DIMSE command sets and their encoding
//!
//! Command sets are always encoded in Implicit VR Little Endian; data sets use
//! the transfer syntax negotiated for their presentation context.

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::{entries, TransferSyntaxRegistry};

use crate::{DimseError, Result};

pub const C_STORE_RQ: u16 = 0x0001;
pub const C_STORE_RSP: u16 = 0x8001;
pub const C_FIND_RQ: u16 = 0x0020;
pub const C_FIND_RSP: u16 = 0x8020;
pub const C_MOVE_RQ: u16 = 0x0021;
pub const C_MOVE_RSP: u16 = 0x8021;
pub const C_ECHO_RQ: u16 = 0x0030;
pub const C_ECHO_RSP: u16 = 0x8030;

/// CommandDataSetType value meaning "no data set follows"
pub const NO_DATA_SET: u16 = 0x0101;
const DATA_SET_PRESENT: u16 = 0x0001;
const PRIORITY_MEDIUM: u16 = 0x0000;

/// One DIMSE message: a command set and an optional encoded data set
#[derive(Debug, Clone)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: InMemDicomObject,
    pub data: Option<Vec<u8>>,
}

/// Decoded view of the command set fields this crate uses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSet {
    pub command_field: u16,
    pub message_id: Option<u16>,
    pub message_id_being_responded_to: Option<u16>,
    pub status: Option<u16>,
    pub has_data_set: bool,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub error_comment: Option<String>,
    pub remaining: Option<u32>,
    pub completed: Option<u32>,
    pub failed: Option<u32>,
    pub warning: Option<u32>,
}

impl DimseMessage {
    /// A message without a data set
    pub fn command(presentation_context_id: u8, command: InMemDicomObject) -> Self {
        Self {
            presentation_context_id,
            command,
            data: None,
        }
    }

    /// A message carrying an already encoded data set
    pub fn with_data(presentation_context_id: u8, command: InMemDicomObject, data: Vec<u8>) -> Self {
        Self {
            presentation_context_id,
            command,
            data: Some(data),
        }
    }

    /// Decode the command set fields
    pub fn command_set(&self) -> Result<CommandSet> {
        CommandSet::from_object(&self.command)
    }
}

impl CommandSet {
    pub fn from_object(obj: &InMemDicomObject) -> Result<Self> {
        let command_field = read_u16(obj, tags::COMMAND_FIELD)
            .ok_or_else(|| DimseError::DicomObject("missing Command Field".into()))?;

        Ok(Self {
            command_field,
            message_id: read_u16(obj, tags::MESSAGE_ID),
            message_id_being_responded_to: read_u16(obj, tags::MESSAGE_ID_BEING_RESPONDED_TO),
            status: read_u16(obj, tags::STATUS),
            has_data_set: read_u16(obj, tags::COMMAND_DATA_SET_TYPE)
                .map(|v| v != NO_DATA_SET)
                .unwrap_or(false),
            affected_sop_class_uid: read_string(obj, tags::AFFECTED_SOP_CLASS_UID),
            affected_sop_instance_uid: read_string(obj, tags::AFFECTED_SOP_INSTANCE_UID),
            error_comment: read_string(obj, tags::ERROR_COMMENT),
            remaining: read_u16(obj, tags::NUMBER_OF_REMAINING_SUBOPERATIONS).map(u32::from),
            completed: read_u16(obj, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS).map(u32::from),
            failed: read_u16(obj, tags::NUMBER_OF_FAILED_SUBOPERATIONS).map(u32::from),
            warning: read_u16(obj, tags::NUMBER_OF_WARNING_SUBOPERATIONS).map(u32::from),
        })
    }

    /// Peer-provided text for a non-success status, falling back to the standard description
    pub fn status_description(&self) -> String {
        match (&self.error_comment, self.status) {
            (Some(comment), _) if !comment.is_empty() => comment.clone(),
            (_, Some(status)) => crate::status::describe(status).to_string(),
            (_, None) => "no status".to_string(),
        }
    }
}

pub fn echo_rq(message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, crate::context::VERIFICATION),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_ECHO_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [NO_DATA_SET])),
    ])
}

pub fn echo_rsp(message_id: u16, status: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, crate::context::VERIFICATION),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_ECHO_RSP])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [NO_DATA_SET])),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
    ])
}

pub fn find_rq(message_id: u16, sop_class_uid: &str) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_FIND_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [PRIORITY_MEDIUM])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
    ])
}

pub fn move_rq(message_id: u16, sop_class_uid: &str, destination_aet: &str) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_MOVE_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [PRIORITY_MEDIUM])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
        DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, destination_aet)),
    ])
}

pub fn store_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [PRIORITY_MEDIUM])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

pub fn store_rsp(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RSP])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [NO_DATA_SET])),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

/// Encode a command set (Implicit VR Little Endian)
pub fn encode_command(command: &InMemDicomObject) -> Result<Vec<u8>> {
    let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut data = Vec::new();
    command
        .write_dataset_with_ts(&mut data, &ts)
        .map_err(|e| DimseError::DicomObject(format!("could not write command set: {}", e)))?;
    Ok(data)
}

/// Decode a command set (Implicit VR Little Endian)
pub fn decode_command(data: &[u8]) -> Result<InMemDicomObject> {
    let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    InMemDicomObject::read_dataset_with_ts(data, &ts)
        .map_err(|e| DimseError::DicomObject(format!("could not read command set: {}", e)))
}

/// Encode a data set with the given transfer syntax
pub fn encode_dataset(obj: &InMemDicomObject, transfer_syntax_uid: &str) -> Result<Vec<u8>> {
    let ts = TransferSyntaxRegistry.get(transfer_syntax_uid).ok_or_else(|| {
        DimseError::DicomObject(format!("unsupported transfer syntax {}", transfer_syntax_uid))
    })?;
    let mut data = Vec::new();
    obj.write_dataset_with_ts(&mut data, ts)
        .map_err(|e| DimseError::DicomObject(format!("could not write data set: {}", e)))?;
    Ok(data)
}

/// Decode a data set with the given transfer syntax
pub fn decode_dataset(data: &[u8], transfer_syntax_uid: &str) -> Result<InMemDicomObject> {
    let ts = TransferSyntaxRegistry.get(transfer_syntax_uid).ok_or_else(|| {
        DimseError::DicomObject(format!("unsupported transfer syntax {}", transfer_syntax_uid))
    })?;
    InMemDicomObject::read_dataset_with_ts(data, ts)
        .map_err(|e| DimseError::DicomObject(format!("could not read data set: {}", e)))
}

pub(crate) fn read_u16(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<u16> {
    obj.element(tag).ok().and_then(|e| e.to_int::<u16>().ok())
}

pub(crate) fn read_string(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(|c: char| c == '\0' || c == ' ').to_string())
}
