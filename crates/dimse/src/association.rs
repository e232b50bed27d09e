//! Association lifecycle: open, exchange DIMSE messages, always release
//!
//! Every operation in this crate runs over a fresh association obtained through a
//! [`Connector`]. [`with_association`] and [`AssociationGuard`] make sure the
//! association is released (or aborted when release fails) on every exit path,
//! including panics inside the caller's closure.

use std::collections::VecDeque;
use std::io::Write;
use std::net::TcpStream;

use dicom_ul::association::{ClientAssociation, ClientAssociationOptions};
use dicom_ul::pdu::{PDataValue, PDataValueType};
use dicom_ul::Pdu;
use tracing::{debug, info, warn};

use crate::config::{Endpoint, Timeouts};
use crate::context::{trim_uid, AcceptedContext, PresentationContextSpec};
use crate::message::{decode_command, encode_command, CommandSet, DimseMessage};
use crate::{DimseError, Result};

/// One open association able to exchange DIMSE messages
pub trait Association: Send {
    /// Presentation contexts accepted by the peer
    fn contexts(&self) -> &[AcceptedContext];

    /// Send a command set and its optional data set
    fn send(&mut self, message: &DimseMessage) -> Result<()>;

    /// Block until the next complete DIMSE message arrives
    fn receive(&mut self) -> Result<DimseMessage>;

    /// Orderly release (A-RELEASE)
    fn release(&mut self) -> Result<()>;

    /// Forced shutdown (A-ABORT)
    fn abort(&mut self);
}

/// Opens associations to remote endpoints
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        local: &Endpoint,
        remote: &Endpoint,
        contexts: &[PresentationContextSpec],
        timeouts: Timeouts,
    ) -> Result<Box<dyn Association>>;
}

/// Scoped owner of an open association; releases it when dropped
pub struct AssociationGuard {
    inner: Option<Box<dyn Association>>,
    remote: String,
}

impl AssociationGuard {
    pub fn new(association: Box<dyn Association>, remote: &Endpoint) -> Self {
        Self {
            inner: Some(association),
            remote: remote.to_string(),
        }
    }

    pub fn association(&mut self) -> Result<&mut dyn Association> {
        match self.inner.as_mut() {
            Some(association) => Ok(association.as_mut()),
            None => Err(DimseError::connection("association already closed")),
        }
    }

    /// Release now instead of at drop
    pub fn release(mut self) {
        self.close();
    }

    /// Abort without attempting an orderly release
    pub fn abort(mut self) {
        if let Some(mut association) = self.inner.take() {
            debug!("Aborting association with {}", self.remote);
            association.abort();
        }
    }

    fn close(&mut self) {
        if let Some(mut association) = self.inner.take() {
            match association.release() {
                Ok(()) => debug!("Released association with {}", self.remote),
                Err(e) => {
                    warn!("Release of association with {} failed, aborting: {}", self.remote, e);
                    association.abort();
                }
            }
        }
    }
}

impl Drop for AssociationGuard {
    fn drop(&mut self) {
        self.close();
    }
}

/// Open an association, mapping any establishment failure to a connection error
pub fn open_association(
    connector: &dyn Connector,
    local: &Endpoint,
    remote: &Endpoint,
    contexts: &[PresentationContextSpec],
    timeouts: Timeouts,
) -> Result<AssociationGuard> {
    remote.validate()?;

    debug!("Opening association {} -> {}", local.ae_title, remote);
    let association = connector
        .connect(local, remote, contexts, timeouts)
        .map_err(|e| match e {
            DimseError::Connection(_) => e,
            other => DimseError::connection(format!("could not associate with {}: {}", remote, other)),
        })?;

    Ok(AssociationGuard::new(association, remote))
}

/// Run `f` over a fresh association which is always closed before returning
pub fn with_association<T, F>(
    connector: &dyn Connector,
    local: &Endpoint,
    remote: &Endpoint,
    contexts: &[PresentationContextSpec],
    timeouts: Timeouts,
    f: F,
) -> Result<T>
where
    F: FnOnce(&mut dyn Association) -> Result<T>,
{
    let mut guard = open_association(connector, local, remote, contexts, timeouts)?;
    let result = f(guard.association()?);
    guard.release();
    result
}

/// Reassembles PDVs into complete DIMSE messages
#[derive(Default)]
pub(crate) struct MessageAssembler {
    command: Vec<u8>,
    data: Vec<u8>,
    awaiting_data: Option<(u8, dicom_object::InMemDicomObject)>,
}

impl MessageAssembler {
    /// Feed one PDV; returns a message once its last fragment arrived
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<DimseMessage>> {
        let PDataValue {
            presentation_context_id,
            value_type,
            is_last,
            data,
        } = pdv;

        match value_type {
            PDataValueType::Command => {
                self.command.extend_from_slice(&data);
                if !is_last {
                    return Ok(None);
                }
                let command = decode_command(&self.command)?;
                self.command.clear();
                if CommandSet::from_object(&command)?.has_data_set {
                    self.data.clear();
                    self.awaiting_data = Some((presentation_context_id, command));
                    Ok(None)
                } else {
                    Ok(Some(DimseMessage::command(presentation_context_id, command)))
                }
            }
            PDataValueType::Data => {
                if self.awaiting_data.is_none() {
                    return Err(DimseError::connection("data fragment received before its command"));
                }
                self.data.extend_from_slice(&data);
                if !is_last {
                    return Ok(None);
                }
                match self.awaiting_data.take() {
                    Some((pc_id, command)) => Ok(Some(DimseMessage::with_data(
                        pc_id,
                        command,
                        std::mem::take(&mut self.data),
                    ))),
                    None => Err(DimseError::connection("data fragment received before its command")),
                }
            }
        }
    }
}

/// Command set PDU, always sent as a single last fragment
pub(crate) fn command_pdu(presentation_context_id: u8, command: &dicom_object::InMemDicomObject) -> Result<Pdu> {
    Ok(Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: encode_command(command)?,
        }],
    })
}

/// Connector backed by the DICOM upper layer implementation of `dicom-ul`
#[derive(Debug, Clone)]
pub struct UlConnector {
    max_pdu: u32,
}

impl UlConnector {
    pub fn new(max_pdu: u32) -> Self {
        Self { max_pdu }
    }
}

impl Connector for UlConnector {
    fn connect(
        &self,
        local: &Endpoint,
        remote: &Endpoint,
        contexts: &[PresentationContextSpec],
        timeouts: Timeouts,
    ) -> Result<Box<dyn Association>> {
        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(local.ae_title.clone())
            .called_ae_title(remote.ae_title.clone())
            .max_pdu_length(self.max_pdu)
            .connection_timeout(timeouts.connect)
            .read_timeout(timeouts.dimse.max(timeouts.acse))
            .write_timeout(timeouts.network);

        for pc in contexts {
            options = options.with_presentation_context(
                pc.abstract_syntax.clone(),
                pc.transfer_syntaxes.clone(),
            );
        }

        let association = options
            .establish_with(&remote.socket_address())
            .map_err(|e| DimseError::from_transport("association rejected or unreachable", &e))?;

        // contexts are proposed with odd ids 1, 3, 5, ... in proposal order
        let accepted: Vec<AcceptedContext> = association
            .presentation_contexts()
            .iter()
            .filter_map(|pc| {
                let index = (pc.id as usize).checked_sub(1)? / 2;
                contexts.get(index).map(|spec| AcceptedContext {
                    id: pc.id,
                    abstract_syntax: spec.abstract_syntax.clone(),
                    transfer_syntax: trim_uid(&pc.transfer_syntax).to_string(),
                })
            })
            .collect();

        if accepted.is_empty() {
            let _ = association.abort();
            return Err(DimseError::connection(format!(
                "{} accepted none of the proposed presentation contexts",
                remote
            )));
        }

        info!(
            "Association established with {} ({} presentation contexts accepted)",
            remote,
            accepted.len()
        );

        Ok(Box::new(UlAssociation {
            inner: Some(association),
            contexts: accepted,
            assembler: MessageAssembler::default(),
            ready: VecDeque::new(),
        }))
    }
}

struct UlAssociation {
    inner: Option<ClientAssociation<TcpStream>>,
    contexts: Vec<AcceptedContext>,
    assembler: MessageAssembler,
    ready: VecDeque<DimseMessage>,
}

impl UlAssociation {
    fn open(&mut self) -> Result<&mut ClientAssociation<TcpStream>> {
        self.inner
            .as_mut()
            .ok_or_else(|| DimseError::connection("association already closed"))
    }
}

impl Association for UlAssociation {
    fn contexts(&self) -> &[AcceptedContext] {
        &self.contexts
    }

    fn send(&mut self, message: &DimseMessage) -> Result<()> {
        let pdu = command_pdu(message.presentation_context_id, &message.command)?;
        let association = self.open()?;
        association
            .send(&pdu)
            .map_err(|e| DimseError::from_transport("could not send command", &e))?;

        if let Some(data) = &message.data {
            // the writer splits the data set into PDVs and flushes the last one on drop
            let mut writer = association.send_pdata(message.presentation_context_id);
            writer
                .write_all(data)
                .map_err(|e| DimseError::from_transport("could not send data set", &e))?;
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<DimseMessage> {
        loop {
            if let Some(message) = self.ready.pop_front() {
                return Ok(message);
            }

            let pdu = self
                .open()?
                .receive()
                .map_err(|e| DimseError::from_transport("could not receive response", &e))?;

            match pdu {
                Pdu::PData { data } => {
                    for pdv in data {
                        if let Some(message) = self.assembler.push(pdv)? {
                            self.ready.push_back(message);
                        }
                    }
                }
                Pdu::AbortRQ { source } => {
                    self.inner = None;
                    return Err(DimseError::connection(format!(
                        "association aborted by peer: {:?}",
                        source
                    )));
                }
                Pdu::ReleaseRQ => {
                    return Err(DimseError::connection("peer released the association mid-exchange"));
                }
                other => {
                    return Err(DimseError::connection(format!(
                        "unexpected PDU: {}",
                        other.short_description()
                    )));
                }
            }
        }
    }

    fn release(&mut self) -> Result<()> {
        match self.inner.take() {
            Some(association) => association
                .release()
                .map_err(|e| DimseError::from_transport("release failed", &e)),
            None => Ok(()),
        }
    }

    fn abort(&mut self) {
        if let Some(association) = self.inner.take() {
            if let Err(e) = association.abort() {
                debug!("Abort failed: {}", e);
            }
        }
    }
}
