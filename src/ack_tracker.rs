//! Acknowledgement tracking for QoS 1 and QoS 2 publications.
//!
//! Outgoing publications move through:
//! * QoS 1: `Send -> AwaitingPubAck -> Done`
//! * QoS 2: `Send -> AwaitingPubRec -> AwaitingPubComp -> Done`
//!
//! Incoming QoS 2 publications move through `ReceivedPublish -> AwaitingPubRel -> Done`. The
//! message is retained until the PUBREL arrives and is delivered to the application only then.
//! Incoming QoS 1 publications are acknowledged immediately and never tracked.
use crate::{
    error::{OperationError, ProtocolError},
    QoS,
};
use heapless::{LinearMap, Vec};

/// The acknowledgement state of an outgoing publication.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PublishState {
    /// Accepted but not yet written to the transport.
    Send,
    AwaitingPubAck,
    AwaitingPubRec,
    AwaitingPubComp,

    /// The acknowledgement sequence completed.
    Done,

    /// The connection was torn down before completion.
    Failed,
}

/// The state of an incoming QoS 2 publication.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IncomingState {
    /// The PUBLISH was stored and no PUBREC has been sent.
    ReceivedPublish,

    /// The PUBREC was sent.
    AwaitingPubRel,
}

/// The outcome of an acknowledgement for an outgoing publication.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Acknowledgement {
    /// The record advanced and remains tracked.
    Advanced(PublishState),

    /// The record reached [PublishState::Done] and was removed.
    Completed,

    /// The acknowledgement repeats one already processed.
    Duplicate,

    /// No record exists for the identifier.
    Unknown,
}

/// The outcome of receiving a QoS 2 PUBLISH.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reception {
    /// The publication is new and was stored.
    New,

    /// The identifier is already tracked. The message must not be delivered again.
    Duplicate,
}

#[derive(Copy, Clone, Debug)]
struct OutgoingRecord {
    qos: QoS,
    state: PublishState,
}

struct IncomingRecord<const MSG_SIZE: usize> {
    state: IncomingState,
    packet: Vec<u8, MSG_SIZE>,
}

/// Owns every in-flight publication record, keyed by packet identifier.
pub struct AckTracker<const MSG_SIZE: usize, const MSG_COUNT: usize> {
    outgoing: LinearMap<u16, OutgoingRecord, MSG_COUNT>,
    incoming: LinearMap<u16, IncomingRecord<MSG_SIZE>, MSG_COUNT>,
}

impl<const MSG_SIZE: usize, const MSG_COUNT: usize> Default for AckTracker<MSG_SIZE, MSG_COUNT> {
    fn default() -> Self {
        Self {
            outgoing: LinearMap::new(),
            incoming: LinearMap::new(),
        }
    }
}

impl<const MSG_SIZE: usize, const MSG_COUNT: usize> AckTracker<MSG_SIZE, MSG_COUNT> {
    /// Begin tracking an outgoing publication in the [PublishState::Send] state.
    pub fn track(&mut self, id: u16, qos: QoS) -> Result<PublishState, OperationError> {
        if qos == QoS::AtMostOnce || self.outgoing.contains_key(&id) {
            return Err(OperationError::UnknownOperation);
        }

        let record = OutgoingRecord {
            qos,
            state: PublishState::Send,
        };
        self.outgoing
            .insert(id, record)
            .map_err(|_| OperationError::NoCapacity)?;
        Ok(record.state)
    }

    /// Whether another outgoing publication can be tracked.
    pub fn can_track(&self) -> bool {
        self.outgoing.len() < self.outgoing.capacity()
    }

    /// Note that the PUBLISH was written to the transport.
    pub fn sent(&mut self, id: u16) -> Option<PublishState> {
        let record = self.outgoing.get_mut(&id)?;
        if record.state == PublishState::Send {
            record.state = match record.qos {
                QoS::ExactlyOnce => PublishState::AwaitingPubRec,
                _ => PublishState::AwaitingPubAck,
            };
        }

        Some(record.state)
    }

    /// Handle a PUBACK from the broker.
    pub fn on_puback(&mut self, id: u16) -> Result<Acknowledgement, ProtocolError> {
        self.complete(id, PublishState::AwaitingPubAck)
    }

    /// Handle a PUBREC from the broker. On [Acknowledgement::Advanced] or
    /// [Acknowledgement::Duplicate], a PUBREL must be sent.
    pub fn on_pubrec(&mut self, id: u16) -> Result<Acknowledgement, ProtocolError> {
        let Some(record) = self.outgoing.get_mut(&id) else {
            return Ok(Acknowledgement::Unknown);
        };

        match record.state {
            PublishState::AwaitingPubRec => {
                record.state = PublishState::AwaitingPubComp;
                Ok(Acknowledgement::Advanced(record.state))
            }
            PublishState::AwaitingPubComp => Ok(Acknowledgement::Duplicate),
            _ => Err(ProtocolError::InvalidTransition),
        }
    }

    /// Handle a PUBCOMP from the broker.
    pub fn on_pubcomp(&mut self, id: u16) -> Result<Acknowledgement, ProtocolError> {
        self.complete(id, PublishState::AwaitingPubComp)
    }

    fn complete(
        &mut self,
        id: u16,
        expected: PublishState,
    ) -> Result<Acknowledgement, ProtocolError> {
        let Some(record) = self.outgoing.get(&id) else {
            return Ok(Acknowledgement::Unknown);
        };

        if record.state != expected {
            return Err(ProtocolError::InvalidTransition);
        }

        self.outgoing.remove(&id);
        Ok(Acknowledgement::Completed)
    }

    /// The state of an outgoing publication, or `None` if it is not tracked.
    pub fn publish_state(&self, id: u16) -> Option<PublishState> {
        self.outgoing.get(&id).map(|record| record.state)
    }

    /// Remove an outgoing record without completing it.
    pub fn forget(&mut self, id: u16) {
        self.outgoing.remove(&id);
    }

    /// Store an incoming QoS 2 PUBLISH.
    ///
    /// # Args
    /// * `id` - The packet identifier of the publication.
    /// * `packet` - The complete serialized PUBLISH, delivered once the PUBREL arrives.
    pub fn receive(&mut self, id: u16, packet: &[u8]) -> Result<Reception, OperationError> {
        if self.incoming.contains_key(&id) {
            return Ok(Reception::Duplicate);
        }

        let record = IncomingRecord {
            state: IncomingState::ReceivedPublish,
            packet: Vec::from_slice(packet).map_err(|_| OperationError::NoCapacity)?,
        };

        self.incoming
            .insert(id, record)
            .map_err(|_| OperationError::NoCapacity)?;
        Ok(Reception::New)
    }

    /// Note that the PUBREC for an incoming publication was written.
    pub fn pubrec_sent(&mut self, id: u16) -> Option<IncomingState> {
        let record = self.incoming.get_mut(&id)?;
        record.state = IncomingState::AwaitingPubRel;
        Some(record.state)
    }

    /// Handle a PUBREL from the broker. A PUBCOMP must be sent in every non-error case.
    ///
    /// # Returns
    /// The stored PUBLISH if it must be delivered now, or `None` if the release repeats one
    /// already processed.
    pub fn on_pubrel(&mut self, id: u16) -> Result<Option<Vec<u8, MSG_SIZE>>, ProtocolError> {
        match self.incoming.get(&id).map(|record| record.state) {
            None => Ok(None),
            Some(IncomingState::ReceivedPublish) => Err(ProtocolError::InvalidTransition),
            Some(IncomingState::AwaitingPubRel) => {
                Ok(self.incoming.remove(&id).map(|record| record.packet))
            }
        }
    }

    pub fn incoming_state(&self, id: u16) -> Option<IncomingState> {
        self.incoming.get(&id).map(|record| record.state)
    }

    /// Fail every record as part of a connection teardown.
    ///
    /// # Returns
    /// The identifiers of the failed outgoing publications.
    pub fn fail_all(&mut self) -> Vec<u16, MSG_COUNT> {
        let mut failed = Vec::new();
        for (id, record) in self.outgoing.iter_mut() {
            record.state = PublishState::Failed;
            // Note(unwrap): Both collections share the same capacity.
            failed.push(*id).ok();
        }

        self.outgoing.clear();
        self.incoming.clear();
        failed
    }
}
