//! The pending operation table.
//!
//! Every client-initiated request that awaits a server response is a [PendingOperation]. Requests
//! are serialized when submitted and dispatched to the transport in submission order by the
//! engine's poll tick. Every operation carries a deadline from the moment it is submitted, and
//! writing it to the transport restarts that deadline. When the deadline passes, dispatched
//! retryable operations are retransmitted with an exponentially growing wait until their retry
//! limit is exhausted. Everything else fails with [OperationError::Timeout], including requests
//! that never left the queue.
use crate::{error::OperationError, QoS};
use heapless::Vec;

/// Identifies a submitted operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationHandle(pub(crate) u32);

/// The request an operation carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Connect,
    Publish(QoS),
    Subscribe,
    Unsubscribe,
}

impl OperationKind {
    /// Whether the request may be retransmitted under the same packet identifier.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            OperationKind::Publish(QoS::AtLeastOnce)
                | OperationKind::Publish(QoS::ExactlyOnce)
                | OperationKind::Subscribe
        )
    }
}

/// The terminal result of an operation, reported through [crate::Handler::on_complete].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub handle: OperationHandle,
    pub kind: OperationKind,
    pub packet_id: Option<u16>,
    pub result: Result<(), OperationError>,
}

/// The outcome of [crate::MqttClient::cancel].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cancellation {
    /// The operation had not been dispatched and was removed. No callback will fire.
    Removed,

    /// The request is already on the wire. It continues but its callback is suppressed.
    Suppressed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Retry {
    pub count: u32,
    pub limit: u32,
    pub period_ms: u64,
}

pub(crate) struct PendingOperation<const MSG_SIZE: usize> {
    pub handle: OperationHandle,
    pub kind: OperationKind,
    pub packet_id: Option<u16>,
    pub deadline_ms: u64,
    pub dispatched: bool,
    pub retry: Retry,
    pub notify: bool,
    pub packet: Vec<u8, MSG_SIZE>,
}

impl<const MSG_SIZE: usize> PendingOperation<MSG_SIZE> {
    /// Produce the completion to report, unless the callback was suppressed.
    pub fn completion(&self, result: Result<(), OperationError>) -> Option<Completion> {
        self.notify.then_some(Completion {
            handle: self.handle,
            kind: self.kind,
            packet_id: self.packet_id,
            result,
        })
    }
}

/// What happened to an operation whose deadline passed.
pub(crate) enum Expiry<const MSG_SIZE: usize> {
    /// The operation must be retransmitted.
    Retry(OperationHandle),

    /// The operation exhausted its retries and was removed.
    Failed(PendingOperation<MSG_SIZE>),
}

pub(crate) struct Scheduler<const MSG_SIZE: usize, const MSG_COUNT: usize> {
    operations: Vec<PendingOperation<MSG_SIZE>, MSG_COUNT>,
    next_handle: u32,
    retry_ceiling_ms: u64,
}

impl<const MSG_SIZE: usize, const MSG_COUNT: usize> Scheduler<MSG_SIZE, MSG_COUNT> {
    pub fn new(retry_ceiling_ms: u64) -> Self {
        Self {
            operations: Vec::new(),
            next_handle: 0,
            retry_ceiling_ms,
        }
    }

    pub fn has_capacity(&self) -> bool {
        !self.operations.is_full()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Enqueue a serialized request.
    pub fn submit(
        &mut self,
        kind: OperationKind,
        packet_id: Option<u16>,
        packet: &[u8],
        retry: Retry,
        now_ms: u64,
    ) -> Result<OperationHandle, OperationError> {
        if self.operations.is_full() {
            return Err(OperationError::NoCapacity);
        }

        let handle = OperationHandle(self.next_handle);
        let operation = PendingOperation {
            handle,
            kind,
            packet_id,
            deadline_ms: now_ms.saturating_add(retry.period_ms),
            dispatched: false,
            retry,
            notify: true,
            packet: Vec::from_slice(packet).map_err(|_| OperationError::NoCapacity)?,
        };

        self.operations
            .push(operation)
            .map_err(|_| OperationError::NoCapacity)?;
        self.next_handle = self.next_handle.wrapping_add(1);
        Ok(handle)
    }

    /// The oldest operation not yet dispatched whose kind satisfies `eligible`.
    pub fn next_dispatch(
        &mut self,
        eligible: impl Fn(OperationKind) -> bool,
    ) -> Option<&mut PendingOperation<MSG_SIZE>> {
        self.operations
            .iter_mut()
            .find(|op| !op.dispatched && eligible(op.kind))
    }

    /// Record that an operation was written to the transport.
    pub fn mark_dispatched(&mut self, handle: OperationHandle, now_ms: u64) {
        if let Some(op) = self.get_mut(handle) {
            op.deadline_ms = now_ms.saturating_add(op.retry.period_ms);
            op.dispatched = true;
        }
    }

    pub fn get(&self, handle: OperationHandle) -> Option<&PendingOperation<MSG_SIZE>> {
        self.operations.iter().find(|op| op.handle == handle)
    }

    pub fn get_mut(&mut self, handle: OperationHandle) -> Option<&mut PendingOperation<MSG_SIZE>> {
        self.operations.iter_mut().find(|op| op.handle == handle)
    }

    /// Remove an operation regardless of its state.
    pub fn remove(&mut self, handle: OperationHandle) -> Option<PendingOperation<MSG_SIZE>> {
        let index = self.operations.iter().position(|op| op.handle == handle)?;
        self.take(index)
    }

    /// Remove the dispatched operation that a server response with `packet_id` completes.
    pub fn complete_packet(
        &mut self,
        kind: impl Fn(OperationKind) -> bool,
        packet_id: u16,
    ) -> Option<PendingOperation<MSG_SIZE>> {
        let index = self
            .operations
            .iter()
            .position(|op| op.packet_id == Some(packet_id) && kind(op.kind))?;
        self.take(index)
    }

    /// Remove the pending CONNECT.
    pub fn complete_connect(&mut self) -> Option<PendingOperation<MSG_SIZE>> {
        let index = self
            .operations
            .iter()
            .position(|op| op.kind == OperationKind::Connect)?;
        self.take(index)
    }

    /// Find an operation whose deadline has passed.
    ///
    /// Dispatched retryable operations with remaining retries are rescheduled with a doubled
    /// wait, capped at the retry ceiling. Every other expired operation is removed.
    pub fn expire(&mut self, now_ms: u64) -> Option<Expiry<MSG_SIZE>> {
        let index = self.operations.iter().position(|op| now_ms >= op.deadline_ms)?;

        let ceiling = self.retry_ceiling_ms;
        let op = &mut self.operations[index];
        if op.dispatched && op.kind.retryable() && op.retry.count < op.retry.limit {
            op.retry.count += 1;
            op.retry.period_ms = core::cmp::min(op.retry.period_ms.saturating_mul(2), ceiling);
            op.deadline_ms = now_ms.saturating_add(op.retry.period_ms);
            warn!(
                "Retrying {:?} ({}/{})",
                op.kind,
                op.retry.count,
                op.retry.limit
            );
            return Some(Expiry::Retry(op.handle));
        }

        if op.dispatched {
            warn!("{:?} timed out", op.kind);
        } else {
            warn!("{:?} timed out before it could be sent", op.kind);
        }
        self.take(index).map(Expiry::Failed)
    }

    /// The earliest deadline of any operation.
    #[cfg(test)]
    pub fn next_deadline(&self) -> Option<u64> {
        self.operations.iter().map(|op| op.deadline_ms).min()
    }

    /// Remove every operation, oldest first.
    pub fn drain(&mut self) -> Vec<PendingOperation<MSG_SIZE>, MSG_COUNT> {
        let mut drained = Vec::new();
        self.operations.reverse();
        while let Some(op) = self.operations.pop() {
            // Note(unwrap): Both vectors share the same capacity.
            drained.push(op).ok();
        }
        drained
    }

    fn take(&mut self, index: usize) -> Option<PendingOperation<MSG_SIZE>> {
        if index >= self.operations.len() {
            return None;
        }

        // Rotate the removed operation to the end to keep submission order.
        self.operations[index..].rotate_left(1);
        self.operations.pop()
    }
}
