use crate::{
    ack_tracker::{AckTracker, Acknowledgement, PublishState, Reception},
    codec::{Mqtt311, WireFormat},
    de::PacketReader,
    design_parameters::MAX_TOPICS_PER_SUBSCRIPTION,
    network_manager::{InterfaceHolder, Transport},
    packet_id::PacketIdAllocator,
    packets::{
        ConnAck, Connect, Packet, Pub, PubAck, PubComp, PubRec, PubRel, SubAck, Subscribe,
        TopicList, UnsubAck, Unsubscribe,
    },
    publication::{Publication, RetryPolicy},
    scheduler::{
        Cancellation, Expiry, OperationHandle, OperationKind, PendingOperation, Retry, Scheduler,
    },
    session_state::SessionState,
    subscriptions::{valid_topic_filter, MessageCallback, Subscriptions, TopicFilter},
    types::Utf8String,
    uptime::Uptime,
    Config, ConnectionError, DecodeError, DisconnectReason, EncodeError, Error, Handler, Message,
    OperationError, ProtocolError, QoS,
};

use embedded_time::Clock;
use heapless::Vec;

mod sm {

    use smlang::statemachine;

    statemachine! {
        transitions: {
            *Disconnected + Connect = Connecting,
            Connecting + ConnAck = Connected,
            Connected + Disconnect = Disconnecting,
            Connecting + TearDown = Disconnected,
            Connected + TearDown = Disconnected,
            Disconnecting + TearDown = Disconnected,
        }
    }

    pub struct Context;

    impl StateMachineContext for Context {}
}

use sm::{Context, Events, StateMachine, States};

/// The state of the MQTT connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,

    /// A CONNECT was queued or sent and no CONNACK has arrived.
    Connecting,
    Connected,

    /// A graceful disconnect was requested and the DISCONNECT has not been written yet.
    Disconnecting,
}

type Awaited = Option<(OperationHandle, Option<Result<(), OperationError>>)>;

/// The engine that owns an MQTT session over a [Transport].
///
/// Requests are submitted through [Engine::client] and performed by [Engine::poll], which must
/// be called periodically.
pub struct Engine<T, C, H, W, const MSG_SIZE: usize, const MSG_COUNT: usize>
where
    T: Transport,
    C: Clock,
    H: Handler,
    W: WireFormat,
{
    client: MqttClient<T, C, H, W, MSG_SIZE, MSG_COUNT>,
    packet_reader: PacketReader<MSG_SIZE>,
}

/// The request interface and session state of an [Engine].
pub struct MqttClient<T, C, H, W, const MSG_SIZE: usize, const MSG_COUNT: usize>
where
    T: Transport,
    C: Clock,
    H: Handler,
    W: WireFormat,
{
    network: InterfaceHolder<T, MSG_SIZE>,
    clock: C,
    uptime: Uptime<C>,
    handler: H,
    wire: W,
    config: Config,
    connection_state: StateMachine<Context>,
    session_state: SessionState,
    packet_ids: PacketIdAllocator,
    tracker: AckTracker<MSG_SIZE, MSG_COUNT>,
    scheduler: Scheduler<MSG_SIZE, MSG_COUNT>,
    subscriptions: Subscriptions<H>,
    tx_buffer: [u8; MSG_SIZE],
    awaiting: Awaited,
    disconnect_sent: bool,
}

impl<T, C, H, W, const MSG_SIZE: usize, const MSG_COUNT: usize>
    MqttClient<T, C, H, W, MSG_SIZE, MSG_COUNT>
where
    T: Transport,
    C: Clock,
    C::T: Into<u64>,
    H: Handler,
    W: WireFormat,
{
    /// Begin connecting to the broker.
    ///
    /// # Note
    /// The transport must already be connected to the broker. The CONNECT is written on the next
    /// [Engine::poll].
    ///
    /// # Returns
    /// A handle that completes once the broker accepts or refuses the connection.
    pub fn connect(&mut self) -> Result<OperationHandle, Error<T::Error>> {
        if self.connection_state.state() != &States::Disconnected {
            return Err(Error::NotReady);
        }

        let now = self.now_ms()?;
        let connect = Connect {
            keep_alive: self.config.keepalive_interval,
            client_id: self.config.client_id.as_str(),
            clean_session: self.config.clean_session,
            will: self.config.will.as_ref().map(|will| will.message()),
            username: self.config.username.as_deref(),
            password: self.config.password.as_deref(),
        };

        let retry = Retry {
            count: 0,
            limit: 0,
            period_ms: self.config.response_timeout_ms as u64,
        };

        let packet = self
            .wire
            .encode(&Packet::Connect(connect), &mut self.tx_buffer)?;
        let handle = self
            .scheduler
            .submit(OperationKind::Connect, None, packet, retry, now)?;

        self.connection_state
            .process_event(Events::Connect)
            .map_err(|_| Error::NotReady)?;

        info!("Connecting as `{}`", self.config.client_id.as_str());
        Ok(handle)
    }

    /// Gracefully end the session.
    ///
    /// # Note
    /// Every pending operation fails with [OperationError::Disconnected]. If the connection is
    /// still being established, it is abandoned immediately without a DISCONNECT.
    pub fn disconnect(&mut self) -> Result<(), Error<T::Error>> {
        match self.connection_state.state() {
            States::Connected => {
                self.connection_state
                    .process_event(Events::Disconnect)
                    .map_err(|_| Error::NotReady)?;
                self.disconnect_sent = false;
                info!("Disconnecting");
                Ok(())
            }
            States::Connecting => {
                self.teardown(DisconnectReason::ClientInitiated);
                Ok(())
            }
            _ => Err(Error::NotReady),
        }
    }

    /// Publish a message over MQTT.
    ///
    /// # Note
    /// Publications may be submitted while connecting. They are sent once the connection is
    /// established. A [QoS::AtMostOnce] publication completes as soon as it is written.
    pub fn publish(
        &mut self,
        publication: Publication<'_>,
    ) -> Result<OperationHandle, Error<T::Error>> {
        self.check_submission()?;

        let qos = publication.qos;
        let kind = OperationKind::Publish(qos);
        let retry = self.retry_policy(publication.retries);

        if qos == QoS::AtMostOnce {
            let packet = Packet::Publish(publication.to_packet(None));
            return self.enqueue(kind, None, &packet, retry);
        }

        if !self.scheduler.has_capacity() || !self.tracker.can_track() {
            return Err(OperationError::NoCapacity.into());
        }

        let id = self.packet_ids.next()?;
        if let Err(err) = self.tracker.track(id, qos) {
            self.packet_ids.release(id);
            return Err(err.into());
        }

        let packet = Packet::Publish(publication.to_packet(Some(id)));
        match self.enqueue(kind, Some(id), &packet, retry) {
            Ok(handle) => {
                debug!("Publishing to `{}`: {}", publication.topic, id);
                Ok(handle)
            }
            Err(err) => {
                self.tracker.forget(id);
                self.packet_ids.release(id);
                Err(err)
            }
        }
    }

    /// Subscribe to one or more topic filters.
    ///
    /// # Note
    /// With a clean session, subscriptions end with the connection and must be renewed. A
    /// persistent session keeps them if the broker reports the session as present on reconnect.
    ///
    /// # Args
    /// * `filters` - The filters to subscribe to, at most
    /// [MAX_TOPICS_PER_SUBSCRIPTION](crate::design_parameters::MAX_TOPICS_PER_SUBSCRIPTION).
    /// * `callback` - Receives messages matching these filters instead of [Handler::on_message].
    pub fn subscribe(
        &mut self,
        filters: &[TopicFilter<'_>],
        callback: Option<MessageCallback<H>>,
    ) -> Result<OperationHandle, Error<T::Error>> {
        self.check_submission()?;

        if filters.is_empty() || filters.len() > MAX_TOPICS_PER_SUBSCRIPTION {
            return Err(EncodeError::InvalidField.into());
        }

        if !self.scheduler.has_capacity() {
            return Err(OperationError::NoCapacity.into());
        }

        let id = self.packet_ids.next()?;
        let packet = Packet::Subscribe(Subscribe {
            packet_id: id,
            topics: TopicList::Entries(filters),
        });

        let retry = self.retry_policy(None);
        let handle = match self.enqueue(OperationKind::Subscribe, Some(id), &packet, retry) {
            Ok(handle) => handle,
            Err(err) => {
                self.packet_ids.release(id);
                return Err(err);
            }
        };

        if let Err(err) = self.subscriptions.add_pending(filters, callback) {
            self.scheduler.remove(handle);
            self.packet_ids.release(id);
            return Err(err.into());
        }

        for filter in filters {
            info!("Subscribing to `{}`: {}", filter.topic(), id);
        }

        Ok(handle)
    }

    /// Register subscriptions the broker holds from an earlier persistent session.
    ///
    /// # Note
    /// Must be called before [MqttClient::connect]. The filters become active if the CONNACK
    /// reports the session as present and are dropped otherwise. Nothing is sent to the broker.
    ///
    /// # Args
    /// * `filters` - The filters of the earlier session. Their QoS is taken as granted.
    /// * `callback` - Receives messages matching these filters instead of [Handler::on_message].
    pub fn restore_subscriptions(
        &mut self,
        filters: &[TopicFilter<'_>],
        callback: Option<MessageCallback<H>>,
    ) -> Result<(), Error<T::Error>> {
        if self.connection_state.state() != &States::Disconnected {
            return Err(Error::NotReady);
        }

        if filters
            .iter()
            .any(|filter| !valid_topic_filter(filter.topic()))
        {
            return Err(EncodeError::InvalidField.into());
        }

        self.subscriptions.add_stored(filters, callback)?;
        for filter in filters {
            debug!("Restored subscription to `{}`", filter.topic());
        }
        Ok(())
    }

    /// Unsubscribe from one or more topic filters.
    ///
    /// # Note
    /// Messages matching the filters are no longer routed to their subscription callbacks as
    /// soon as the request is submitted.
    pub fn unsubscribe(&mut self, filters: &[&str]) -> Result<OperationHandle, Error<T::Error>> {
        self.check_submission()?;

        let mut topics: Vec<Utf8String<'_>, MAX_TOPICS_PER_SUBSCRIPTION> = Vec::new();
        for filter in filters {
            if !valid_topic_filter(filter) {
                return Err(EncodeError::InvalidField.into());
            }
            topics
                .push(Utf8String(filter))
                .map_err(|_| EncodeError::InvalidField)?;
        }

        if topics.is_empty() {
            return Err(EncodeError::InvalidField.into());
        }

        if !self.scheduler.has_capacity() {
            return Err(OperationError::NoCapacity.into());
        }

        let id = self.packet_ids.next()?;
        let packet = Packet::Unsubscribe(Unsubscribe {
            packet_id: id,
            topics: TopicList::Entries(&topics),
        });

        let retry = self.retry_policy(None);
        let handle = match self.enqueue(OperationKind::Unsubscribe, Some(id), &packet, retry) {
            Ok(handle) => handle,
            Err(err) => {
                self.packet_ids.release(id);
                return Err(err);
            }
        };

        for filter in filters {
            info!("Unsubscribing from `{}`: {}", filter, id);
            self.subscriptions.remove(filter);
        }

        Ok(handle)
    }

    /// Cancel a pending operation.
    ///
    /// # Note
    /// An operation that was not yet written is removed without any callback. Once written, the
    /// request proceeds but its completion is no longer reported to the [Handler].
    pub fn cancel(&mut self, handle: OperationHandle) -> Result<Cancellation, OperationError> {
        let operation = self
            .scheduler
            .get_mut(handle)
            .ok_or(OperationError::UnknownOperation)?;

        if operation.dispatched {
            operation.notify = false;
            return Ok(Cancellation::Suppressed);
        }

        let operation = self
            .scheduler
            .remove(handle)
            .ok_or(OperationError::UnknownOperation)?;
        self.release(&operation);

        if operation.kind == OperationKind::Connect {
            self.teardown(DisconnectReason::ClientInitiated);
        }

        Ok(Cancellation::Removed)
    }

    /// Determine if the client has established a connection with the broker.
    pub fn is_connected(&self) -> bool {
        self.connection_state.state() == &States::Connected
    }

    pub fn status(&self) -> ConnectionStatus {
        match self.connection_state.state() {
            States::Disconnected => ConnectionStatus::Disconnected,
            States::Connecting => ConnectionStatus::Connecting,
            States::Connected => ConnectionStatus::Connected,
            States::Disconnecting => ConnectionStatus::Disconnecting,
        }
    }

    /// Determine if the broker indicated it resumed a previous session.
    pub fn session_present(&self) -> bool {
        self.session_state.session_present
    }

    /// The number of submitted operations that have not completed.
    pub fn pending_operations(&self) -> usize {
        self.scheduler.len()
    }

    /// The acknowledgement state of an outgoing publication.
    pub fn publish_state(&self, packet_id: u16) -> Option<PublishState> {
        self.tracker.publish_state(packet_id)
    }

    /// Determine if a publication at `qos` can currently be accepted.
    pub fn can_publish(&self, qos: QoS) -> bool {
        let connection = matches!(
            self.connection_state.state(),
            States::Connecting | States::Connected
        );

        let tracked = qos == QoS::AtMostOnce
            || (self.tracker.can_track() && self.packet_ids.in_flight() < u16::MAX as usize);

        connection && self.scheduler.has_capacity() && tracked
    }

    /// Check if the broker has granted a subscription for exactly this filter.
    pub fn is_subscribed(&self, filter: &str) -> bool {
        self.subscriptions.is_subscribed(filter)
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn transport(&self) -> &T {
        self.network.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.network.transport_mut()
    }

    fn now_ms(&mut self) -> Result<u64, Error<T::Error>> {
        let now = self.clock.try_now()?;
        Ok(self.uptime.update(now))
    }

    fn check_submission(&self) -> Result<(), Error<T::Error>> {
        match self.connection_state.state() {
            States::Connecting | States::Connected => Ok(()),
            States::Disconnecting => Err(OperationError::Shutdown.into()),
            States::Disconnected => Err(Error::NotReady),
        }
    }

    fn retry_policy(&self, policy: Option<RetryPolicy>) -> Retry {
        let policy = policy.unwrap_or(RetryPolicy {
            limit: self.config.retry_limit,
            period_ms: self.config.response_timeout_ms,
        });

        Retry {
            count: 0,
            limit: policy.limit,
            period_ms: policy.period_ms as u64,
        }
    }

    fn enqueue(
        &mut self,
        kind: OperationKind,
        packet_id: Option<u16>,
        packet: &Packet<'_>,
        retry: Retry,
    ) -> Result<OperationHandle, Error<T::Error>> {
        let now = self.now_ms()?;
        let packet = self.wire.encode(packet, &mut self.tx_buffer)?;
        Ok(self.scheduler.submit(kind, packet_id, packet, retry, now)?)
    }

    /// Write a control packet that is not tracked by the operation table.
    fn send(&mut self, packet: &Packet<'_>, now: u64) -> Result<(), Error<T::Error>> {
        let data = self.wire.encode(packet, &mut self.tx_buffer)?;
        self.network.write(data)?;
        self.session_state.register_send(now);
        Ok(())
    }

    /// Report the terminal result of an operation.
    fn finish(
        &mut self,
        operation: &PendingOperation<MSG_SIZE>,
        result: Result<(), OperationError>,
    ) {
        if let Some((handle, slot)) = self.awaiting.as_mut() {
            if *handle == operation.handle {
                slot.replace(result);
            }
        }

        if let Some(completion) = operation.completion(result) {
            self.handler.on_complete(&completion);
        }
    }

    /// Free the resources of an operation that will never be acknowledged.
    fn release(&mut self, operation: &PendingOperation<MSG_SIZE>) {
        if let Some(id) = operation.packet_id {
            self.packet_ids.release(id);
            self.tracker.forget(id);
        }

        if operation.kind == OperationKind::Subscribe {
            if let Ok((Packet::Subscribe(request), _)) = self.wire.decode(&operation.packet) {
                for filter in request.topics.iter() {
                    self.subscriptions.abandon(filter.topic());
                }
            }
        }
    }

    /// End the session, failing everything that is in flight.
    fn teardown(&mut self, reason: DisconnectReason) {
        if self.connection_state.process_event(Events::TearDown).is_err() {
            return;
        }

        match reason {
            DisconnectReason::ClientInitiated => info!("Session closed"),
            _ => error!("Connection lost: {:?}", reason),
        }

        self.network.discard_pending();

        let failed = self.scheduler.drain();
        for operation in failed.iter() {
            if let Some(id) = operation.packet_id {
                self.packet_ids.release(id);
            }
            self.finish(operation, Err(OperationError::Disconnected(reason)));
        }

        for id in self.tracker.fail_all().iter() {
            self.packet_ids.release(*id);
        }

        if self.config.clean_session {
            self.subscriptions.clear();
        } else {
            self.subscriptions.suspend();
        }
        self.session_state.reset();
        self.disconnect_sent = false;

        self.handler.on_disconnect(reason);
    }

    fn handle_packet(
        &mut self,
        packet: Packet<'_>,
        raw: &[u8],
        now: u64,
    ) -> Result<(), Error<T::Error>> {
        debug!("Received {:?}", packet.message_type());

        match self.connection_state.state() {
            States::Connecting => {
                return match packet {
                    Packet::ConnAck(connack) => self.handle_connection_acknowledge(connack, now),
                    _ => {
                        error!(
                            "Received {:?} before CONNACK",
                            packet.message_type()
                        );
                        Err(ProtocolError::UnexpectedPacket.into())
                    }
                };
            }
            States::Connected | States::Disconnecting => {}
            States::Disconnected => return Ok(()),
        }

        match packet {
            Packet::Publish(publish) => self.handle_publish(publish, raw, now),

            Packet::PubAck(PubAck { packet_id }) => {
                let ack = self.tracker.on_puback(packet_id)?;
                self.handle_publish_acknowledge(packet_id, ack);
                Ok(())
            }

            Packet::PubRec(PubRec { packet_id }) => match self.tracker.on_pubrec(packet_id)? {
                Acknowledgement::Advanced(_) | Acknowledgement::Duplicate => {
                    self.send(&Packet::PubRel(PubRel { packet_id }), now)
                }
                // The broker keeps retransmitting the PUBREC until it is released.
                Acknowledgement::Unknown => {
                    warn!("Releasing PUBREC for unknown publication {}", packet_id);
                    self.send(&Packet::PubRel(PubRel { packet_id }), now)
                }
                ack => {
                    self.handle_publish_acknowledge(packet_id, ack);
                    Ok(())
                }
            },

            Packet::PubComp(PubComp { packet_id }) => {
                let ack = self.tracker.on_pubcomp(packet_id)?;
                self.handle_publish_acknowledge(packet_id, ack);
                Ok(())
            }

            Packet::PubRel(PubRel { packet_id }) => {
                if let Some(stored) = self.tracker.on_pubrel(packet_id)? {
                    if let (Packet::Publish(publish), _) = self.wire.decode(&stored)? {
                        self.deliver(&publish);
                    }
                } else {
                    debug!("Repeated PUBREL for {}", packet_id);
                }

                self.send(&Packet::PubComp(PubComp { packet_id }), now)
            }

            Packet::SubAck(suback) => self.handle_subscription_acknowledge(suback),

            Packet::UnsubAck(UnsubAck { packet_id }) => {
                match self
                    .scheduler
                    .complete_packet(|kind| kind == OperationKind::Unsubscribe, packet_id)
                {
                    Some(operation) => {
                        self.packet_ids.release(packet_id);
                        self.finish(&operation, Ok(()));
                    }
                    None => warn!("Ignoring UNSUBACK for unknown request {}", packet_id),
                }
                Ok(())
            }

            Packet::PingResp => {
                if !self.session_state.register_ping_response() {
                    warn!("Ignoring unsolicited PINGRESP");
                }
                Ok(())
            }

            _ => {
                error!(
                    "Received invalid {:?} from the broker",
                    packet.message_type()
                );
                Err(ProtocolError::UnexpectedPacket.into())
            }
        }
    }

    fn handle_connection_acknowledge(
        &mut self,
        acknowledge: ConnAck,
        now: u64,
    ) -> Result<(), Error<T::Error>> {
        let operation = self.scheduler.complete_connect();

        if !acknowledge.code.accepted() {
            error!("Connection refused: {:?}", acknowledge.code);
            if let Some(operation) = operation {
                self.finish(&operation, Err(OperationError::Refused(acknowledge.code)));
            }
            return Err(ConnectionError::Refused(acknowledge.code).into());
        }

        self.connection_state
            .process_event(Events::ConnAck)
            .map_err(|_| ProtocolError::UnexpectedPacket)?;

        self.session_state.register_connection(
            self.config.keepalive_interval,
            acknowledge.session_present,
            now,
        );
        self.subscriptions.resume(acknowledge.session_present);

        info!(
            "Connected (session present: {})",
            acknowledge.session_present
        );

        if let Some(operation) = operation {
            self.finish(&operation, Ok(()));
        }

        Ok(())
    }

    fn handle_publish(
        &mut self,
        publish: Pub<'_>,
        raw: &[u8],
        now: u64,
    ) -> Result<(), Error<T::Error>> {
        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => {
                self.deliver(&publish);
                Ok(())
            }

            (QoS::AtLeastOnce, Some(packet_id)) => {
                self.deliver(&publish);
                self.send(&Packet::PubAck(PubAck { packet_id }), now)
            }

            // Exactly-once messages are held until the broker releases them.
            (QoS::ExactlyOnce, Some(packet_id)) => {
                match self.tracker.receive(packet_id, raw) {
                    Ok(Reception::New) => {}
                    Ok(Reception::Duplicate) => {
                        debug!("Repeated QoS 2 publication {}", packet_id)
                    }
                    Err(_) => {
                        warn!(
                            "No space for QoS 2 publication {}, awaiting retransmission",
                            packet_id
                        );
                        return Ok(());
                    }
                }

                self.send(&Packet::PubRec(PubRec { packet_id }), now)?;
                self.tracker.pubrec_sent(packet_id);
                Ok(())
            }

            _ => Err(ProtocolError::Malformed(DecodeError::MalformedPacket).into()),
        }
    }

    fn handle_publish_acknowledge(&mut self, packet_id: u16, ack: Acknowledgement) {
        match ack {
            Acknowledgement::Completed => {
                self.packet_ids.release(packet_id);
                if let Some(operation) = self
                    .scheduler
                    .complete_packet(|kind| matches!(kind, OperationKind::Publish(_)), packet_id)
                {
                    self.finish(&operation, Ok(()));
                }
            }
            Acknowledgement::Unknown => {
                warn!("Ignoring acknowledgement for unknown publication {}", packet_id)
            }
            Acknowledgement::Advanced(_) | Acknowledgement::Duplicate => {}
        }
    }

    fn handle_subscription_acknowledge(
        &mut self,
        acknowledge: SubAck<'_>,
    ) -> Result<(), Error<T::Error>> {
        let packet_id = acknowledge.packet_id;
        let Some(operation) = self
            .scheduler
            .complete_packet(|kind| kind == OperationKind::Subscribe, packet_id)
        else {
            warn!("Ignoring SUBACK for unknown request {}", packet_id);
            return Ok(());
        };

        self.packet_ids.release(packet_id);

        let (Packet::Subscribe(request), _) = self.wire.decode(&operation.packet)? else {
            return Err(DecodeError::MalformedPacket.into());
        };

        if request.topics.iter().count() != acknowledge.return_codes.len() {
            error!("SUBACK {} does not match its request", packet_id);
            let reason = DisconnectReason::ProtocolError;
            self.finish(&operation, Err(OperationError::Disconnected(reason)));
            return Err(ProtocolError::Malformed(DecodeError::MalformedPacket).into());
        }

        let mut granted = true;
        for (filter, code) in request.topics.iter().zip(acknowledge.codes()) {
            granted &= self.subscriptions.acknowledge(filter.topic(), code);
        }

        let result = if granted {
            Ok(())
        } else {
            Err(OperationError::SubscriptionRefused)
        };
        self.finish(&operation, result);
        Ok(())
    }

    /// Route an application message to its subscription callbacks or the handler.
    fn deliver(&mut self, publish: &Pub<'_>) {
        let message = Message {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
        };

        let (callbacks, matched) = self.subscriptions.route(publish.topic);
        if !matched {
            debug!("No active subscription matches `{}`", publish.topic);
        }

        if callbacks.is_empty() {
            self.handler.on_message(&message);
        } else {
            for callback in callbacks.iter() {
                callback(&mut self.handler, &message);
            }
        }
    }

    fn handle_timers(&mut self, now: u64) -> Result<(), Error<T::Error>> {
        while let Some(expiry) = self.scheduler.expire(now) {
            match expiry {
                Expiry::Retry(handle) => self.retransmit(handle, now)?,
                Expiry::Failed(operation) => {
                    self.release(&operation);
                    self.finish(&operation, Err(OperationError::Timeout));

                    if operation.kind == OperationKind::Connect {
                        return Err(ConnectionError::ConnectTimeout.into());
                    }
                }
            }
        }

        // If we are not connected, there's no keep-alive to manage.
        if self.connection_state.state() != &States::Connected {
            return Ok(());
        }

        if self.session_state.ping_expired(now) {
            return Err(ConnectionError::KeepAliveTimeout.into());
        }

        if self.session_state.ping_due(now) {
            self.session_state.register_ping(now);

            // Note: If the transport is busy, the ping timeout still runs so a stalled transport
            // is eventually detected.
            if self.network.ready() {
                debug!("Sending PINGREQ");
                self.send(&Packet::PingReq, now)?;
            }
        }

        Ok(())
    }

    fn retransmit(&mut self, handle: OperationHandle, now: u64) -> Result<(), Error<T::Error>> {
        if !self.network.ready() {
            warn!("Transport busy, skipping retransmission");
            return Ok(());
        }

        let Some(operation) = self.scheduler.get_mut(handle) else {
            return Ok(());
        };

        if let (OperationKind::Publish(_), Some(packet_id)) = (operation.kind, operation.packet_id)
        {
            // The broker already has the message, only the release is outstanding.
            if self.tracker.publish_state(packet_id) == Some(PublishState::AwaitingPubComp) {
                return self.send(&Packet::PubRel(PubRel { packet_id }), now);
            }

            // Set the DUP flag of the fixed header.
            if let Some(header) = operation.packet.first_mut() {
                *header |= 1 << 3;
            }
        }

        self.network.write(&operation.packet)?;
        self.session_state.register_send(now);
        Ok(())
    }

    /// Write queued requests in submission order.
    fn dispatch(&mut self, now: u64) -> Result<(), Error<T::Error>> {
        let connecting = match self.connection_state.state() {
            States::Connecting => true,
            States::Connected => false,
            _ => return Ok(()),
        };

        while self.network.ready() {
            // Only the CONNECT may be written before the CONNACK arrives.
            let Some(operation) = self
                .scheduler
                .next_dispatch(|kind| (kind == OperationKind::Connect) == connecting)
            else {
                break;
            };

            let (handle, kind, packet_id) = (operation.handle, operation.kind, operation.packet_id);
            self.network.write(&operation.packet)?;
            self.session_state.register_send(now);
            debug!("Sent {:?}", kind);

            match (kind, packet_id) {
                (OperationKind::Publish(QoS::AtMostOnce), _) => {
                    if let Some(operation) = self.scheduler.remove(handle) {
                        self.finish(&operation, Ok(()));
                    }
                }
                (OperationKind::Publish(_), Some(id)) => {
                    self.tracker.sent(id);
                    self.scheduler.mark_dispatched(handle, now);
                }
                _ => self.scheduler.mark_dispatched(handle, now),
            }
        }

        Ok(())
    }

    fn handle_disconnecting(&mut self, now: u64) -> Result<(), Error<T::Error>> {
        if self.connection_state.state() != &States::Disconnecting || !self.network.ready() {
            return Ok(());
        }

        if !self.disconnect_sent {
            info!("Sending DISCONNECT");
            self.send(&Packet::Disconnect, now)?;
            self.disconnect_sent = true;

            if !self.network.ready() {
                return Ok(());
            }
        }

        self.teardown(DisconnectReason::ClientInitiated);
        Ok(())
    }
}

/// Determine why the session ends because of an error raised while polling.
fn disconnect_reason<E>(error: &Error<E>) -> DisconnectReason {
    match error {
        Error::Network(_) | Error::Connection(ConnectionError::Network) => {
            DisconnectReason::NetworkError
        }
        Error::Connection(ConnectionError::Refused(_)) => DisconnectReason::ServerRefused,
        Error::Connection(ConnectionError::KeepAliveTimeout) => DisconnectReason::KeepAliveTimeout,
        Error::Connection(ConnectionError::ConnectTimeout) => DisconnectReason::Timeout,
        _ => DisconnectReason::ProtocolError,
    }
}

impl<T, C, H, const MSG_SIZE: usize, const MSG_COUNT: usize>
    Engine<T, C, H, Mqtt311, MSG_SIZE, MSG_COUNT>
where
    T: Transport,
    C: Clock,
    C::T: Into<u64>,
    H: Handler,
{
    /// Construct a new MQTT engine speaking MQTT 3.1.1.
    ///
    /// # Args
    /// * `transport` - A byte stream connected to the broker.
    /// * `clock` - The clock used for keep-alive, timeouts and retransmission.
    /// * `handler` - Receives messages, completions and disconnections.
    /// * `config` - The session configuration.
    pub fn new(transport: T, clock: C, handler: H, config: Config) -> Self {
        Self::with_wire_format(transport, clock, handler, Mqtt311, config)
    }
}

impl<T, C, H, W, const MSG_SIZE: usize, const MSG_COUNT: usize>
    Engine<T, C, H, W, MSG_SIZE, MSG_COUNT>
where
    T: Transport,
    C: Clock,
    C::T: Into<u64>,
    H: Handler,
    W: WireFormat,
{
    /// Construct a new engine using an alternative wire format.
    pub fn with_wire_format(transport: T, clock: C, handler: H, wire: W, config: Config) -> Self {
        let scheduler = Scheduler::new(config.retry_ceiling_ms as u64);
        let session_state = SessionState::new(config.ping_timeout_ms as u64);

        Self {
            client: MqttClient {
                network: InterfaceHolder::new(transport),
                clock,
                uptime: Uptime::new(),
                handler,
                wire,
                config,
                connection_state: StateMachine::new(Context),
                session_state,
                packet_ids: PacketIdAllocator::new(),
                tracker: AckTracker::default(),
                scheduler,
                subscriptions: Subscriptions::default(),
                tx_buffer: [0; MSG_SIZE],
                awaiting: None,
                disconnect_sent: false,
            },
            packet_reader: PacketReader::new(),
        }
    }

    /// Access the request interface.
    pub fn client(&mut self) -> &mut MqttClient<T, C, H, W, MSG_SIZE, MSG_COUNT> {
        &mut self.client
    }

    /// Perform all pending work: receive and handle packets, service timers and write queued
    /// requests.
    ///
    /// # Note
    /// Any error other than [Error::Clock] ends the session. The [Handler] is notified before
    /// the error is returned.
    pub fn poll(&mut self) -> Result<(), Error<T::Error>> {
        let now = self.client.now_ms()?;

        let result = self.process(now);
        if let Err(err) = &result {
            self.client.teardown(disconnect_reason(err));
        }

        // Buffered bytes belong to the old connection.
        if self.client.connection_state.state() == &States::Disconnected {
            self.packet_reader.reset();
        }

        result
    }

    /// Drive [Engine::poll] until an operation completes.
    ///
    /// # Note
    /// The completion is still reported to [Handler::on_complete] unless it was cancelled.
    ///
    /// # Returns
    /// The result of the operation. Errors ending the session are returned as the operation's
    /// [OperationError::Disconnected] failure.
    pub fn wait(&mut self, handle: OperationHandle) -> Result<(), Error<T::Error>> {
        if self.client.scheduler.get(handle).is_none() {
            return Err(OperationError::UnknownOperation.into());
        }

        self.client.awaiting.replace((handle, None));

        let result = loop {
            let polled = self.poll();

            if let Some((_, Some(result))) = self.client.awaiting {
                break result.map_err(Error::Operation);
            }

            if let Err(err) = polled {
                break Err(err);
            }

            // The operation was cancelled.
            if self.client.scheduler.get(handle).is_none() {
                break Err(OperationError::UnknownOperation.into());
            }
        };

        self.client.awaiting = None;
        result
    }

    fn process(&mut self, now: u64) -> Result<(), Error<T::Error>> {
        if self.client.connection_state.state() == &States::Disconnected {
            return Ok(());
        }

        self.client.network.finish_write()?;
        self.client.dispatch(now)?;
        self.receive(now)?;
        self.client.handle_timers(now)?;
        self.client.handle_disconnecting(now)
    }

    fn receive(&mut self, now: u64) -> Result<(), Error<T::Error>> {
        let received = self
            .client
            .network
            .read(self.packet_reader.receive_buffer())?;
        self.packet_reader.commit(received);
        if received > 0 {
            debug!("Received {} bytes", received);
        }

        // Every handled packet may require a response, so only handle packets while the
        // transport can accept one.
        while self.client.network.ready() {
            let Some(_) = self.packet_reader.probe().map_err(ProtocolError::Malformed)? else {
                break;
            };

            let buffered = self.packet_reader.buffered();
            let (packet, len) = self
                .client
                .wire
                .decode(buffered)
                .map_err(ProtocolError::Malformed)?;

            let result = self.client.handle_packet(packet, &buffered[..len], now);

            // Note that the packet is removed from buffering even if handling failed.
            self.packet_reader.pop_packet(len);
            result?;
        }

        Ok(())
    }
}
