#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_nal::{nb, TcpClientStack};
use embedded_time::{fraction::Fraction, Clock};
use tinymq::{
    codec,
    packets::{ConnAck, Packet, Pub, PubAck, PubComp, PubRec, PubRel, SubAck, UnsubAck},
    Completion, Config, ConnectReturnCode, DisconnectReason, Engine, Handler, Message, Mqtt311,
    QoS, Retain, Transport,
};

pub const MSG_SIZE: usize = 256;
pub const MSG_COUNT: usize = 8;

pub type TestEngine =
    Engine<ScriptedTransport, ManualClock, Recorder, Mqtt311, MSG_SIZE, MSG_COUNT>;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A clock advanced by the test.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u32>>,
}

impl ManualClock {
    /// Advance the clock. The tick counter wraps like a hardware timer.
    pub fn advance(&self, milliseconds: u32) {
        self.now.set(self.now.get().wrapping_add(milliseconds));
    }

    pub fn now(&self) -> u32 {
        self.now.get()
    }
}

impl Clock for ManualClock {
    type T = u32;

    const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000);

    fn try_now(&self) -> Result<embedded_time::Instant<Self>, embedded_time::clock::Error> {
        Ok(embedded_time::Instant::new(self.now.get()))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Broken;

/// An in-memory byte stream. Tests inject broker bytes and inspect what the engine wrote.
#[derive(Default)]
pub struct ScriptedTransport {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,

    /// Limits the number of bytes accepted per send.
    pub window: Option<usize>,

    /// Makes every transport call fail.
    pub broken: bool,
}

impl ScriptedTransport {
    pub fn inject(&mut self, data: &[u8]) {
        self.inbound.extend(data.iter().copied());
    }

    /// Take everything written since the last call.
    pub fn take_sent(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }
}

impl Transport for ScriptedTransport {
    type Error = Broken;

    fn send(&mut self, data: &[u8]) -> Result<usize, Broken> {
        if self.broken {
            return Err(Broken);
        }

        let len = self.window.map(|window| window.min(data.len())).unwrap_or(data.len());
        self.outbound.extend_from_slice(&data[..len]);
        Ok(len)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Broken> {
        if self.broken {
            return Err(Broken);
        }

        let mut len = 0;
        while len < buf.len() {
            match self.inbound.pop_front() {
                Some(byte) => {
                    buf[len] = byte;
                    len += 1;
                }
                None => break,
            }
        }
        Ok(len)
    }
}

/// A received application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub dup: bool,
}

impl From<&Message<'_>> for Received {
    fn from(message: &Message<'_>) -> Self {
        Self {
            topic: message.topic.to_string(),
            payload: message.payload.to_vec(),
            qos: message.qos,
            dup: message.dup,
        }
    }
}

/// Records every event delivered by the engine.
#[derive(Default)]
pub struct Recorder {
    pub messages: Vec<Received>,
    pub routed: Vec<Received>,
    pub completions: Vec<Completion>,
    pub disconnects: Vec<DisconnectReason>,
}

impl Recorder {
    /// A subscription callback.
    pub fn route(&mut self, message: &Message<'_>) {
        self.routed.push(message.into());
    }
}

impl Handler for Recorder {
    fn on_message(&mut self, message: &Message<'_>) {
        self.messages.push(message.into());
    }

    fn on_complete(&mut self, completion: &Completion) {
        self.completions.push(*completion);
    }

    fn on_disconnect(&mut self, reason: DisconnectReason) {
        self.disconnects.push(reason);
    }
}

/// Serialize a broker packet.
pub fn encode(packet: Packet<'_>) -> Vec<u8> {
    let mut buffer = [0u8; MSG_SIZE];
    codec::encode(&packet, &mut buffer).unwrap().to_vec()
}

pub fn connack(code: ConnectReturnCode) -> Vec<u8> {
    encode(Packet::ConnAck(ConnAck {
        session_present: false,
        code,
    }))
}

/// An accepted CONNACK resuming a persistent session.
pub fn resumed_connack() -> Vec<u8> {
    encode(Packet::ConnAck(ConnAck {
        session_present: true,
        code: ConnectReturnCode::Accepted,
    }))
}

pub fn puback(packet_id: u16) -> Vec<u8> {
    encode(Packet::PubAck(PubAck { packet_id }))
}

pub fn pubrec(packet_id: u16) -> Vec<u8> {
    encode(Packet::PubRec(PubRec { packet_id }))
}

pub fn pubrel(packet_id: u16) -> Vec<u8> {
    encode(Packet::PubRel(PubRel { packet_id }))
}

pub fn pubcomp(packet_id: u16) -> Vec<u8> {
    encode(Packet::PubComp(PubComp { packet_id }))
}

pub fn suback(packet_id: u16, return_codes: &[u8]) -> Vec<u8> {
    encode(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

pub fn unsuback(packet_id: u16) -> Vec<u8> {
    encode(Packet::UnsubAck(UnsubAck { packet_id }))
}

pub fn pingresp() -> Vec<u8> {
    encode(Packet::PingResp)
}

pub fn publish(
    topic: &str,
    payload: &[u8],
    qos: QoS,
    packet_id: Option<u16>,
    dup: bool,
) -> Vec<u8> {
    encode(Packet::Publish(Pub {
        topic,
        packet_id,
        payload,
        qos,
        retain: Retain::NotRetained,
        dup,
    }))
}

/// Split a byte stream written by the engine into packets.
pub fn packets(mut data: &[u8]) -> Vec<Packet<'_>> {
    let mut packets = Vec::new();
    while !data.is_empty() {
        let (packet, len) = codec::decode(data).unwrap();
        packets.push(packet);
        data = &data[len..];
    }
    packets
}

pub fn engine(config: Config) -> (TestEngine, ManualClock) {
    init_logging();
    let clock = ManualClock::default();
    let mqtt = Engine::new(
        ScriptedTransport::default(),
        clock.clone(),
        Recorder::default(),
        config,
    );
    (mqtt, clock)
}

/// Construct an engine and complete the CONNECT handshake.
pub fn connected(config: Config) -> (TestEngine, ManualClock) {
    let (mut mqtt, clock) = engine(config);
    mqtt.client().connect().unwrap();
    mqtt.poll().unwrap();
    mqtt.client().transport_mut().inject(&connack(ConnectReturnCode::Accepted));
    mqtt.poll().unwrap();
    assert!(mqtt.client().is_connected());

    mqtt.client().transport_mut().take_sent();
    mqtt.client().handler_mut().completions.clear();
    (mqtt, clock)
}

/// Inject broker bytes and poll once.
pub fn deliver(mqtt: &mut TestEngine, data: &[u8]) {
    mqtt.client().transport_mut().inject(data);
    mqtt.poll().unwrap();
}

/// Take the bytes written by the engine.
pub fn sent(mqtt: &mut TestEngine) -> Vec<u8> {
    mqtt.client().transport_mut().take_sent()
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Handle(usize);

#[derive(Debug)]
pub struct StackError;

impl embedded_nal::TcpError for StackError {
    fn kind(&self) -> embedded_nal::TcpErrorKind {
        embedded_nal::TcpErrorKind::PipeClosed
    }
}

#[derive(Default)]
pub struct Socket {
    pub connected: bool,
    pub inbound: VecDeque<u8>,
    pub outbound: Vec<u8>,
}

/// An in-memory `embedded-nal` stack. Sockets are shared with the test through the `RefCell`.
pub struct MemoryStack<'a> {
    pub sockets: &'a RefCell<Vec<Socket>>,
}

impl<'a> MemoryStack<'a> {
    pub fn new(sockets: &'a RefCell<Vec<Socket>>) -> Self {
        Self { sockets }
    }
}

impl<'a> TcpClientStack for MemoryStack<'a> {
    type TcpSocket = Handle;
    type Error = StackError;

    fn socket(&mut self) -> Result<Self::TcpSocket, Self::Error> {
        let mut sockets = self.sockets.borrow_mut();
        sockets.push(Socket::default());
        Ok(Handle(sockets.len() - 1))
    }

    fn connect(
        &mut self,
        socket: &mut Self::TcpSocket,
        _remote: embedded_nal::SocketAddr,
    ) -> nb::Result<(), Self::Error> {
        self.sockets.borrow_mut()[socket.0].connected = true;
        Ok(())
    }

    fn send(
        &mut self,
        socket: &mut Self::TcpSocket,
        buffer: &[u8],
    ) -> nb::Result<usize, Self::Error> {
        let mut sockets = self.sockets.borrow_mut();
        let socket = &mut sockets[socket.0];
        if !socket.connected {
            return Err(nb::Error::Other(StackError));
        }

        socket.outbound.extend_from_slice(buffer);
        Ok(buffer.len())
    }

    fn receive(
        &mut self,
        socket: &mut Self::TcpSocket,
        buffer: &mut [u8],
    ) -> nb::Result<usize, Self::Error> {
        let mut sockets = self.sockets.borrow_mut();
        let socket = &mut sockets[socket.0];
        if !socket.connected {
            return Err(nb::Error::Other(StackError));
        }

        if socket.inbound.is_empty() {
            return Err(nb::Error::WouldBlock);
        }

        let mut len = 0;
        while len < buffer.len() {
            match socket.inbound.pop_front() {
                Some(byte) => {
                    buffer[len] = byte;
                    len += 1;
                }
                None => break,
            }
        }
        Ok(len)
    }

    fn close(&mut self, socket: Self::TcpSocket) -> Result<(), Self::Error> {
        self.sockets.borrow_mut()[socket.0].connected = false;
        Ok(())
    }
}
