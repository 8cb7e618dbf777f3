#![no_std]
//! # TinyMQ
//!
//! An MQTT 3.1.1 client engine for `no_std` platforms.
//!
//! The engine owns a single logical MQTT session over a caller-supplied byte transport. It
//! serializes and parses every MQTT 3.1.1 control packet, tracks QoS 1 and QoS 2 acknowledgement
//! sequences per packet identifier, keeps subscription bookkeeping, and drives keep-alive,
//! response timeouts and retransmission from a cooperative [Engine::poll] tick.
//!
//! ## Design
//! All state is owned by the [Engine] and mutated through `&mut self`, so exactly one logical flow
//! ever writes to the transport. No heap allocation is performed: the largest packet size and the
//! number of concurrently tracked operations are fixed at compile time through const generics.
//!
//! Results are delivered through a registered [Handler]:
//! * Incoming application messages, either to a per-subscription callback or the handler itself.
//! * Completion of every submitted operation, exactly once.
//! * Disconnection, with the reason the session ended.
//!
//! ## Example
//! ```no_run
//! # use tinymq::{Config, Engine, Handler, Message, Publication, QoS, Transport};
//! # struct Socket;
//! # impl Transport for Socket {
//! #     type Error = ();
//! #     fn send(&mut self, data: &[u8]) -> Result<usize, ()> { Ok(data.len()) }
//! #     fn recv(&mut self, _buf: &mut [u8]) -> Result<usize, ()> { Ok(0) }
//! # }
//! # #[derive(Default)]
//! # struct Clock;
//! # impl embedded_time::Clock for Clock {
//! #     type T = u32;
//! #     const SCALING_FACTOR: embedded_time::fraction::Fraction =
//! #         embedded_time::fraction::Fraction::new(1, 1000);
//! #     fn try_now(&self) -> Result<embedded_time::Instant<Self>, embedded_time::clock::Error> {
//! #         Ok(embedded_time::Instant::new(0))
//! #     }
//! # }
//! struct App;
//!
//! impl Handler for App {
//!     fn on_message(&mut self, message: &Message<'_>) {
//!         let _ = (message.topic, message.payload);
//!     }
//! }
//!
//! let config = Config::new().client_id("sensor").unwrap().keepalive_interval(30);
//! let mut mqtt: Engine<_, _, _, _, 512, 8> = Engine::new(Socket, Clock, App, config);
//!
//! let connect = mqtt.client().connect().unwrap();
//! mqtt.wait(connect).unwrap();
//!
//! let publish = mqtt
//!     .client()
//!     .publish(Publication::new("a/b", b"hello").qos(QoS::AtLeastOnce))
//!     .unwrap();
//! mqtt.wait(publish).unwrap();
//! ```

#[cfg(feature = "logging")]
#[macro_use]
extern crate log;

// Without `logging`, the log macros only type-check their arguments.
#[cfg(not(feature = "logging"))]
#[macro_use]
mod mqtt_log {
    macro_rules! trace {
        ($($arg:tt)+) => {{
            let _ = core::format_args!($($arg)+);
        }};
    }

    macro_rules! debug {
        ($($arg:tt)+) => {{
            let _ = core::format_args!($($arg)+);
        }};
    }

    macro_rules! info {
        ($($arg:tt)+) => {{
            let _ = core::format_args!($($arg)+);
        }};
    }

    macro_rules! warn {
        ($($arg:tt)+) => {{
            let _ = core::format_args!($($arg)+);
        }};
    }

    macro_rules! error {
        ($($arg:tt)+) => {{
            let _ = core::format_args!($($arg)+);
        }};
    }
}

pub mod ack_tracker;
pub mod codec;
mod config;
mod de;
pub mod design_parameters;
mod error;
mod message_types;
mod mqtt_client;
mod network_manager;
pub mod packet_id;
pub mod packets;
mod publication;
mod reason_codes;
pub mod scheduler;
mod ser;
mod session_state;
pub mod subscriptions;
pub mod types;
mod uptime;
mod varint;
mod will;

pub use ack_tracker::PublishState;
pub use codec::{Mqtt311, WireFormat};
pub use config::Config;
pub use error::{
    ConnectionError, DecodeError, DisconnectReason, EncodeError, Error, OperationError,
    ProtocolError,
};
pub use message_types::MessageType;
pub use mqtt_client::{ConnectionStatus, Engine, MqttClient};
pub use network_manager::{NalTransport, Transport};
pub use publication::{Publication, RetryPolicy};
pub use reason_codes::{ConnectReturnCode, SubscribeReturnCode};
pub use scheduler::{Cancellation, Completion, OperationHandle, OperationKind};
pub use subscriptions::{MessageCallback, TopicFilter};
pub use will::Will;

pub use embedded_nal;
pub use embedded_time;

use num_enum::TryFromPrimitive;

/// The default port for unencrypted MQTT connections.
pub const MQTT_INSECURE_DEFAULT_PORT: u16 = 1883;

/// The quality-of-service level of a message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery. No acknowledgement.
    AtMostOnce = 0,

    /// At least once delivery, acknowledged with a PUBACK.
    AtLeastOnce = 1,

    /// Exactly once delivery, completed through the PUBREC/PUBREL/PUBCOMP exchange.
    ExactlyOnce = 2,
}

/// Whether a message is retained by the broker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Retain {
    NotRetained = 0,
    Retained = 1,
}

/// An application message received from the broker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Message<'a> {
    /// The topic the message was published on.
    pub topic: &'a str,

    /// The message contents.
    pub payload: &'a [u8],

    /// The quality-of-service the broker delivered the message at.
    pub qos: QoS,

    /// Set if the broker retained the message.
    pub retain: Retain,

    /// Set if the broker indicated this is a retransmission.
    pub dup: bool,
}

/// Receives events from the [Engine].
///
/// Every method has an empty default, so implementors only override what they need.
pub trait Handler {
    /// An application message arrived and no matching subscription carried its own callback.
    fn on_message(&mut self, _message: &Message<'_>) {}

    /// A submitted operation reached a terminal result.
    fn on_complete(&mut self, _completion: &Completion) {}

    /// The session ended.
    fn on_disconnect(&mut self, _reason: DisconnectReason) {}
}

impl Handler for () {}
