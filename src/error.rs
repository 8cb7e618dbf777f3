use crate::reason_codes::ConnectReturnCode;

/// Errors produced while serializing a control packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// The provided buffer cannot hold the serialized packet.
    BufferTooSmall,

    /// A field cannot be represented on the wire, such as a string longer than 65535 bytes, a
    /// topic containing wildcards or a missing packet identifier.
    InvalidField,
}

impl serde::ser::StdError for EncodeError {}

impl serde::ser::Error for EncodeError {
    fn custom<T: core::fmt::Display>(_msg: T) -> Self {
        error!("{}", _msg);
        EncodeError::InvalidField
    }
}

impl core::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                EncodeError::BufferTooSmall => "Not enough space to encode the packet",
                EncodeError::InvalidField => "Packet field cannot be encoded",
            }
        )
    }
}

/// Errors produced while parsing received bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// More bytes are required before the packet can be parsed. Not fatal.
    Incomplete,

    /// The bytes do not form a valid MQTT 3.1.1 control packet. Fatal to the connection.
    MalformedPacket,

    /// The packet is larger than the receive buffer. Fatal to the connection.
    PacketTooLarge,
}

impl DecodeError {
    /// Determine if the error requires the connection to be torn down.
    pub fn is_fatal(&self) -> bool {
        *self != DecodeError::Incomplete
    }
}

impl core::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                DecodeError::Incomplete => "Packet is incomplete",
                DecodeError::MalformedPacket => "Malformed packet",
                DecodeError::PacketTooLarge => "Packet exceeds the receive buffer",
            }
        )
    }
}

/// Errors that end the connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The server rejected the CONNECT request.
    Refused(ConnectReturnCode),

    /// The transport failed.
    Network,

    /// No PINGRESP arrived within the keep-alive response timeout.
    KeepAliveTimeout,

    /// No CONNACK arrived within the response timeout.
    ConnectTimeout,
}

/// Terminal failures of a single submitted operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// No terminal response arrived before the deadline, after all permitted retries.
    Timeout,

    /// Every packet identifier is currently in flight.
    NoIdentifiersAvailable,

    /// The operation table is full.
    NoCapacity,

    /// The connection ended before the operation completed.
    Disconnected(DisconnectReason),

    /// A graceful disconnect is in progress and no new requests are accepted.
    Shutdown,

    /// The server refused the connection.
    Refused(ConnectReturnCode),

    /// The server rejected at least one topic filter of a subscription request.
    SubscriptionRefused,

    /// The handle does not refer to a pending operation.
    UnknownOperation,
}

/// Violations of the MQTT protocol by the server. Always fatal to the connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A packet arrived that is invalid in the current connection state.
    UnexpectedPacket,

    /// An acknowledgement would skip a state of a tracked publication.
    InvalidTransition,

    /// The received bytes could not be parsed.
    Malformed(DecodeError),
}

/// The reason a session ended, reported to [crate::Handler::on_disconnect].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The application called [crate::MqttClient::disconnect].
    ClientInitiated,

    /// The transport reported an error.
    NetworkError,

    /// No PINGRESP arrived in time.
    KeepAliveTimeout,

    /// The server rejected the CONNECT request.
    ServerRefused,

    /// The server violated the protocol or sent malformed data.
    ProtocolError,

    /// No CONNACK arrived in time.
    Timeout,
}

/// Possible errors encountered while using the engine.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Error<E> {
    /// The transport failed.
    Network(E),

    /// The clock could not provide the current time.
    Clock,

    /// The operation is not valid in the current connection state.
    NotReady,

    Encode(EncodeError),
    Decode(DecodeError),
    Connection(ConnectionError),
    Operation(OperationError),
    Protocol(ProtocolError),
}

impl<E> From<EncodeError> for Error<E> {
    fn from(err: EncodeError) -> Self {
        Error::Encode(err)
    }
}

impl<E> From<DecodeError> for Error<E> {
    fn from(err: DecodeError) -> Self {
        Error::Decode(err)
    }
}

impl<E> From<ConnectionError> for Error<E> {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl<E> From<OperationError> for Error<E> {
    fn from(err: OperationError) -> Self {
        Error::Operation(err)
    }
}

impl<E> From<ProtocolError> for Error<E> {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl<E> From<embedded_time::clock::Error> for Error<E> {
    fn from(_: embedded_time::clock::Error) -> Self {
        Error::Clock
    }
}
