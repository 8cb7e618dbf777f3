use crate::{packets::Pub, QoS, Retain};

/// Builder pattern for generating MQTT publications.
///
/// # Note
/// By default, messages are constructed with:
/// * A QoS setting of [QoS::AtMostOnce]
/// * Retention set to [Retain::NotRetained]
/// * The retry policy of the engine [crate::Config]
pub struct Publication<'a> {
    pub(crate) topic: &'a str,
    pub(crate) payload: &'a [u8],
    pub(crate) qos: QoS,
    pub(crate) retain: Retain,
    pub(crate) retries: Option<RetryPolicy>,
}

/// How often and how quickly an unacknowledged request is retransmitted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The number of retransmissions attempted before the request fails.
    pub limit: u32,

    /// The wait before the first retransmission, in milliseconds. Doubles after every attempt.
    pub period_ms: u32,
}

impl<'a> Publication<'a> {
    /// Construct a new publication.
    ///
    /// # Args
    /// * `topic` - The topic to publish on. Must not contain wildcards.
    /// * `payload` - The message contents.
    pub fn new(topic: &'a str, payload: &'a [u8]) -> Self {
        Self {
            topic,
            payload,
            qos: QoS::AtMostOnce,
            retain: Retain::NotRetained,
            retries: None,
        }
    }

    /// Specify the [QoS] of the publication. By default, the QoS is set to [QoS::AtMostOnce].
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Specify that this message should be [Retain::Retained].
    pub fn retain(mut self) -> Self {
        self.retain = Retain::Retained;
        self
    }

    /// Retransmit the publication up to `limit` times if it is not acknowledged.
    ///
    /// # Args
    /// * `limit` - The number of retransmissions.
    /// * `period_ms` - The initial wait before retransmitting.
    pub fn retries(mut self, limit: u32, period_ms: u32) -> Self {
        self.retries.replace(RetryPolicy { limit, period_ms });
        self
    }

    pub(crate) fn to_packet(&self, packet_id: Option<u16>) -> Pub<'a> {
        Pub {
            topic: self.topic,
            packet_id,
            payload: self.payload,
            qos: self.qos,
            retain: self.retain,
            dup: false,
        }
    }
}
