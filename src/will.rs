use crate::{
    design_parameters::{MAX_TOPIC_LENGTH, MAX_WILL_PAYLOAD},
    error::EncodeError,
    packets::WillMessage,
    subscriptions::valid_topic_name,
    QoS, Retain,
};

use heapless::{String, Vec};

/// A message the broker publishes on behalf of the client if the connection is lost without a
/// DISCONNECT.
#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    topic: String<MAX_TOPIC_LENGTH>,
    payload: Vec<u8, MAX_WILL_PAYLOAD>,
    qos: QoS,
    retain: Retain,
}

impl Will {
    /// Construct a new will message.
    ///
    /// # Args
    /// * `topic` - The topic to send the message on. Must not contain wildcards.
    /// * `data` - The message to transmit.
    pub fn new(topic: &str, data: &[u8]) -> Result<Self, EncodeError> {
        if !valid_topic_name(topic) {
            return Err(EncodeError::InvalidField);
        }

        let mut stored = String::new();
        stored
            .push_str(topic)
            .map_err(|_| EncodeError::BufferTooSmall)?;

        Ok(Self {
            topic: stored,
            payload: Vec::from_slice(data).map_err(|_| EncodeError::BufferTooSmall)?,
            qos: QoS::AtMostOnce,
            retain: Retain::NotRetained,
        })
    }

    /// Set the retained status of the will.
    pub fn retained(mut self, retain: Retain) -> Self {
        self.retain = retain;
        self
    }

    /// Set the quality of service at which the will message is sent.
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub(crate) fn message(&self) -> WillMessage<'_> {
        WillMessage {
            topic: self.topic.as_str(),
            payload: &self.payload,
            qos: self.qos,
            retain: self.retain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_topics_are_rejected() {
        assert_eq!(Will::new("a/#", b"gone"), Err(EncodeError::InvalidField));
        assert_eq!(Will::new("", b"gone"), Err(EncodeError::InvalidField));
    }

    #[test]
    fn message_view() {
        let will = Will::new("status", b"offline")
            .unwrap()
            .qos(QoS::AtLeastOnce)
            .retained(Retain::Retained);
        let message = will.message();
        assert_eq!(message.topic, "status");
        assert_eq!(message.payload, b"offline");
        assert_eq!(message.qos, QoS::AtLeastOnce);
        assert_eq!(message.retain, Retain::Retained);
    }
}
