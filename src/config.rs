use crate::{
    design_parameters::{MAX_CLIENT_ID_LENGTH, MAX_CREDENTIAL_LENGTH},
    error::EncodeError,
    Will,
};
use heapless::{String, Vec};

/// Configuration specifying the operational state of the MQTT session.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) client_id: String<MAX_CLIENT_ID_LENGTH>,
    pub(crate) keepalive_interval: u16,
    pub(crate) clean_session: bool,
    pub(crate) username: Option<String<MAX_CREDENTIAL_LENGTH>>,
    pub(crate) password: Option<Vec<u8, MAX_CREDENTIAL_LENGTH>>,
    pub(crate) will: Option<Will>,
    pub(crate) response_timeout_ms: u32,
    pub(crate) ping_timeout_ms: u32,
    pub(crate) retry_limit: u32,
    pub(crate) retry_ceiling_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Construct a default configuration.
    ///
    /// # Note
    /// By default:
    /// * The client ID is empty and assigned by the broker
    /// * The keep-alive interval is 60 seconds
    /// * A clean session is requested
    /// * Responses are awaited for 1 second and requests are never retransmitted
    pub fn new() -> Self {
        Self {
            client_id: String::new(),
            keepalive_interval: 60,
            clean_session: true,
            username: None,
            password: None,
            will: None,
            response_timeout_ms: 1000,
            ping_timeout_ms: 1000,
            retry_limit: 0,
            retry_ceiling_ms: 60_000,
        }
    }

    /// Specify a known client ID to use. If empty, the broker will assign an ID.
    pub fn client_id(mut self, id: &str) -> Result<Self, EncodeError> {
        self.client_id.clear();
        self.client_id
            .push_str(id)
            .map_err(|_| EncodeError::BufferTooSmall)?;
        Ok(self)
    }

    /// Configure the MQTT keep-alive interval.
    ///
    /// # Args
    /// * `seconds` - A PINGREQ is sent if no other packet was written within this interval.
    /// Zero disables keep-alive.
    pub fn keepalive_interval(mut self, seconds: u16) -> Self {
        self.keepalive_interval = seconds;
        self
    }

    /// Specify whether the broker should discard any previous session state.
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Authenticate with the broker.
    pub fn credentials(
        mut self,
        username: &str,
        password: Option<&[u8]>,
    ) -> Result<Self, EncodeError> {
        let mut stored = String::new();
        stored
            .push_str(username)
            .map_err(|_| EncodeError::BufferTooSmall)?;
        self.username.replace(stored);

        self.password = password
            .map(Vec::from_slice)
            .transpose()
            .map_err(|_| EncodeError::BufferTooSmall)?;
        Ok(self)
    }

    /// Specify the Will message to be sent if the client disconnects unexpectedly.
    pub fn will(mut self, will: Will) -> Self {
        self.will.replace(will);
        self
    }

    /// How long to wait for the response to a request before retrying or failing it.
    pub fn response_timeout(mut self, milliseconds: u32) -> Self {
        self.response_timeout_ms = milliseconds;
        self
    }

    /// How long to wait for a PINGRESP before the connection is considered lost.
    pub fn ping_timeout(mut self, milliseconds: u32) -> Self {
        self.ping_timeout_ms = milliseconds;
        self
    }

    /// The default number of retransmissions of unacknowledged publications and subscriptions.
    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    /// The maximum wait between retransmissions.
    pub fn retry_ceiling(mut self, milliseconds: u32) -> Self {
        self.retry_ceiling_ms = milliseconds;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_client_ids_are_rejected() {
        let id = core::str::from_utf8(&[b'a'; 65]).unwrap();
        assert_eq!(
            Config::new().client_id(id).err(),
            Some(EncodeError::BufferTooSmall)
        );
        assert!(Config::new().client_id(&id[..64]).is_ok());
    }

    #[test]
    fn credentials() {
        let config = Config::new().credentials("user", Some(b"secret")).unwrap();
        assert_eq!(config.username.as_deref(), Some("user"));
        assert_eq!(config.password.as_deref(), Some(&b"secret"[..]));

        let config = Config::new().credentials("user", None).unwrap();
        assert!(config.password.is_none());
    }
}
