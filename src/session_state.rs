//! Keep-alive bookkeeping of the active session.
//!
//! The keep-alive ping is tracked here rather than in the operation table: a PINGREQ is never
//! retried and its failure always ends the connection.

pub(crate) struct SessionState {
    /// The negotiated keep-alive interval. Zero disables keep-alive.
    keepalive_ms: u64,

    /// How long to wait for a PINGRESP before declaring the connection dead.
    ping_timeout_ms: u64,

    /// Timestamp of the last packet written to the transport.
    last_send_ms: u64,

    /// If a PINGREQ is outstanding, the time by which its response must arrive.
    ping_deadline_ms: Option<u64>,

    pub session_present: bool,
}

impl SessionState {
    pub fn new(ping_timeout_ms: u64) -> Self {
        Self {
            keepalive_ms: 0,
            ping_timeout_ms,
            last_send_ms: 0,
            ping_deadline_ms: None,
            session_present: false,
        }
    }

    /// Begin keep-alive tracking for a freshly established connection.
    pub fn register_connection(&mut self, keepalive_secs: u16, session_present: bool, now_ms: u64) {
        self.keepalive_ms = keepalive_secs as u64 * 1000;
        self.session_present = session_present;
        self.last_send_ms = now_ms;
        self.ping_deadline_ms = None;
    }

    pub fn reset(&mut self) {
        self.keepalive_ms = 0;
        self.last_send_ms = 0;
        self.ping_deadline_ms = None;
        self.session_present = false;
    }

    pub fn register_send(&mut self, now_ms: u64) {
        self.last_send_ms = now_ms;
    }

    /// Determine if a PINGREQ must be sent.
    pub fn ping_due(&self, now_ms: u64) -> bool {
        self.keepalive_ms != 0
            && self.ping_deadline_ms.is_none()
            && now_ms.saturating_sub(self.last_send_ms) >= self.keepalive_ms
    }

    /// Start the ping response timer.
    ///
    /// # Note
    /// The timer is started whether or not the PINGREQ could be written, so a stalled transport
    /// is eventually detected.
    pub fn register_ping(&mut self, now_ms: u64) {
        self.ping_deadline_ms = Some(now_ms + self.ping_timeout_ms);
    }

    /// Handle a PINGRESP.
    ///
    /// # Returns
    /// False if no PINGREQ was outstanding.
    pub fn register_ping_response(&mut self) -> bool {
        self.ping_deadline_ms.take().is_some()
    }

    /// Determine if the outstanding PINGREQ went unanswered for too long.
    pub fn ping_expired(&self, now_ms: u64) -> bool {
        self.ping_deadline_ms
            .map(|deadline| now_ms >= deadline)
            .unwrap_or(false)
    }
}
