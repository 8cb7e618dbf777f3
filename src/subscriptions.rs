//! Subscription bookkeeping and topic matching.
//!
//! A subscription record is created as soon as a SUBSCRIBE request is submitted and becomes
//! active once the broker grants it in a SUBACK. Incoming messages are only routed to active
//! records. Renewing an active subscription keeps routing under the existing grant until the
//! broker answers the new request.
//!
//! Records of a persistent session outlive the connection. They are stored when the connection
//! ends and become active again if the broker reports that it resumed the session.
use crate::{
    design_parameters::{MAX_SUBSCRIPTIONS, MAX_TOPIC_LENGTH},
    error::OperationError,
    reason_codes::SubscribeReturnCode,
    types::Utf8String,
    Message, QoS,
};
use heapless::{String, Vec};
use serde::ser::SerializeStruct;

/// A callback invoked for messages matching a subscription.
pub type MessageCallback<H> = fn(&mut H, &Message<'_>);

/// A topic filter and the maximum QoS requested for it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TopicFilter<'a> {
    topic: &'a str,
    qos: QoS,
}

impl<'a> TopicFilter<'a> {
    /// Create a filter requesting [QoS::AtMostOnce] delivery.
    pub fn new(topic: &'a str) -> Self {
        Self {
            topic,
            qos: QoS::AtMostOnce,
        }
    }

    /// Request a different maximum quality-of-service.
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn topic(&self) -> &'a str {
        self.topic
    }

    pub fn max_qos(&self) -> QoS {
        self.qos
    }
}

impl<'a> serde::Serialize for TopicFilter<'a> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error;
        if !valid_topic_filter(self.topic) {
            return Err(S::Error::custom("Invalid topic filter"));
        }

        let mut item = serializer.serialize_struct("TopicFilter", 0)?;
        item.serialize_field("topic", &Utf8String(self.topic))?;
        item.serialize_field("options", &(self.qos as u8))?;
        item.end()
    }
}

/// Check that a topic name may be used in a PUBLISH.
///
/// Topic names are non-empty, carry no wildcard characters and no null characters.
pub fn valid_topic_name(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= u16::MAX as usize
        && !topic.contains(|c: char| c == '+' || c == '#' || c == '\0')
}

/// Check that a topic filter may be used in a SUBSCRIBE or UNSUBSCRIBE.
///
/// `+` must occupy an entire level. `#` must occupy an entire level and be the last level.
pub fn valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > u16::MAX as usize || filter.contains('\0') {
        return false;
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "+" => {}
            "#" => return levels.peek().is_none(),
            level if level.contains(|c: char| c == '+' || c == '#') => return false,
            _ => {}
        }
    }

    true
}

/// Determine if a topic name matches a topic filter.
///
/// Filters starting with a wildcard never match topics starting with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // `#` also matches the parent level.
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(level)) if expected == level => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SubscriptionState {
    /// The SUBSCRIBE has been submitted and no SUBACK has arrived.
    Pending,

    /// The broker granted the subscription.
    Active(QoS),

    /// The broker holds the subscription in a session that is not connected.
    Stored(QoS),
}

struct Subscription<H> {
    filter: String<MAX_TOPIC_LENGTH>,
    state: SubscriptionState,
    callback: Option<MessageCallback<H>>,

    /// The grant and callback that stay in effect while a renewal is pending.
    previous: Option<(QoS, Option<MessageCallback<H>>)>,
}

impl<H> Subscription<H> {
    fn active(&self) -> Option<(QoS, Option<MessageCallback<H>>)> {
        match self.state {
            SubscriptionState::Active(qos) => Some((qos, self.callback)),
            SubscriptionState::Pending => self.previous,
            SubscriptionState::Stored(_) => None,
        }
    }
}

/// The set of subscription records of the current session.
pub struct Subscriptions<H> {
    records: Vec<Subscription<H>, MAX_SUBSCRIPTIONS>,
}

impl<H> Default for Subscriptions<H> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
        }
    }
}

impl<H> Subscriptions<H> {
    /// Record the filters of a submitted SUBSCRIBE as pending.
    ///
    /// # Note
    /// Re-subscribing to a known filter replaces its record, as the broker replaces the
    /// existing subscription. An active grant keeps routing until the broker answers.
    pub fn add_pending(
        &mut self,
        filters: &[TopicFilter<'_>],
        callback: Option<MessageCallback<H>>,
    ) -> Result<(), OperationError> {
        self.insert(filters, callback, |_| SubscriptionState::Pending)
    }

    /// Record filters the broker holds in a persistent session.
    ///
    /// # Note
    /// The records only become active if the broker resumes the session.
    pub fn add_stored(
        &mut self,
        filters: &[TopicFilter<'_>],
        callback: Option<MessageCallback<H>>,
    ) -> Result<(), OperationError> {
        self.insert(filters, callback, |filter| {
            SubscriptionState::Stored(filter.qos)
        })
    }

    fn insert(
        &mut self,
        filters: &[TopicFilter<'_>],
        callback: Option<MessageCallback<H>>,
        state: impl Fn(&TopicFilter<'_>) -> SubscriptionState,
    ) -> Result<(), OperationError> {
        if filters
            .iter()
            .any(|filter| filter.topic.len() > MAX_TOPIC_LENGTH)
        {
            return Err(OperationError::NoCapacity);
        }

        let new_records = filters
            .iter()
            .filter(|filter| self.find(filter.topic).is_none())
            .count();
        if self.records.len() + new_records > self.records.capacity() {
            return Err(OperationError::NoCapacity);
        }

        for filter in filters {
            let mut stored = String::new();
            stored
                .push_str(filter.topic)
                .map_err(|_| OperationError::NoCapacity)?;

            let mut record = Subscription {
                filter: stored,
                state: state(filter),
                callback,
                previous: None,
            };

            match self.find(filter.topic) {
                Some(index) => {
                    if record.state == SubscriptionState::Pending {
                        record.previous = self.records[index].active();
                    }
                    self.records[index] = record;
                }
                None => {
                    // Note(unwrap): Capacity was checked above.
                    self.records.push(record).ok();
                }
            }
        }

        Ok(())
    }

    /// Apply the broker's return code for a filter.
    ///
    /// # Returns
    /// True if the broker granted the subscription.
    pub fn acknowledge(&mut self, filter: &str, code: SubscribeReturnCode) -> bool {
        let Some(index) = self.find(filter) else {
            warn!("SUBACK for unknown filter {}", filter);
            return code.success();
        };

        match code {
            SubscribeReturnCode::Granted(qos) => {
                info!("Subscribed to {} at {:?}", filter, qos);
                let record = &mut self.records[index];
                record.state = SubscriptionState::Active(qos);
                record.previous = None;
                true
            }
            SubscribeReturnCode::Failure => {
                warn!("Subscription to {} refused", filter);
                self.abandon(filter);
                false
            }
        }
    }

    /// Drop a pending request for a filter, restoring any grant it was meant to replace.
    pub fn abandon(&mut self, filter: &str) {
        let Some(index) = self.find(filter) else {
            return;
        };

        let record = &mut self.records[index];
        if record.state != SubscriptionState::Pending {
            return;
        }

        match record.previous.take() {
            Some((qos, callback)) => {
                record.state = SubscriptionState::Active(qos);
                record.callback = callback;
            }
            None => {
                self.records.swap_remove(index);
            }
        }
    }

    /// Keep the broker-held subscriptions of a session whose connection ended.
    ///
    /// Requests that were never answered are dropped.
    pub fn suspend(&mut self) {
        let filters: Vec<String<MAX_TOPIC_LENGTH>, MAX_SUBSCRIPTIONS> = self
            .records
            .iter()
            .filter(|record| record.state == SubscriptionState::Pending)
            .map(|record| record.filter.clone())
            .collect();
        for filter in filters.iter() {
            self.abandon(filter);
        }

        for record in self.records.iter_mut() {
            if let SubscriptionState::Active(qos) = record.state {
                record.state = SubscriptionState::Stored(qos);
            }
        }
    }

    /// Apply the session state reported in a CONNACK to stored records.
    pub fn resume(&mut self, session_present: bool) {
        if !session_present {
            self.records
                .retain(|record| !matches!(record.state, SubscriptionState::Stored(_)));
            return;
        }

        for record in self.records.iter_mut() {
            if let SubscriptionState::Stored(qos) = record.state {
                debug!("Resumed subscription to {}", record.filter.as_str());
                record.state = SubscriptionState::Active(qos);
            }
        }
    }

    /// Remove a record, returning true if it existed.
    pub fn remove(&mut self, filter: &str) -> bool {
        match self.find(filter) {
            Some(index) => {
                self.records.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Check if the broker has granted a subscription for exactly this filter.
    pub fn is_subscribed(&self, filter: &str) -> bool {
        self.find(filter)
            .map(|index| self.records[index].active().is_some())
            .unwrap_or(false)
    }

    /// Determine where a message on `topic` must be routed.
    ///
    /// # Returns
    /// The callbacks of every active matching subscription, and whether any active subscription
    /// matched at all.
    pub fn route(&self, topic: &str) -> (Vec<MessageCallback<H>, MAX_SUBSCRIPTIONS>, bool) {
        let mut callbacks = Vec::new();
        let mut matched = false;

        for (_, callback) in self
            .records
            .iter()
            .filter(|record| topic_matches(&record.filter, topic))
            .filter_map(|record| record.active())
        {
            matched = true;
            if let Some(callback) = callback {
                // Note(unwrap): Capacity matches the number of records.
                callbacks.push(callback).ok();
            }
        }

        (callbacks, matched)
    }

    fn find(&self, filter: &str) -> Option<usize> {
        self.records
            .iter()
            .position(|record| record.filter.as_str() == filter)
    }
}
