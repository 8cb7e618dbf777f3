//! # Design Parameters
//! This module contains design constraints arbitrarily imposed on the library.

/// The longest client identifier accepted in the configuration.
pub const MAX_CLIENT_ID_LENGTH: usize = 64;

/// The longest topic name or topic filter that may be stored by the engine.
pub const MAX_TOPIC_LENGTH: usize = 128;

/// The maximum number of topic filters supported in a single SUBSCRIBE or UNSUBSCRIBE request.
pub const MAX_TOPICS_PER_SUBSCRIPTION: usize = 8;

/// The maximum number of subscription records tracked at once.
pub const MAX_SUBSCRIPTIONS: usize = 16;

/// The largest will message payload that may be configured.
pub const MAX_WILL_PAYLOAD: usize = 128;

/// The longest user name or password that may be configured.
pub const MAX_CREDENTIAL_LENGTH: usize = 64;
