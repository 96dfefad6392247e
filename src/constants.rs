// Shared constants for the broker and peer clients

use std::time::Duration;

/// Name of the pseudo-application through which a client manages its own
/// registration and subscriptions.
pub const CONTROL_APPLICATION: &str = "Heart";

/// Default listening port of the broker.
pub const DEFAULT_PORT: u16 = 4445;

/// How long a request waits for its response before timing out.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(6);

/// Peer reconnect attempts before giving up.
pub const MAX_RECONNECT_TRIES: u32 = 480;

/// Peer subscribe attempts during the initial handshake.
pub const MAX_SUBSCRIBE_TRIES: u32 = 480;

/// Largest backoff exponent (delay caps at 2^4 seconds plus jitter).
pub const BACKOFF_MAX_EXPONENT: u32 = 4;

/// Longest accepted frame in bytes; longer lines are discarded.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Frames buffered per connection before senders wait on the writer task.
pub const OUTBOUND_QUEUE_SIZE: usize = 100;

// --- Wire field names ---

pub const FIELD_APPLICATION: &str = "application";
pub const FIELD_REQUEST_TYPE: &str = "request-type";
pub const FIELD_MESSAGE_ID: &str = "message-id";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_ERROR: &str = "error";
pub const FIELD_UPDATE_TYPE: &str = "update-type";
pub const FIELD_NAME: &str = "name";

// --- Control request types and broker events ---

pub const REQUEST_REGISTER: &str = "Register";
pub const REQUEST_UNREGISTER: &str = "Unregister";
pub const REQUEST_SUBSCRIBE: &str = "Subscribe";
pub const REQUEST_UNSUBSCRIBE: &str = "Unsubscribe";

/// Event sent to every subscriber of an application that goes away.
pub const EVENT_UNSUBSCRIBED_FROM: &str = "UnsubscribedFrom";
