//! Typed, timestamped value cell held by every node.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use dslink_protocol::Variant;
use parking_lot::RwLock;

/// Callback fired after a remote peer writes the value through `set`.
pub type RemoteSetCallback = Arc<dyn Fn(&Variant) + Send + Sync>;

/// Moment of the last mutation, on both clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl Timestamp {
    pub fn now() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    pub fn wall(&self) -> DateTime<Utc> {
        self.wall
    }

    pub fn monotonic(&self) -> Instant {
        self.mono
    }

    /// ISO-8601 with millisecond precision and explicit offset, the
    /// shape DSA brokers expect in subscription updates.
    pub fn to_dsa_string(&self) -> String {
        self.wall.to_rfc3339_opts(SecondsFormat::Millis, false)
    }
}

/// A value plus its last-updated timestamp.  Both live behind one lock so
/// readers always see a matching pair.
pub struct Value {
    state: RwLock<(Variant, Timestamp)>,
    on_remote_set: RwLock<Option<RemoteSetCallback>>,
}

impl Value {
    pub fn new(initial: Variant) -> Self {
        Self {
            state: RwLock::new((initial, Timestamp::now())),
            on_remote_set: RwLock::new(None),
        }
    }

    pub fn get(&self) -> Variant {
        self.state.read().0.clone()
    }

    pub fn last_updated(&self) -> Timestamp {
        self.state.read().1
    }

    /// Consistent `(value, timestamp)` pair.
    pub fn snapshot(&self) -> (Variant, Timestamp) {
        self.state.read().clone()
    }

    /// Replace the value and stamp it.  Subscriber notification is the
    /// owning node's job, see [`Node::set_value`](crate::tree::Node::set_value).
    pub(crate) fn set(&self, value: Variant) -> (Variant, Timestamp) {
        let mut state = self.state.write();
        *state = (value, Timestamp::now());
        state.clone()
    }

    pub fn set_on_remote_set(&self, callback: RemoteSetCallback) {
        *self.on_remote_set.write() = Some(callback);
    }

    pub(crate) fn invoke_remote_set(&self) {
        let callback = self.on_remote_set.read().clone();
        if let Some(callback) = callback {
            let value = self.get();
            callback(&value);
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::new(Variant::Null)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (value, ts) = self.snapshot();
        f.debug_struct("Value")
            .field("value", &value)
            .field("last_updated", &ts.to_dsa_string())
            .finish()
    }
}
