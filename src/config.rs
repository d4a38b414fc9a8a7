use crate::constants::*;

use std::time::Duration;

/// Engine-level tunables shared by every connection.
///
/// Per-destination behaviour (codec, reconnect policy, metadata) lives in
/// [`ProfileSettings`]; this covers the knobs that apply to the pipeline
/// as a whole.
///
/// [`ProfileSettings`]: crate::profile::ProfileSettings
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Config {
    /// Capacity of each worker's sample ring, in frames.
    ///
    /// *Defaults to [`RING_BUFFER_FRAMES`].*
    pub ring_frames: usize,
    /// Attempts made while polling a pending connection before giving up.
    ///
    /// *Defaults to [`MAX_CONNECT_POLLS`].*
    pub max_connect_polls: u32,
    /// Wait between two connection polls.
    ///
    /// *Defaults to [`CONNECT_POLL_INTERVAL`].*
    pub connect_poll_interval: Duration,
    /// Unsent-byte backlog towards one server that triggers a reconnect.
    ///
    /// *Defaults to [`MAX_NETWORK_CACHE`].*
    pub max_network_cache: usize,
    /// Consecutive send failures tolerated before reconnecting.
    ///
    /// *Defaults to [`MAX_SEND_FAILURES`].*
    pub max_send_failures: u32,
    /// Backoff after the transport reports itself busy mid-send.
    ///
    /// *Defaults to [`BUSY_BACKOFF`].*
    pub busy_backoff: Duration,
    /// How long a worker waits for its data signal before re-checking
    /// enable flags.
    ///
    /// *Defaults to [`IDLE_WAIT`].*
    pub idle_wait: Duration,
    /// Grace period when joining a worker thread at teardown.
    ///
    /// *Defaults to [`JOIN_GRACE`].*
    pub join_grace: Duration,
    /// Encode cycles between two queries of the now-playing oracle.
    ///
    /// *Defaults to [`METADATA_HEARTBEAT`].*
    pub metadata_heartbeat: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ring_frames: RING_BUFFER_FRAMES,
            max_connect_polls: MAX_CONNECT_POLLS,
            connect_poll_interval: CONNECT_POLL_INTERVAL,
            max_network_cache: MAX_NETWORK_CACHE,
            max_send_failures: MAX_SEND_FAILURES,
            busy_backoff: BUSY_BACKOFF,
            idle_wait: IDLE_WAIT,
            join_grace: JOIN_GRACE,
            metadata_heartbeat: METADATA_HEARTBEAT,
        }
    }
}

impl Config {
    /// Sets this `Config`'s per-worker ring capacity, in frames.
    #[must_use]
    pub fn ring_frames(mut self, ring_frames: usize) -> Self {
        self.ring_frames = ring_frames;
        self
    }

    /// Sets this `Config`'s connect poll budget.
    #[must_use]
    pub fn max_connect_polls(mut self, max_connect_polls: u32) -> Self {
        self.max_connect_polls = max_connect_polls;
        self
    }

    /// Sets this `Config`'s wait between connection polls.
    #[must_use]
    pub fn connect_poll_interval(mut self, connect_poll_interval: Duration) -> Self {
        self.connect_poll_interval = connect_poll_interval;
        self
    }

    /// Sets this `Config`'s send-backlog limit, in bytes.
    #[must_use]
    pub fn max_network_cache(mut self, max_network_cache: usize) -> Self {
        self.max_network_cache = max_network_cache;
        self
    }

    /// Sets this `Config`'s tolerated consecutive send failures.
    #[must_use]
    pub fn max_send_failures(mut self, max_send_failures: u32) -> Self {
        self.max_send_failures = max_send_failures;
        self
    }

    /// Sets this `Config`'s teardown join grace period.
    #[must_use]
    pub fn join_grace(mut self, join_grace: Duration) -> Self {
        self.join_grace = join_grace;
        self
    }

    /// Sets this `Config`'s metadata heartbeat, in encode cycles.
    #[must_use]
    pub fn metadata_heartbeat(mut self, metadata_heartbeat: u32) -> Self {
        self.metadata_heartbeat = metadata_heartbeat;
        self
    }
}
