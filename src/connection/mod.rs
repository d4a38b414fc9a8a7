//! Per-destination broadcast workers.
//!
//! Each enabled profile gets a [`ShoutConnection`]: a worker thread that
//! owns its sample ring, its encoder and its socket, and drives the
//! connect / transmit / reconnect state machine. The audio thread only
//! ever touches the ring; control threads only ever touch the profile's
//! `enabled` flag, which every wait point observes.

pub mod error;
pub(crate) mod source;

pub use error::{ConfigError, SourceError};

use crate::config::Config;
use crate::connection::source::{PollStatus, SendOutcome, SourceClient, SourceParams};
use crate::constants::SUPPORTED_BITRATES;
use crate::encoder::{Encoder, EncoderError, EncoderSettings, EncoderSink};
use crate::events::BroadcastEvent;
use crate::metadata::{render_template, NowPlaying, TrackInfo};
use crate::profile::{Profile, ProfileSettings, ServerKind, StreamFormat};
use crate::stream::StreamSlot;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, info_span, trace, warn};

/// Externally observable state of one destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// No connection, none wanted.
    Unconnected = 0,
    /// A connection attempt is in flight.
    Connecting = 1,
    /// Steady transmit.
    Connected = 2,
    /// The last attempt or session failed.
    Failure = 3,
}

impl ConnectionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Failure,
            _ => Self::Unconnected,
        }
    }
}

/// Shared, atomically updated status cell.
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ConnectionStatus::Unconnected as u8))
    }

    pub(crate) fn get(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, status: ConnectionStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

/// Internal lifecycle stage of a worker, kept for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerState {
    New,
    Init,
    Waiting,
    Busy,
    Ready,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// How one connect attempt ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnectOutcome {
    Connected,
    Transient,
    Fatal,
}

enum SetupError {
    Config(ConfigError),
    Encoder(EncoderError),
    Source(SourceError),
}

impl SetupError {
    fn title(&self) -> &'static str {
        match self {
            Self::Config(_) => "Invalid broadcast settings",
            Self::Encoder(_) => "Encoder initialisation failed",
            Self::Source(_) => "Connection setup failed",
        }
    }
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Encoder(e) => e.fmt(f),
            Self::Source(e) => e.fmt(f),
        }
    }
}

/// Everything a worker thread needs, bundled so the thread can build its
/// own state in place.
pub(crate) struct WorkerSeed {
    pub(crate) profile: Arc<Profile>,
    pub(crate) slot: Arc<StreamSlot>,
    pub(crate) status: Arc<StatusCell>,
    pub(crate) config: Arc<Config>,
    pub(crate) global_enabled: Arc<AtomicBool>,
    pub(crate) now_playing: Arc<dyn NowPlaying>,
    pub(crate) events: flume::Sender<BroadcastEvent>,
    pub(crate) data_rx: flume::Receiver<()>,
    pub(crate) live: Arc<AtomicBool>,
    pub(crate) done_tx: flume::Sender<()>,
}

/// Handle to one destination's worker.
pub struct ShoutConnection {
    profile: Arc<Profile>,
    slot: Arc<StreamSlot>,
    status: Arc<StatusCell>,
    config: Arc<Config>,
    global_enabled: Arc<AtomicBool>,
    now_playing: Arc<dyn NowPlaying>,
    events: flume::Sender<BroadcastEvent>,
    data_rx: flume::Receiver<()>,
    live: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    done_rx: Option<flume::Receiver<()>>,
}

impl ShoutConnection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        profile: Arc<Profile>,
        slot: Arc<StreamSlot>,
        config: Arc<Config>,
        global_enabled: Arc<AtomicBool>,
        now_playing: Arc<dyn NowPlaying>,
        events: flume::Sender<BroadcastEvent>,
        data_rx: flume::Receiver<()>,
    ) -> Self {
        Self {
            profile,
            slot,
            status: Arc::new(StatusCell::new()),
            config,
            global_enabled,
            now_playing,
            events,
            data_rx,
            live: Arc::new(AtomicBool::new(false)),
            handle: None,
            done_rx: None,
        }
    }

    /// The profile this worker serves.
    pub fn profile(&self) -> &Arc<Profile> {
        &self.profile
    }

    /// The worker's producer-side stream slot.
    pub(crate) fn slot(&self) -> &Arc<StreamSlot> {
        &self.slot
    }

    /// Current observable status.
    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    /// Spawns the worker thread, if the profile is enabled and no worker
    /// is already running.
    pub(crate) fn connect(&mut self) -> bool {
        if !self.profile.enabled() {
            return false;
        }
        self.reap();
        if self.live.load(Ordering::Acquire) {
            return true;
        }

        let (done_tx, done_rx) = flume::bounded(1);
        self.live.store(true, Ordering::Release);
        let seed = WorkerSeed {
            profile: Arc::clone(&self.profile),
            slot: Arc::clone(&self.slot),
            status: Arc::clone(&self.status),
            config: Arc::clone(&self.config),
            global_enabled: Arc::clone(&self.global_enabled),
            now_playing: Arc::clone(&self.now_playing),
            events: self.events.clone(),
            data_rx: self.data_rx.clone(),
            live: Arc::clone(&self.live),
            done_tx,
        };
        self.done_rx = Some(done_rx);
        self.handle = Some(std::thread::spawn(move || Worker::new(seed).run()));
        true
    }

    /// Re-applies profile settings while broadcasting is active. Only
    /// effective when the worker is currently down (Unconnected or
    /// Failure); a live session keeps its settings until it ends.
    pub(crate) fn apply_settings(&mut self) {
        if !self.profile.enabled() {
            return;
        }
        match self.status.get() {
            ConnectionStatus::Unconnected | ConnectionStatus::Failure => {
                self.connect();
            },
            status => {
                debug!(profile = %self.profile.name(), ?status, "settings deferred while connected");
            },
        }
    }

    /// Tells the worker to tear down and waits out the join grace.
    pub(crate) fn shutdown(&mut self) {
        self.profile.set_enabled(false);
        self.reap_with_grace(self.config.join_grace);
    }

    fn reap(&mut self) {
        if !self.live.load(Ordering::Acquire) {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            self.done_rx = None;
        }
    }

    fn reap_with_grace(&mut self, grace: Duration) {
        if let Some(done_rx) = self.done_rx.take() {
            if self.live.load(Ordering::Acquire) && done_rx.recv_timeout(grace).is_err() {
                // Let the user know rather than hanging the teardown.
                warn!(
                    profile = %self.profile.name(),
                    "worker thread did not stop within the grace period"
                );
                self.handle = None;
                return;
            }
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ShoutConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The thread-side state machine.
struct Worker {
    profile: Arc<Profile>,
    slot: Arc<StreamSlot>,
    status: Arc<StatusCell>,
    config: Arc<Config>,
    global_enabled: Arc<AtomicBool>,
    now_playing: Arc<dyn NowPlaying>,
    events: flume::Sender<BroadcastEvent>,
    data_rx: flume::Receiver<()>,
    live: Arc<AtomicBool>,
    done_tx: flume::Sender<()>,

    state: WorkerState,
    snapshot: ProfileSettings,
    client: Option<SourceClient>,
    encoder: Option<Encoder>,
    failures: u32,
    pending_reconnect: bool,
    retry_count: u32,
    meta_life: u32,
    tracked: Option<TrackInfo>,
    first_call: bool,
    last_error: String,
}

impl Worker {
    fn new(seed: WorkerSeed) -> Self {
        let snapshot = seed.profile.settings();
        Self {
            profile: seed.profile,
            slot: seed.slot,
            status: seed.status,
            config: seed.config,
            global_enabled: seed.global_enabled,
            now_playing: seed.now_playing,
            events: seed.events,
            data_rx: seed.data_rx,
            live: seed.live,
            done_tx: seed.done_tx,
            state: WorkerState::New,
            snapshot,
            client: None,
            encoder: None,
            failures: 0,
            pending_reconnect: false,
            retry_count: 0,
            meta_life: 0,
            tracked: None,
            first_call: false,
            last_error: String::new(),
        }
    }

    fn run(mut self) {
        let name = self.profile.name();
        let span = info_span!("shout", profile = %name);
        let _enter = span.enter();
        debug!("worker thread starting");
        self.set_state(WorkerState::Init);

        match self.process_connect() {
            ConnectOutcome::Connected => {},
            ConnectOutcome::Fatal => {
                self.profile.set_enabled(false);
                self.finish();
                return;
            },
            ConnectOutcome::Transient => {
                // A disable during the connect poll is a cancel, not a
                // failure to retry.
                if !self.enabled() || !self.try_reconnect() {
                    self.finish();
                    return;
                }
            },
        }

        loop {
            // Stop the thread if broadcasting was turned off.
            if !self.enabled() {
                debug!("connection disabled, disconnecting");
                if self.process_disconnect() {
                    self.status.set(ConnectionStatus::Unconnected);
                }
                break;
            }

            if self.data_rx.recv_timeout(self.config.idle_wait).is_err() {
                continue;
            }

            let slot = Arc::clone(&self.slot);
            let avail = slot.ring.read_available();
            if avail > 0 {
                let (first, second) = slot.ring.acquire_read_regions(avail);
                self.process(first);
                if !second.is_empty() {
                    self.process(second);
                }
                slot.ring.release_read_regions(avail);
            }

            if std::mem::take(&mut self.pending_reconnect) && !self.try_reconnect() {
                break;
            }
        }

        debug!("worker thread stopped");
        self.finish();
    }

    fn finish(mut self) {
        if let Some(client) = self.client.as_mut() {
            client.close();
        }
        self.live.store(false, Ordering::Release);
        let _ = self.done_tx.send(());
    }

    fn enabled(&self) -> bool {
        self.profile.enabled() && self.global_enabled.load(Ordering::Acquire)
    }

    fn set_state(&mut self, state: WorkerState) {
        if state != self.state {
            trace!(?state, "worker state");
            self.state = state;
        }
    }

    fn emit(&self, event: BroadcastEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&mut self, text: impl Into<String>, details: impl Into<String>) {
        let text = text.into();
        let details = details.into();
        warn!(%text, %details, "streaming error");
        self.emit(BroadcastEvent::Error {
            profile: self.profile.name(),
            text,
            details,
        });
        self.set_state(WorkerState::Error);
    }

    /// Rebuilds encoder and client from the profile. Any error here is
    /// fatal for the attempt: bad settings do not get retried.
    fn update_from_profile(&mut self) -> Result<(), SetupError> {
        self.set_state(WorkerState::Busy);
        self.snapshot = self.profile.settings();
        let s = &self.snapshot;
        debug!(host = %s.host, port = s.port, format = ?s.format, "updating from profile");

        if s.server == ServerKind::Shoutcast && s.format != StreamFormat::Mp3 {
            return Err(SetupError::Config(ConfigError::ShoutcastRequiresMp3));
        }
        if s.host.trim().is_empty() {
            return Err(SetupError::Config(ConfigError::MissingHost));
        }
        if s.port == 0 {
            return Err(SetupError::Config(ConfigError::InvalidPort));
        }
        if !SUPPORTED_BITRATES.contains(&s.bitrate) {
            return Err(SetupError::Config(ConfigError::UnsupportedBitrate(s.bitrate)));
        }

        let params = SourceParams::from_settings(s).map_err(SetupError::Source)?;

        let sample_rate = self.slot.clock.sample_rate();
        let mut encoder = Encoder::new(
            s.format,
            EncoderSettings {
                bitrate: s.bitrate,
                channels: s.channels.channels(),
            },
        );
        encoder.init(sample_rate).map_err(SetupError::Encoder)?;

        self.encoder = Some(encoder);
        self.client = Some(SourceClient::new(params));
        self.set_state(WorkerState::Ready);
        Ok(())
    }

    fn process_connect(&mut self) -> ConnectOutcome {
        debug!("process_connect");
        if let Err(e) = self.update_from_profile() {
            let title = e.title();
            let detail = e.to_string();
            self.encoder = None;
            self.client = None;
            self.status.set(ConnectionStatus::Failure);
            self.emit_error(title, detail);
            return ConnectOutcome::Fatal;
        }

        self.status.set(ConnectionStatus::Connecting);
        self.set_state(WorkerState::Connecting);
        self.failures = 0;
        self.last_error.clear();
        // Force a metadata refresh on the first change of the session, and
        // make sure the previous session's track is not carried over.
        self.meta_life = self.config.metadata_heartbeat;
        self.tracked = None;
        self.first_call = false;

        let mut client = match self.client.take() {
            Some(client) => client,
            None => return ConnectOutcome::Transient,
        };

        let mut fatal = false;
        let mut connected = false;
        match client.open() {
            Ok(()) => {
                let mut polls = 0;
                loop {
                    if !self.profile.enabled() {
                        break;
                    }
                    match client.poll_connected() {
                        Ok(PollStatus::Connected) => {
                            connected = true;
                            break;
                        },
                        Ok(PollStatus::Busy) => {
                            self.set_state(WorkerState::Waiting);
                            polls += 1;
                            if polls >= self.config.max_connect_polls {
                                self.last_error = SourceError::TimedOut.to_string();
                                break;
                            }
                            trace!("connection pending, waiting");
                            self.profile.wait_wake(self.config.connect_poll_interval);
                        },
                        Err(e) => {
                            fatal = e.is_fatal();
                            self.last_error = e.to_string();
                            warn!("connect failed: {e}");
                            break;
                        },
                    }
                }
            },
            Err(e) => {
                fatal = e.is_fatal();
                self.last_error = e.to_string();
                warn!("connect failed: {e}");
            },
        }

        if connected {
            self.set_state(WorkerState::Connected);
            self.retry_count = 0;
            // Start the session at the live edge of the ring.
            self.slot.ring.discard_all();
            self.client = Some(client);
            self.status.set(ConnectionStatus::Connected);
            self.emit(BroadcastEvent::Connected {
                profile: self.profile.name(),
            });
            info!("connected to streaming server");
            self.set_state(WorkerState::Ready);
            return ConnectOutcome::Connected;
        }

        // No connection; clean up the attempt.
        client.close();
        self.client = Some(client);
        self.encoder = None;
        if fatal {
            self.status.set(ConnectionStatus::Failure);
            let detail = self.last_error.clone();
            self.emit_error("Can't connect to streaming server", detail);
            return ConnectOutcome::Fatal;
        }
        self.status.set(if self.profile.enabled() {
            ConnectionStatus::Failure
        } else {
            ConnectionStatus::Unconnected
        });
        debug!("process_connect failed: {}", self.last_error);
        ConnectOutcome::Transient
    }

    fn process_disconnect(&mut self) -> bool {
        debug!("process_disconnect");
        let mut disconnected = false;
        if let Some(client) = self.client.as_mut() {
            if client.is_connected() {
                client.close();
                disconnected = true;
            }
        }
        if disconnected {
            self.set_state(WorkerState::Disconnected);
            self.emit(BroadcastEvent::Disconnected {
                profile: self.profile.name(),
            });
        }
        self.encoder = None;
        disconnected
    }

    /// Waits out the retry schedule. Returns false when the budget is
    /// exhausted or the profile was disabled while waiting.
    fn wait_for_retry(&mut self) -> bool {
        let rc = &self.snapshot.reconnect;
        let (limited, budget) = if rc.enabled {
            (rc.limit_retries, rc.max_retries)
        } else {
            (true, 0)
        };
        if limited && self.retry_count >= budget {
            return false;
        }
        self.retry_count += 1;
        debug!(retry = self.retry_count, of = budget, "waiting for retry");

        let delay = rc.delay_for(self.retry_count);
        if !delay.is_zero() {
            self.profile.wait_wake(delay);
        }
        self.enabled()
    }

    /// Reconnect loop: disconnect, then retry per schedule until success
    /// or give-up. Giving up disables the profile and reports the error.
    fn try_reconnect(&mut self) -> bool {
        let original_error = self.last_error.clone();
        self.status.set(ConnectionStatus::Failure);
        self.process_disconnect();

        loop {
            if !self.wait_for_retry() {
                break;
            }
            match self.process_connect() {
                ConnectOutcome::Connected => return true,
                ConnectOutcome::Fatal => break,
                ConnectOutcome::Transient => continue,
            }
        }

        if self.status.get() == ConnectionStatus::Failure {
            self.profile.set_enabled(false);
            let text = if self.retry_count > 0 {
                format!(
                    "Lost connection to streaming server and {} attempts to reconnect have failed.",
                    self.retry_count
                )
            } else {
                "Lost connection to streaming server.".to_string()
            };
            let details = format!(
                "{original_error}\n{}\nPlease check your connection to the Internet.",
                self.last_error
            );
            self.emit_error(text, details);
        }
        false
    }

    /// One drained region: encode, then service the metadata heartbeat.
    fn process(&mut self, buf: &[f32]) {
        if !self.profile.enabled() {
            return;
        }
        self.set_state(WorkerState::Busy);
        if self.status.get() != ConnectionStatus::Connected {
            return;
        }

        if !buf.is_empty() {
            let Self {
                encoder,
                client,
                status,
                failures,
                pending_reconnect,
                config,
                last_error,
                ..
            } = self;
            if let (Some(encoder), Some(client)) = (encoder.as_mut(), client.as_mut()) {
                let mut sink = TransmitSink {
                    client,
                    status: &**status,
                    failures,
                    reconnect: pending_reconnect,
                    last_error,
                    max_cache: config.max_network_cache,
                    max_failures: config.max_send_failures,
                    busy_backoff: config.busy_backoff,
                };
                encoder.encode_buffer(buf, &mut sink);
            }
        }

        if self.metadata_changed() {
            self.update_metadata();
        }
        self.set_state(WorkerState::Ready);
    }

    /// Heartbeat-gated change detection against the now-playing oracle.
    ///
    /// Tracks with valid ids compare by id; otherwise artist and title
    /// decide.
    fn metadata_changed(&mut self) -> bool {
        if self.meta_life < self.config.metadata_heartbeat {
            self.meta_life += 1;
            return false;
        }
        self.meta_life = 0;

        let Some(track) = self.now_playing.current_track() else {
            return false;
        };
        if let Some(prev) = &self.tracked {
            let same = match (track.id, prev.id) {
                (Some(a), Some(b)) => a == b,
                _ => track.artist == prev.artist && track.title == prev.title,
            };
            if same {
                return false;
            }
        }
        self.tracked = Some(track);
        true
    }

    fn update_metadata(&mut self) {
        let meta = self.snapshot.metadata.clone();
        let is_mp3 = self.snapshot.format == StreamFormat::Mp3;
        let is_icecast2 = self.snapshot.server == ServerKind::Icecast2;

        // Dynamic metadata works cleanly for MP3; retagging a live Ogg
        // stream interrupts listeners, so Ogg only follows track changes
        // when the profile opted in.
        if !meta.custom && (is_mp3 || meta.ogg_dynamic_update) {
            let Some(track) = self.tracked.clone() else {
                return;
            };
            if let Some(encoder) = self.encoder.as_mut() {
                encoder.update_metadata(&track.artist, &track.title, &track.album);
            }
            let Some(client) = self.client.as_ref() else {
                return;
            };
            if !is_mp3 && is_icecast2 {
                // Icecast2 keeps artist and title apart for non-MP3
                // payloads; "song" is an alias for "title" there.
                let _ = client.update_metadata(&[
                    ("artist", track.artist.as_str()),
                    ("title", track.title.as_str()),
                ]);
            } else {
                let song = render_template(&meta.format, &track.artist, &track.title);
                let _ = client.update_metadata(&[("song", song.as_str())]);
            }
        } else if meta.custom && !self.first_call {
            if let Some(encoder) = self.encoder.as_mut() {
                encoder.update_metadata(&meta.custom_artist, &meta.custom_title, "");
            }
            let Some(client) = self.client.as_ref() else {
                return;
            };
            if !is_mp3 && is_icecast2 {
                let _ = client.update_metadata(&[
                    ("artist", meta.custom_artist.as_str()),
                    ("title", meta.custom_title.as_str()),
                ]);
            } else {
                let song = if meta.custom_artist.is_empty() {
                    meta.custom_title.clone()
                } else {
                    format!("{} - {}", meta.custom_artist, meta.custom_title)
                };
                let _ = client.update_metadata(&[("song", song.as_str())]);
            }
            // Static metadata only needs to go out once per session.
            self.first_call = true;
        }
    }
}

/// Encoder sink that pushes bytes down the wire, tracking failures and
/// backlog for the owning worker.
struct TransmitSink<'a> {
    client: &'a mut SourceClient,
    status: &'a StatusCell,
    failures: &'a mut u32,
    reconnect: &'a mut bool,
    last_error: &'a mut String,
    max_cache: usize,
    max_failures: u32,
    busy_backoff: Duration,
}

impl TransmitSink<'_> {
    fn write_single(&mut self, data: &[u8]) -> bool {
        match self.client.send_raw(data) {
            Ok(SendOutcome::Sent) => {
                *self.failures = 0;
                true
            },
            Ok(SendOutcome::Busy) => {
                // Bytes are queued; give the socket a moment and try to
                // push the queue out.
                trace!("transport busy, flushing after backoff");
                std::thread::sleep(self.busy_backoff);
                let _ = self.client.try_flush();
                true
            },
            Err(e) => {
                *self.last_error = e.to_string();
                *self.failures += 1;
                debug!(failures = *self.failures, "send failed: {e}");
                if *self.failures > self.max_failures {
                    *self.reconnect = true;
                }
                false
            },
        }
    }
}

impl EncoderSink for TransmitSink<'_> {
    fn write(&mut self, header: &[u8], body: &[u8]) {
        // Late callbacks (e.g. an encoder flush) after the connection went
        // down are dropped on the floor.
        if self.status.get() != ConnectionStatus::Connected || *self.reconnect {
            return;
        }

        if !header.is_empty() && !self.write_single(header) {
            return;
        }
        if !self.write_single(body) {
            return;
        }

        let queued = self.client.queue_len();
        if queued > 0 {
            debug!(queued, "transport backlog");
            if queued > self.max_cache {
                *self.last_error = "network cache overflow".into();
                *self.reconnect = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MP3_FRAME_SIZE;
    use crate::profile::{ChannelMode, ReconnectSettings};
    use crate::stream::NetworkStream;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Instant;

    struct Silent;

    impl NowPlaying for Silent {
        fn current_track(&self) -> Option<TrackInfo> {
            None
        }
    }

    struct Harness {
        connection: ShoutConnection,
        profile: Arc<Profile>,
        slot: Arc<StreamSlot>,
        data_tx: flume::Sender<()>,
        events: flume::Receiver<BroadcastEvent>,
        #[allow(dead_code)]
        stream: Arc<NetworkStream>,
    }

    fn harness(settings: ProfileSettings, config: Config) -> Harness {
        let stream = Arc::new(NetworkStream::new());
        stream.start_stream(44_100);
        let profile = Arc::new(Profile::new("test", settings));
        profile.set_enabled(true);

        let (data_tx, data_rx) = flume::bounded(1);
        let slot = Arc::new(StreamSlot::new(
            "test".into(),
            MP3_FRAME_SIZE * 8,
            MP3_FRAME_SIZE,
            stream.clock(),
            data_tx.clone(),
        ));
        let (events_tx, events) = flume::unbounded();

        let connection = ShoutConnection::new(
            Arc::clone(&profile),
            Arc::clone(&slot),
            Arc::new(config),
            Arc::new(AtomicBool::new(true)),
            Arc::new(Silent),
            events_tx,
            data_rx,
        );
        Harness {
            connection,
            profile,
            slot,
            data_tx,
            events,
            stream,
        }
    }

    fn fast_config() -> Config {
        Config::default()
            .connect_poll_interval(Duration::from_millis(10))
            .max_connect_polls(50)
            .join_grace(Duration::from_secs(8))
    }

    fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for: {what}");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn drain_events(events: &flume::Receiver<BroadcastEvent>) -> Vec<BroadcastEvent> {
        events.try_iter().collect()
    }

    #[test]
    fn shoutcast_with_vorbis_fails_before_any_socket_use() {
        let mut settings = ProfileSettings::default();
        settings.server = ServerKind::Shoutcast;
        settings.format = StreamFormat::Vorbis;
        // An unroutable host proves no socket call happens: validation
        // must reject the combination first.
        settings.host = "no-such-host.invalid".into();

        let mut h = harness(settings, fast_config());
        assert!(h.connection.connect());

        wait_until("terminal failure", || {
            h.connection.status() == ConnectionStatus::Failure && !h.profile.enabled()
        });

        let events = drain_events(&h.events);
        let errors: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, BroadcastEvent::Error { .. }))
            .collect();
        assert_eq!(errors.len(), 1, "exactly one error dialog: {events:?}");
        assert!(!events
            .iter()
            .any(|e| matches!(e, BroadcastEvent::Connected { .. })));
    }

    #[test]
    fn retry_budget_is_honored_then_profile_disabled() {
        // Nothing listens on this port.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut settings = ProfileSettings::default();
        settings.host = "127.0.0.1".into();
        settings.port = port;
        settings.reconnect = ReconnectSettings {
            enabled: true,
            first_delay_secs: 0.1,
            period_secs: 0.2,
            limit_retries: true,
            max_retries: 2,
        };

        let started = Instant::now();
        let mut h = harness(settings, fast_config());
        assert!(h.connection.connect());

        wait_until("give-up", || {
            h.connection.status() == ConnectionStatus::Failure && !h.profile.enabled()
        });
        // Initial attempt plus two scheduled retries were waited out.
        assert!(started.elapsed() >= Duration::from_millis(280));

        let events = drain_events(&h.events);
        assert!(events.iter().any(|e| matches!(
            e,
            BroadcastEvent::Error { text, .. } if text.contains("2 attempts")
        )));
    }

    #[test]
    fn disabled_reconnect_fails_after_single_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut settings = ProfileSettings::default();
        settings.host = "127.0.0.1".into();
        settings.port = port;
        settings.reconnect.enabled = false;

        let mut h = harness(settings, fast_config());
        assert!(h.connection.connect());
        wait_until("give-up", || !h.profile.enabled());
        assert_eq!(h.connection.status(), ConnectionStatus::Failure);
    }

    #[test]
    fn mp3_session_streams_and_disconnects_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let mut seen = Vec::new();
            while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = conn.read(&mut buf).unwrap();
                seen.extend_from_slice(&buf[..n]);
            }
            conn.write_all(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();
            let mut payload = Vec::new();
            loop {
                match conn.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => payload.extend_from_slice(&buf[..n]),
                }
            }
            payload
        });

        let mut settings = ProfileSettings::default();
        settings.host = "127.0.0.1".into();
        settings.port = port;
        settings.format = StreamFormat::Mp3;
        settings.channels = ChannelMode::Stereo;

        let mut h = harness(settings, fast_config());
        assert!(h.connection.connect());
        wait_until("connected", || {
            h.connection.status() == ConnectionStatus::Connected
        });

        // Feed a few codec frames of audio and wake the worker.
        for _ in 0..4 {
            let frames = vec![0.0f32; MP3_FRAME_SIZE * 2 * 2];
            h.slot.ring.write(&frames, MP3_FRAME_SIZE * 2);
            let _ = h.data_tx.try_send(());
            std::thread::sleep(Duration::from_millis(20));
        }

        h.profile.set_enabled(false);
        wait_until("disconnected", || {
            h.connection.status() == ConnectionStatus::Unconnected
        });
        h.connection.shutdown();

        let payload = server.join().unwrap();
        assert!(!payload.is_empty(), "server should have received MP3 frames");
        assert_eq!(payload[0], 0xFF, "payload starts on an MP3 sync word");

        let events = drain_events(&h.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, BroadcastEvent::Connected { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, BroadcastEvent::Disconnected { .. })));
    }

    #[test]
    fn disabling_mid_connect_poll_cancels_cleanly() {
        // A listener that accepts but never answers keeps the client in
        // its polling phase.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent_server = std::thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_secs(2));
            drop(conn);
        });

        let mut settings = ProfileSettings::default();
        settings.host = "127.0.0.1".into();
        settings.port = port;

        let mut h = harness(settings, fast_config());
        assert!(h.connection.connect());
        wait_until("connecting", || {
            h.connection.status() == ConnectionStatus::Connecting
        });

        h.profile.set_enabled(false);
        wait_until("cancelled", || {
            h.connection.status() == ConnectionStatus::Unconnected
        });
        assert!(drain_events(&h.events)
            .iter()
            .all(|e| !matches!(e, BroadcastEvent::Connected { .. })));
        silent_server.join().unwrap();
    }

    #[test]
    fn track_changes_compare_by_id_then_text() {
        use parking_lot::Mutex;

        struct Scripted(Mutex<Option<TrackInfo>>);
        impl NowPlaying for Scripted {
            fn current_track(&self) -> Option<TrackInfo> {
                self.0.lock().clone()
            }
        }

        let oracle = Arc::new(Scripted(Mutex::new(None)));
        let (events_tx, _events) = flume::unbounded();
        let (data_tx, data_rx) = flume::bounded(1);
        let stream = NetworkStream::new();
        let profile = Arc::new(Profile::new("meta", ProfileSettings::default()));
        let seed = WorkerSeed {
            profile,
            slot: Arc::new(StreamSlot::new(
                "meta".into(),
                64,
                16,
                stream.clock(),
                data_tx,
            )),
            status: Arc::new(StatusCell::new()),
            config: Arc::new(Config::default().metadata_heartbeat(0)),
            global_enabled: Arc::new(AtomicBool::new(true)),
            now_playing: Arc::clone(&oracle) as Arc<dyn NowPlaying>,
            events: events_tx,
            data_rx,
            live: Arc::new(AtomicBool::new(true)),
            done_tx: flume::bounded(1).0,
        };
        let mut worker = Worker::new(seed);

        // Nothing playing: no change.
        assert!(!worker.metadata_changed());

        let track = |id: Option<u64>, artist: &str, title: &str| TrackInfo {
            id,
            artist: artist.into(),
            title: title.into(),
            album: String::new(),
        };

        *oracle.0.lock() = Some(track(Some(1), "A", "T"));
        assert!(worker.metadata_changed());
        assert!(!worker.metadata_changed(), "same id is not a change");

        *oracle.0.lock() = Some(track(Some(2), "A", "T"));
        assert!(worker.metadata_changed(), "new id is a change");

        // Without ids, artist and title decide.
        *oracle.0.lock() = Some(track(None, "A", "T"));
        assert!(!worker.metadata_changed(), "same text is not a change");
        *oracle.0.lock() = Some(track(None, "A", "T2"));
        assert!(worker.metadata_changed(), "new title is a change");
    }

    #[test]
    fn heartbeat_gates_oracle_queries() {
        struct Counting(std::sync::atomic::AtomicU32);
        impl NowPlaying for Counting {
            fn current_track(&self) -> Option<TrackInfo> {
                self.0.fetch_add(1, Ordering::Relaxed);
                None
            }
        }

        let oracle = Arc::new(Counting(std::sync::atomic::AtomicU32::new(0)));
        let (events_tx, _events) = flume::unbounded();
        let (data_tx, data_rx) = flume::bounded(1);
        let stream = NetworkStream::new();
        let seed = WorkerSeed {
            profile: Arc::new(Profile::new("beat", ProfileSettings::default())),
            slot: Arc::new(StreamSlot::new(
                "beat".into(),
                64,
                16,
                stream.clock(),
                data_tx,
            )),
            status: Arc::new(StatusCell::new()),
            config: Arc::new(Config::default()),
            global_enabled: Arc::new(AtomicBool::new(true)),
            now_playing: Arc::clone(&oracle) as Arc<dyn NowPlaying>,
            events: events_tx,
            data_rx,
            live: Arc::new(AtomicBool::new(true)),
            done_tx: flume::bounded(1).0,
        };
        let mut worker = Worker::new(seed);
        worker.meta_life = worker.config.metadata_heartbeat;

        // One query up front, then one every heartbeat + 1 cycles.
        let cycles = 2 * (worker.config.metadata_heartbeat + 1) + 1;
        for _ in 0..cycles {
            worker.metadata_changed();
        }
        assert_eq!(oracle.0.load(Ordering::Relaxed), 3);
    }
}
