//! Broadcast profiles: one immutable-after-apply descriptor per destination.

use crate::constants::DEFAULT_BITRATE;
use crate::metadata::MetadataCharset;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Flavour of server a profile points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerKind {
    /// Icecast 1.x (XAudioCast source protocol).
    Icecast1,
    /// Icecast 2.x (HTTP source protocol).
    Icecast2,
    /// Shoutcast (ICY source protocol); MP3 only.
    Shoutcast,
}

/// Stream payload format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamFormat {
    /// MPEG-1 layer III.
    Mp3,
    /// Ogg Vorbis.
    Vorbis,
    /// Ogg Opus.
    Opus,
    /// AAC-LC in ADTS framing.
    Aac,
    /// HE-AAC in ADTS framing.
    HeAac,
}

impl StreamFormat {
    /// MIME type announced to the server.
    pub fn mime(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Vorbis | Self::Opus => "application/ogg",
            Self::Aac | Self::HeAac => "audio/aac",
        }
    }

    /// Whether the payload is an Ogg bitstream.
    pub fn is_ogg(self) -> bool {
        matches!(self, Self::Vorbis | Self::Opus)
    }

    /// Codec frame length in samples per channel; also the unit used by
    /// drift correction.
    pub fn frame_size(self) -> usize {
        use crate::constants::*;
        match self {
            Self::Mp3 => MP3_FRAME_SIZE,
            Self::Vorbis => VORBIS_BLOCK_SIZE,
            Self::Opus => OPUS_FRAME_SIZE,
            Self::Aac => AAC_FRAME_SIZE,
            Self::HeAac => 2 * AAC_FRAME_SIZE,
        }
    }
}

/// Output channel selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMode {
    /// Downmix to a single channel.
    Mono,
    /// Two channels.
    Stereo,
    /// Follow the engine; resolves to stereo.
    #[default]
    Automatic,
}

impl ChannelMode {
    /// Concrete channel count.
    pub fn channels(self) -> u32 {
        match self {
            Self::Mono => 1,
            Self::Stereo | Self::Automatic => 2,
        }
    }
}

/// How stream metadata is produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataSettings {
    /// Use the fixed artist/title below instead of the now-playing track.
    pub custom: bool,
    /// Static artist, when `custom` is set.
    pub custom_artist: String,
    /// Static title, when `custom` is set.
    pub custom_title: String,
    /// Template rendered into the `song` field; `$artist` and `$title`
    /// are substituted.
    pub format: String,
    /// Charset for server-bound strings.
    pub charset: MetadataCharset,
    /// Also push track changes on Ogg streams. Off by default: retagging a
    /// live Ogg stream interrupts playback on most clients.
    pub ogg_dynamic_update: bool,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            custom: false,
            custom_artist: String::new(),
            custom_title: String::new(),
            format: "$artist - $title".into(),
            charset: MetadataCharset::default(),
            ogg_dynamic_update: false,
        }
    }
}

/// Reconnection behaviour after a dropped or failed connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    /// Master switch; when off, a single failure is terminal.
    pub enabled: bool,
    /// Wait before the first retry, in seconds.
    pub first_delay_secs: f64,
    /// Wait between subsequent retries, in seconds.
    pub period_secs: f64,
    /// Whether `max_retries` applies.
    pub limit_retries: bool,
    /// Retry budget when limited.
    pub max_retries: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            first_delay_secs: 0.0,
            period_secs: 5.0,
            limit_retries: true,
            max_retries: 10,
        }
    }
}

impl ReconnectSettings {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = if attempt <= 1 {
            self.first_delay_secs
        } else {
            self.period_secs
        };
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Everything needed to reach and describe one destination.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileSettings {
    /// Server flavour.
    pub server: ServerKind,
    /// Host name or address; a scheme or leading `//` is tolerated.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Mount point; a leading `/` is added if missing.
    pub mount: String,
    /// Source login. Empty selects the server-kind default.
    pub login: String,
    /// Source password.
    pub password: String,
    /// Public stream name.
    pub stream_name: String,
    /// Public stream description.
    pub stream_desc: String,
    /// Public stream genre.
    pub stream_genre: String,
    /// Public stream website.
    pub stream_website: String,
    /// Whether the server should list the stream in directories.
    pub stream_public: bool,
    /// Payload codec.
    pub format: StreamFormat,
    /// Target bitrate in kbps, from [`SUPPORTED_BITRATES`].
    ///
    /// [`SUPPORTED_BITRATES`]: crate::constants::SUPPORTED_BITRATES
    pub bitrate: u32,
    /// Output channel selection.
    pub channels: ChannelMode,
    /// Metadata policy.
    pub metadata: MetadataSettings,
    /// Reconnect policy.
    pub reconnect: ReconnectSettings,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            server: ServerKind::Icecast2,
            host: String::new(),
            port: 8000,
            mount: "/mount".into(),
            login: String::new(),
            password: String::new(),
            stream_name: String::new(),
            stream_desc: String::new(),
            stream_genre: String::new(),
            stream_website: String::new(),
            stream_public: false,
            format: StreamFormat::Mp3,
            bitrate: DEFAULT_BITRATE,
            channels: ChannelMode::default(),
            metadata: MetadataSettings::default(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl ProfileSettings {
    /// Mount point with its leading `/` enforced.
    pub fn normalized_mount(&self) -> String {
        if self.mount.is_empty() || self.mount.starts_with('/') {
            self.mount.clone()
        } else {
            format!("/{}", self.mount)
        }
    }
}

/// One destination, shared between the coordinator (which may edit it
/// while its worker is down) and the worker (which snapshots settings on
/// connect and watches `enabled`).
///
/// Clearing `enabled` is the universal cancel: every wait inside a worker
/// is parked on the profile's condvar and re-checks the flag on wake.
pub struct Profile {
    name: RwLock<String>,
    settings: RwLock<ProfileSettings>,
    enabled: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

impl Profile {
    /// Creates a disabled profile.
    pub fn new(name: impl Into<String>, settings: ProfileSettings) -> Self {
        Self {
            name: RwLock::new(name.into()),
            settings: RwLock::new(settings),
            enabled: AtomicBool::new(false),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    /// The profile's unique name.
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    /// A snapshot of the current settings.
    pub fn settings(&self) -> ProfileSettings {
        self.settings.read().clone()
    }

    /// Replaces the settings. Takes effect the next time the worker
    /// (re)connects.
    pub fn set_settings(&self, settings: ProfileSettings) {
        *self.settings.write() = settings;
    }

    /// Whether the destination should be streaming.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Flips the enabled flag and wakes the worker so it can act on it.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        let _guard = self.wake_lock.lock();
        self.wake.notify_all();
    }

    /// Wakes a parked worker without changing the enabled flag, e.g.
    /// when the global enable changed instead.
    pub(crate) fn wake(&self) {
        let _guard = self.wake_lock.lock();
        self.wake.notify_all();
    }

    /// Parks the calling worker for at most `timeout`, returning early if
    /// the enabled flag is toggled.
    pub(crate) fn wait_wake(&self, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }
        let mut guard = self.wake_lock.lock();
        let _ = self.wake.wait_for(&mut guard, timeout);
    }
}

impl std::fmt::Debug for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profile")
            .field("name", &self.name())
            .field("enabled", &self.enabled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_gains_leading_slash() {
        let mut s = ProfileSettings::default();
        s.mount = "live".into();
        assert_eq!(s.normalized_mount(), "/live");
        s.mount = "/live".into();
        assert_eq!(s.normalized_mount(), "/live");
    }

    #[test]
    fn reconnect_delays_follow_schedule() {
        let r = ReconnectSettings {
            first_delay_secs: 1.0,
            period_secs: 2.0,
            ..Default::default()
        };
        assert_eq!(r.delay_for(1), Duration::from_secs(1));
        assert_eq!(r.delay_for(2), Duration::from_secs(2));
        assert_eq!(r.delay_for(7), Duration::from_secs(2));
    }

    #[test]
    fn set_enabled_wakes_waiters() {
        use std::sync::Arc;
        use std::time::Instant;

        let profile = Arc::new(Profile::new("a", ProfileSettings::default()));
        let waiter = {
            let profile = Arc::clone(&profile);
            std::thread::spawn(move || {
                let start = Instant::now();
                profile.wait_wake(Duration::from_secs(10));
                start.elapsed()
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        profile.set_enabled(false);
        let waited = waiter.join().unwrap();
        assert!(waited < Duration::from_secs(5));
    }
}
