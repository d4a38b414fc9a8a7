//! Connection errors and convenience types.

use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;

/// Errors raised while reaching or feeding a streaming server.
#[derive(Debug)]
#[non_exhaustive]
pub enum SourceError {
    /// The client was asked to act from an impossible state or with
    /// unusable parameters (missing host, unresolvable address).
    Setup(String),
    /// The requested protocol/format combination cannot be expressed.
    Unsupported(&'static str),
    /// The server refused the source credentials.
    LoginRefused,
    /// Out of sockets, memory or similar local resources.
    Resource(String),
    /// The server answered the handshake with a non-auth failure.
    Refused(String),
    /// Transport-level failure; the connection is gone.
    Socket(IoError),
    /// The connect poll budget ran out.
    TimedOut,
}

impl SourceError {
    /// Whether retrying with the same parameters is pointless.
    ///
    /// Fatal kinds abandon the reconnect loop immediately; everything
    /// else goes through the profile's retry schedule.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Setup(_) | Self::Unsupported(_) | Self::LoginRefused | Self::Resource(_)
        )
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup(detail) => write!(f, "connection setup is unusable: {detail}"),
            Self::Unsupported(what) => write!(f, "unsupported combination: {what}"),
            Self::LoginRefused => write!(f, "the server refused the source login"),
            Self::Resource(detail) => write!(f, "out of local resources: {detail}"),
            Self::Refused(status) => write!(f, "the server rejected the stream: {status}"),
            Self::Socket(e) => write!(f, "socket error: {e}"),
            Self::TimedOut => write!(f, "connection attempt timed out"),
        }
    }
}

impl StdError for SourceError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Socket(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for SourceError {
    fn from(e: IoError) -> Self {
        Self::Socket(e)
    }
}

/// Profile configurations a worker refuses to start with.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Shoutcast servers only accept MP3 payloads.
    ShoutcastRequiresMp3,
    /// No host was configured.
    MissingHost,
    /// The port is outside 1..=65535.
    InvalidPort,
    /// The bitrate is not in the supported set.
    UnsupportedBitrate(u32),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShoutcastRequiresMp3 => {
                write!(f, "Shoutcast is only supported with the MP3 format")
            },
            Self::MissingHost => write!(f, "no server host configured"),
            Self::InvalidPort => write!(f, "server port must be between 1 and 65535"),
            Self::UnsupportedBitrate(b) => write!(f, "bitrate {b} kbps is not supported"),
        }
    }
}

impl StdError for ConfigError {}

/// Convenience type for connection results.
pub type Result<T> = std::result::Result<T, SourceError>;
