#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
//! Aircast is the live-broadcasting core of a DJ/mixing application: it
//! takes the real-time stereo PCM stream produced by an audio engine and
//! pushes it to one or more Icecast/Shoutcast servers, encoded as MP3,
//! Ogg Vorbis, Opus or AAC.
//!
//! The library offers:
//!  * A lock-free, drift-corrected fan-out ([`NetworkStream`]) from the
//!    audio thread into per-destination sample rings; the audio thread
//!    never blocks, allocates or takes a lock, no matter what the network
//!    is doing.
//!  * One worker thread per destination ([`connection::ShoutConnection`])
//!    driving connection, encoding, metadata updates, reconnection and
//!    backpressure.
//!  * Codec backends behind one operation set: LAME for MP3, libopus and
//!    libvorbis behind the crate's own Ogg packetizer, and libfdk for
//!    ADTS AAC.
//!  * A [`BroadcastCoordinator`] that owns the set of destination
//!    [`Profile`]s and reacts to add/remove/rename/enable changes.
//!
//! ## Quick start
//!
//! ```no_run
//! use aircast::{BroadcastCoordinator, Config, NetworkStream, Profile, ProfileSettings};
//! use aircast::metadata::{NowPlaying, TrackInfo};
//! use std::sync::Arc;
//!
//! struct Player;
//! impl NowPlaying for Player {
//!     fn current_track(&self) -> Option<TrackInfo> {
//!         None
//!     }
//! }
//!
//! let stream = Arc::new(NetworkStream::new());
//! let coordinator =
//!     BroadcastCoordinator::new(Config::default(), Arc::clone(&stream), Arc::new(Player));
//!
//! let mut settings = ProfileSettings::default();
//! settings.host = "icecast.example.com".into();
//! settings.password = "hackme".into();
//! let profile = Arc::new(Profile::new("main", settings));
//! profile.set_enabled(true);
//! coordinator.add_connection(Arc::clone(&profile));
//! coordinator.set_enabled(true);
//!
//! // On the audio thread:
//! stream.start_stream(48_000);
//! let buffer = vec![0.0f32; 2 * 512];
//! stream.write(&buffer, 512);
//! ```

#![warn(clippy::pedantic, rust_2018_idioms)]
#![allow(
    // Allowed as they are too pedantic
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::too_many_lines,
    clippy::cast_lossless,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

mod config;
pub mod connection;
pub mod constants;
mod coordinator;
pub mod encoder;
pub mod error;
pub mod events;
pub mod fifo;
pub mod metadata;
mod profile;
pub mod stream;

pub use crate::{
    config::Config,
    connection::{ConnectionStatus, ShoutConnection},
    coordinator::BroadcastCoordinator,
    encoder::{Encoder, EncoderSettings, EncoderSink},
    events::BroadcastEvent,
    fifo::SampleRing,
    metadata::{NowPlaying, TrackInfo},
    profile::{
        ChannelMode, MetadataSettings, Profile, ProfileSettings, ReconnectSettings, ServerKind,
        StreamFormat,
    },
    stream::NetworkStream,
};
