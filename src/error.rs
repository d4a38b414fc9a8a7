//! Error types, re-exported from their home modules.

pub use crate::connection::error::{ConfigError, Result as ConnectionResult, SourceError};
pub use crate::encoder::{EncoderError, Result as EncoderResult};
