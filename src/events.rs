//! Lifecycle events delivered to the embedding application.

/// Something a UI wants to know about a destination.
///
/// Events are delivered over a [`flume`] channel obtained from
/// [`BroadcastCoordinator::events`]; dropping the receiver silently
/// discards further events.
///
/// [`BroadcastCoordinator::events`]: crate::coordinator::BroadcastCoordinator::events
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum BroadcastEvent {
    /// A destination reached steady transmit state.
    Connected {
        /// Profile name.
        profile: String,
    },
    /// A destination dropped out of steady transmit state.
    Disconnected {
        /// Profile name.
        profile: String,
    },
    /// A user-visible error. The worker may have terminated; check the
    /// connection status.
    Error {
        /// Profile name.
        profile: String,
        /// Short, presentable message.
        text: String,
        /// Underlying detail, suitable for a collapsed section.
        details: String,
    },
}
