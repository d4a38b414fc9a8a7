//! Ownership and control of the destination set.

use crate::config::Config;
use crate::connection::{ConnectionStatus, ShoutConnection};
use crate::events::BroadcastEvent;
use crate::metadata::NowPlaying;
use crate::profile::Profile;
use crate::stream::{NetworkStream, StreamSlot};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use tracing::{debug, info};

/// Process-wide network init, run once before the first coordinator is
/// built.
///
/// A remote end closing its socket mid-send raises SIGPIPE on unix,
/// which would take the whole process down; writes report the error
/// instead once the signal is ignored.
fn net_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        #[cfg(unix)]
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
    });
}

/// Owns every [`Profile`] → [`ShoutConnection`] pair and reacts to
/// profile and enable changes.
///
/// The map is keyed by profile name and guarded by a mutex; only control
/// threads touch it. Workers observe their profile's `enabled` flag and
/// the global flag, so removal and teardown are just flag flips followed
/// by a join.
pub struct BroadcastCoordinator {
    config: Arc<Config>,
    stream: Arc<NetworkStream>,
    now_playing: Arc<dyn NowPlaying>,
    connections: Mutex<HashMap<String, ShoutConnection>>,
    enabled: Arc<AtomicBool>,
    events_tx: flume::Sender<BroadcastEvent>,
    events_rx: flume::Receiver<BroadcastEvent>,
}

impl BroadcastCoordinator {
    /// Builds a coordinator over the given stream and now-playing
    /// oracle.
    pub fn new(
        config: Config,
        stream: Arc<NetworkStream>,
        now_playing: Arc<dyn NowPlaying>,
    ) -> Self {
        net_init();
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            config: Arc::new(config),
            stream,
            now_playing,
            connections: Mutex::new(HashMap::new()),
            enabled: Arc::new(AtomicBool::new(false)),
            events_tx,
            events_rx,
        }
    }

    /// A receiver for connection lifecycle events.
    pub fn events(&self) -> flume::Receiver<BroadcastEvent> {
        self.events_rx.clone()
    }

    /// Whether broadcasting is globally on.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Sets the global enable flag. Turning it on re-applies settings to
    /// every idle worker; turning it off lets workers observe the flag
    /// and wind down on their own.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        info!(enabled, "broadcasting toggled");
        if enabled {
            self.apply_settings_to_all();
        } else {
            // Wake every worker so the flag is noticed promptly.
            for conn in self.connections.lock().values() {
                conn.profile().wake();
            }
        }
    }

    /// Control-surface entry point: the enable control is a 4-state
    /// button whose values wrap back to zero above 1.0; anything
    /// positive means "on". Returns the normalized value.
    pub fn on_enable_changed(&self, value: f64) -> f64 {
        let value = if value > 1.0 { 0.0 } else { value };
        self.set_enabled(value > 0.0);
        value
    }

    /// Registers a destination. No-op if a profile with the same name is
    /// already present; returns whether the connection was created.
    pub fn add_connection(&self, profile: Arc<Profile>) -> bool {
        let name = profile.name();
        let mut connections = self.connections.lock();
        if connections.contains_key(&name) {
            return false;
        }

        let (data_tx, data_rx) = flume::bounded(1);
        let slot = Arc::new(StreamSlot::new(
            name.clone(),
            self.config.ring_frames,
            profile.settings().format.frame_size(),
            self.stream.clock(),
            data_tx,
        ));
        if !self.stream.add_worker(Arc::clone(&slot)) {
            return false;
        }

        let mut connection = ShoutConnection::new(
            profile,
            slot,
            Arc::clone(&self.config),
            Arc::clone(&self.enabled),
            Arc::clone(&self.now_playing),
            self.events_tx.clone(),
            data_rx,
        );
        if self.enabled() {
            connection.connect();
        }
        connections.insert(name.clone(), connection);
        debug!(profile = %name, "created connection");
        true
    }

    /// Removes a destination: disables its profile (the worker exits on
    /// its own), deregisters the slot and joins the thread.
    pub fn remove_connection(&self, name: &str) -> bool {
        let connection = self.connections.lock().remove(name);
        match connection {
            Some(mut connection) => {
                connection.profile().set_enabled(false);
                self.stream.remove_worker(connection.slot());
                connection.shutdown();
                debug!(profile = %name, "removed connection");
                true
            },
            None => false,
        }
    }

    /// Moves an existing worker under the profile's new name. The
    /// profile itself is expected to already carry the new name.
    pub fn rename_connection(&self, old_name: &str, profile: &Arc<Profile>) -> bool {
        let mut connections = self.connections.lock();
        match connections.remove(old_name) {
            Some(connection) => {
                let new_name = profile.name();
                debug!(from = %old_name, to = %new_name, "renamed connection");
                connections.insert(new_name, connection);
                true
            },
            None => false,
        }
    }

    /// Re-applies profile settings to every worker. Only workers that
    /// are currently Unconnected or in Failure pick them up; live
    /// sessions keep their settings.
    pub fn apply_settings_to_all(&self) {
        for connection in self.connections.lock().values_mut() {
            connection.apply_settings();
        }
    }

    /// Observable status of one destination.
    pub fn status_of(&self, name: &str) -> Option<ConnectionStatus> {
        self.connections.lock().get(name).map(ShoutConnection::status)
    }

    /// Names of all registered destinations.
    pub fn profile_names(&self) -> Vec<String> {
        self.connections.lock().keys().cloned().collect()
    }

    /// Tears everything down: disables all profiles and joins all
    /// workers.
    pub fn shutdown(&self) {
        let mut connections = self.connections.lock();
        for (_, mut connection) in connections.drain() {
            connection.profile().set_enabled(false);
            self.stream.remove_worker(connection.slot());
            connection.shutdown();
        }
    }
}

impl Drop for BroadcastCoordinator {
    fn drop(&mut self) {
        self.enabled.store(false, Ordering::Release);
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::TrackInfo;
    use crate::profile::ProfileSettings;

    struct Silent;

    impl NowPlaying for Silent {
        fn current_track(&self) -> Option<TrackInfo> {
            None
        }
    }

    fn coordinator() -> BroadcastCoordinator {
        BroadcastCoordinator::new(
            Config::default(),
            Arc::new(NetworkStream::new()),
            Arc::new(Silent),
        )
    }

    fn profile(name: &str) -> Arc<Profile> {
        Arc::new(Profile::new(name, ProfileSettings::default()))
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let coordinator = coordinator();
        assert!(coordinator.add_connection(profile("a")));
        assert!(!coordinator.add_connection(profile("a")));
        assert_eq!(coordinator.stream.worker_count(), 1);
    }

    #[test]
    fn remove_drops_worker_and_slot() {
        let coordinator = coordinator();
        coordinator.add_connection(profile("a"));
        coordinator.add_connection(profile("b"));
        assert_eq!(coordinator.stream.worker_count(), 2);

        assert!(coordinator.remove_connection("a"));
        assert!(!coordinator.remove_connection("a"));
        assert_eq!(coordinator.stream.worker_count(), 1);
        assert_eq!(coordinator.status_of("a"), None);
        assert_eq!(
            coordinator.status_of("b"),
            Some(ConnectionStatus::Unconnected)
        );
    }

    #[test]
    fn rename_moves_the_worker() {
        let coordinator = coordinator();
        let p = profile("old");
        coordinator.add_connection(Arc::clone(&p));

        p.set_name("new");
        assert!(coordinator.rename_connection("old", &p));
        assert_eq!(coordinator.status_of("old"), None);
        assert!(coordinator.status_of("new").is_some());
    }

    #[test]
    fn enable_control_wraps_above_one() {
        let coordinator = coordinator();
        assert_eq!(coordinator.on_enable_changed(1.0), 1.0);
        assert!(coordinator.enabled());
        assert_eq!(coordinator.on_enable_changed(2.0), 0.0);
        assert!(!coordinator.enabled());
        assert_eq!(coordinator.on_enable_changed(0.5), 0.5);
        assert!(coordinator.enabled());
    }
}
