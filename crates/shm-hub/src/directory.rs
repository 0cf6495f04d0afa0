//! External collaborator interfaces: the directory/discovery service and
//! the notification transport are out of scope — the crate only needs to
//! consume them. Each is expressed as a small trait, taken by reference
//! rather than owned, so `create`/`attach` can be exercised in tests
//! without a real directory process.

/// Registers/looks up a segment's path by channel name. The host process
/// wires a real implementation (e.g. talking to a naming service over a
/// socket); this crate never implements one itself.
pub trait DirectoryClient: Send + Sync {
    /// Publishes that `channel` is now backed by the segment at `path`.
    fn register(&self, channel: &str, path: &std::path::Path);

    /// Resolves `channel` to a segment path, if currently registered.
    fn discover(&self, channel: &str) -> Option<std::path::PathBuf>;

    /// Removes a channel's registration, e.g. on producer shutdown.
    fn unregister(&self, channel: &str);
}

/// Wakes a blocked consumer when a new slot commits, instead of it relying
/// purely on spin/backoff polling. Optional: `Producer`/`Consumer` work
/// correctly with no transport at all, just less promptly.
pub trait NotificationTransport: Send + Sync {
    /// Called by the producer after a successful commit.
    fn notify(&self, channel: &str);

    /// Blocks the calling consumer thread until `notify` fires for
    /// `channel` or `timeout` elapses. Returns whether a notification was
    /// observed (as opposed to timing out) — this is advisory; the caller
    /// still re-checks the actual condition itself afterwards.
    fn wait(&self, channel: &str, timeout: std::time::Duration) -> bool;
}

/// A `DirectoryClient` that keeps its registrations in memory. Useful in
/// tests and single-process demos where there is no real directory
/// service to talk to.
#[derive(Default)]
pub struct InProcessDirectory {
    entries: parking_lot::Mutex<std::collections::HashMap<String, std::path::PathBuf>>,
}

impl DirectoryClient for InProcessDirectory {
    fn register(&self, channel: &str, path: &std::path::Path) {
        self.entries
            .lock()
            .insert(channel.to_string(), path.to_path_buf());
    }

    fn discover(&self, channel: &str) -> Option<std::path::PathBuf> {
        self.entries.lock().get(channel).cloned()
    }

    fn unregister(&self, channel: &str) {
        self.entries.lock().remove(channel);
    }
}

/// A `NotificationTransport` that never wakes anyone; `wait` always times
/// out. Lets callers exercise the pure-polling path deliberately.
#[derive(Default)]
pub struct NullTransport;

impl NotificationTransport for NullTransport {
    fn notify(&self, _channel: &str) {}

    fn wait(&self, _channel: &str, timeout: std::time::Duration) -> bool {
        std::thread::sleep(timeout);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_process_directory_roundtrips() {
        let dir = InProcessDirectory::default();
        assert!(dir.discover("ch").is_none());
        dir.register("ch", std::path::Path::new("/tmp/ch.shm"));
        assert_eq!(dir.discover("ch").unwrap(), std::path::PathBuf::from("/tmp/ch.shm"));
        dir.unregister("ch");
        assert!(dir.discover("ch").is_none());
    }

    #[test]
    fn null_transport_always_times_out() {
        let transport = NullTransport;
        let start = std::time::Instant::now();
        let woke = transport.wait("ch", std::time::Duration::from_millis(5));
        assert!(!woke);
        assert!(start.elapsed() >= std::time::Duration::from_millis(5));
    }
}
