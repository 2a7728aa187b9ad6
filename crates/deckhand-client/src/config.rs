use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Bounded reconnection policy for one channel connection.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Consecutive failed connect attempts tolerated before the channel
    /// gives up for the life of the process. Resets after any successful
    /// connect.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl ReconnectPolicy {
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let next = current + current;
        if next > self.max_backoff {
            self.max_backoff
        } else {
            next
        }
    }
}

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Directory holding one `<channel>.sock` endpoint per channel.
    pub socket_dir: PathBuf,
    pub client_id: String,
    pub reconnect: ReconnectPolicy,
    /// Per-subscriber delivery queue capacity.
    pub queue_capacity: usize,
}

impl RegistryConfig {
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            client_id: format!("console-{}", uuid::Uuid::new_v4()),
            reconnect: ReconnectPolicy::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn socket_path(&self, channel: &str) -> PathBuf {
        self.socket_dir.join(format!("{channel}.sock"))
    }
}

pub fn resolve_socket_dir(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    if let Ok(value) = std::env::var("DECKHAND_SOCKET_DIR") {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    Path::new("/run/deckhand").to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = ReconnectPolicy::default();
        let mut backoff = policy.initial_backoff;
        backoff = policy.next_backoff(backoff);
        assert_eq!(backoff, Duration::from_secs(2));
        backoff = policy.next_backoff(backoff);
        assert_eq!(backoff, Duration::from_secs(4));
        backoff = policy.next_backoff(backoff);
        assert_eq!(backoff, Duration::from_secs(8));
        backoff = policy.next_backoff(backoff);
        assert_eq!(backoff, Duration::from_secs(10));
        assert_eq!(policy.next_backoff(backoff), Duration::from_secs(10));
    }

    #[test]
    fn socket_path_is_per_channel() {
        let config = RegistryConfig::new("/tmp/deckhand");
        assert_eq!(
            config.socket_path("installer"),
            PathBuf::from("/tmp/deckhand/installer.sock")
        );
    }
}
