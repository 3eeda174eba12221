use std::time::Duration;

use uuid::Uuid;

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(2500);

/// Largest message a transport will accept (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Largest UDP datagram payload.
pub const UDP_MAX_MESSAGE_SIZE: usize = 1400;

/// Retry schedule for reliable-mode UDP calls. The sender retransmits the
/// request with exponential backoff until an answer keyed by the request
/// id arrives or the budget is exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpRetryConfig {
    /// Delay before the first retransmit. Default 50 ms.
    pub initial_backoff: Duration,
    /// Backoff ceiling. Default 800 ms.
    pub max_backoff: Duration,
    /// Total send attempts, the initial one included. Default 5.
    pub budget: u32,
}

impl Default for UdpRetryConfig {
    fn default() -> Self {
        UdpRetryConfig {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(800),
            budget: 5,
        }
    }
}

/// How a shared-memory ring reader waits for new data.
///
/// `Yield` spins a bounded number of times and then yields the thread;
/// `Spin` never yields (lowest latency, one core pinned per direction).
/// A futex-based waiter would slot in here as a platform extension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShmWakeup {
    Spin,
    #[default]
    Yield,
}

/// Runtime configuration. Transports whose port is 0 (or whose channel is
/// unset) are disabled; everything defaults to off.
#[derive(Clone, Debug)]
pub struct Config {
    pub tcp_port: u16,
    pub udp_port: u16,
    pub ws_port: u16,
    pub http_port: u16,
    pub http_ssl_enabled: bool,
    pub http_cert_file: Option<String>,
    pub http_key_file: Option<String>,
    /// Shared-memory listener channel id (`mem://<channel>`), if serving.
    pub mem_channel: Option<String>,
    /// Hostname advertised in minted object URLs.
    pub hostname: String,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Origin UUID of this runtime. Fresh v4 unless pinned (persistent
    /// references need a stable origin across restarts).
    pub uuid: Uuid,
    /// Worker threads for servant dispatch. 0 means the embedder drives
    /// the runtime from its own current-thread executor.
    pub worker_thread_count: usize,
    pub call_timeout: Duration,
    pub max_message_size: usize,
    pub udp_retry: UdpRetryConfig,
    pub shm_wakeup: ShmWakeup,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tcp_port: 0,
            udp_port: 0,
            ws_port: 0,
            http_port: 0,
            http_ssl_enabled: false,
            http_cert_file: None,
            http_key_file: None,
            mem_channel: None,
            hostname: "localhost".to_string(),
            log_level: "info".to_string(),
            uuid: Uuid::new_v4(),
            worker_thread_count: 0,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            udp_retry: UdpRetryConfig::default(),
            shm_wakeup: ShmWakeup::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_disable_all_transports() {
        let c = Config::default();
        assert_eq!(c.tcp_port, 0);
        assert_eq!(c.udp_port, 0);
        assert_eq!(c.http_port, 0);
        assert!(c.mem_channel.is_none());
        assert_eq!(c.call_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn udp_retry_defaults() {
        let r = UdpRetryConfig::default();
        assert_eq!(r.initial_backoff, Duration::from_millis(50));
        assert_eq!(r.max_backoff, Duration::from_millis(800));
        assert_eq!(r.budget, 5);
    }
}
