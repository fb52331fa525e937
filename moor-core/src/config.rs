//! Daemon configuration and tracing setup.

pub mod cli {
    //! Parse from either cli or env var.

    use std::path::PathBuf;

    pub use clap::Parser;

    use delta_lease::Timeouts;

    /// Default client command socket.
    pub static DEFAULT_SOCKET_PATH: &str = "/run/moor/moord.sock";
    /// Default watchdog multiplexer socket.
    pub static DEFAULT_WDMD_SOCKET: &str = "/run/wdmd/wdmd.sock";
    /// Default i/o timeout in seconds; every protocol interval derives
    /// from it.
    pub const DEFAULT_IO_TIMEOUT: u32 = 10;
    /// tokio worker thread name.
    pub static DEFAULT_THREAD_NAME: &str = "moor-worker";
    /// Default log filter. Can use this argument or the MOOR_LOG env var.
    pub static DEFAULT_MOOR_LOG: &str = "info";
    /// Seconds between SIGTERM and SIGKILL at shutdown.
    pub const DEFAULT_KILL_GRACE: u64 = 3;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "moord", bin_name = "moord", about, long_about = None)]
    /// parses from cli & environment var
    pub struct Config {
        /// path of the client command socket
        #[clap(long, env, value_parser, default_value = DEFAULT_SOCKET_PATH)]
        pub socket_path: PathBuf,
        /// i/o timeout applied to every disk operation, seconds
        #[clap(long, env, value_parser, default_value_t = DEFAULT_IO_TIMEOUT)]
        pub io_timeout: u32,
        /// arm the watchdog multiplexer; disabling this removes fencing
        /// and is only safe on development rigs
        #[clap(long, env, action = clap::ArgAction::Set, default_value_t = true)]
        pub use_watchdog: bool,
        /// watchdog multiplexer socket
        #[clap(long, env, value_parser, default_value = DEFAULT_WDMD_SOCKET)]
        pub wdmd_socket: PathBuf,
        /// open lease disks with O_DIRECT|O_SYNC; turn off for file-backed
        /// test areas
        #[clap(long, env, action = clap::ArgAction::Set, default_value_t = true)]
        pub direct_io: bool,
        /// seconds between SIGTERM and SIGKILL for supervised pids at
        /// shutdown
        #[clap(long, env, value_parser, default_value_t = DEFAULT_KILL_GRACE)]
        pub kill_grace: u64,
        /// worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// set the log level; all valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_MOOR_LOG)]
        pub moor_log: String,
        /// development rigs only: shrink the host-dead wait to this many
        /// seconds
        #[clap(long, env, value_parser)]
        pub host_dead_override: Option<u64>,
    }

    impl Config {
        /// Stock values without going through the argument parser; mostly
        /// for tools and tests that assemble a daemon directly.
        pub fn defaults() -> Self {
            Config {
                socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
                io_timeout: DEFAULT_IO_TIMEOUT,
                use_watchdog: true,
                wdmd_socket: PathBuf::from(DEFAULT_WDMD_SOCKET),
                direct_io: true,
                kill_grace: DEFAULT_KILL_GRACE,
                thread_name: DEFAULT_THREAD_NAME.to_string(),
                moor_log: DEFAULT_MOOR_LOG.to_string(),
                host_dead_override: None,
            }
        }

        /// Protocol timing derived from the configured i/o timeout.
        pub fn timeouts(&self) -> Timeouts {
            self.timeouts_with_io(self.io_timeout)
        }

        /// Same, but with a per-lockspace i/o timeout override.
        pub fn timeouts_with_io(&self, io_timeout: u32) -> Timeouts {
            let t = Timeouts::new(io_timeout);
            match self.host_dead_override {
                Some(o) => t.with_host_dead_override(o),
                None => t,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_defaults_match_protocol_spec() {
            let config = Config::defaults();
            let t = config.timeouts();
            assert_eq!(t.io_timeout_seconds(), 10);
            assert_eq!(t.host_id_renewal_seconds(), 5);
            assert_eq!(t.host_id_renewal_fail_seconds(), 40);
            assert_eq!(t.host_id_timeout_seconds(), 80);
        }

        #[test]
        fn test_override_flows_into_timeouts() {
            let mut config = Config::defaults();
            config.host_dead_override = Some(2);
            assert_eq!(config.timeouts().host_dead_seconds(10), 2);
        }
    }
}

pub mod trace {
    //! Tracing configuration: the usual subscriber stack plus an in-memory
    //! ring of recent lines backing the LOG_DUMP command.

    use std::collections::VecDeque;
    use std::fmt::Write as _;
    use std::sync::{Arc, Mutex};
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Subscriber};
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
    use tracing_subscriber::util::SubscriberInitExt;

    /// Lines kept for LOG_DUMP.
    pub const LOG_RING_CAPACITY: usize = 1024;

    /// log as "json", "pretty" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Shared ring of recently emitted log lines.
    #[derive(Debug, Clone, Default)]
    pub struct LogRing {
        inner: Arc<Mutex<VecDeque<String>>>,
    }

    impl LogRing {
        pub fn push(&self, line: String) {
            let mut ring = self.inner.lock().unwrap();
            if ring.len() == LOG_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(line);
        }

        pub fn dump(&self) -> Vec<String> {
            self.inner.lock().unwrap().iter().cloned().collect()
        }
    }

    struct RingLayer {
        ring: LogRing,
    }

    impl<S: Subscriber> Layer<S> for RingLayer {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = LineVisitor::default();
            event.record(&mut visitor);
            let meta = event.metadata();
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            self.ring
                .push(format!("{ts} {} {} {}", meta.level(), meta.target(), visitor.line));
        }
    }

    #[derive(Default)]
    struct LineVisitor {
        line: String,
    }

    impl Visit for LineVisitor {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                let _ = write!(self.line, "{value:?} ");
            } else {
                let _ = write!(self.line, "{}={:?} ", field.name(), value);
            }
        }
    }

    /// Install the global subscriber and return the ring it feeds.
    pub fn init(moor_log: &str) -> Result<LogRing> {
        let ring = LogRing::default();
        let filter = EnvFilter::try_new(moor_log).or_else(|_| EnvFilter::try_new("info"))?;
        let log_frmt = std::env::var("LOG_FORMAT").unwrap_or_else(|_| DEFAULT_LOG_FORMAT.into());
        let ring_layer = RingLayer { ring: ring.clone() };

        match &log_frmt[..] {
            "json" => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().json())
                    .with(ring_layer)
                    .init();
            }
            "pretty" => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().pretty())
                    .with(ring_layer)
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer())
                    .with(ring_layer)
                    .init();
            }
        }
        Ok(ring)
    }

}
