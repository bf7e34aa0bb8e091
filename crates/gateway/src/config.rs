// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use crate::logfwd::ForwardLevel;

/// Configuration for the gridlink GUI gateway.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "gridlink-gateway", about = "GUI gateway for the gridlink control fabric")]
pub struct GatewayConfig {
    /// Host to bind on. Also reported to clients in the connect banner.
    #[arg(long, default_value = "0.0.0.0", env = "GRIDLINK_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 44444, env = "GRIDLINK_PORT")]
    pub port: u16,

    /// URL of the NATS server backing the control fabric.
    #[arg(long, default_value = "nats://127.0.0.1:4222", env = "GRIDLINK_NATS_URL")]
    pub nats_url: String,

    /// Fabric subject prefix; doubles as the topic in the connect banner.
    #[arg(long, default_value = "gridlink", env = "GRIDLINK_SUBJECT_PREFIX")]
    pub subject_prefix: String,

    /// Instance id this gateway announces to clients and the fabric.
    #[arg(long, default_value = "GridLink_Gateway_0", env = "GRIDLINK_GATEWAY_ID")]
    pub gateway_id: String,

    /// Extra delay before pipeline producers are told we are ready for more
    /// data, in milliseconds. Lowering this adds load on the producers.
    #[arg(long, default_value_t = 500, value_parser = clap::value_parser!(u64).range(200..), env = "GRIDLINK_DELAY_ON_INPUT_MS")]
    pub delay_on_input_ms: u64,

    /// Capacity of the drop-oldest forwarding lane, per client. Applied to
    /// newly connected clients only.
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..=1000), env = "GRIDLINK_LOSSY_DATA_QUEUE_CAPACITY")]
    pub lossy_data_queue_capacity: u64,

    /// Minimum interval between property-update batches forwarded to clients,
    /// in milliseconds.
    #[arg(long, default_value_t = 500, value_parser = clap::value_parser!(u64).range(0..=10_000), env = "GRIDLINK_PROPERTY_UPDATE_INTERVAL_MS")]
    pub property_update_interval_ms: u64,

    /// Time between device instantiations, in milliseconds. The instantiation
    /// timer is always running, so not too fast.
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u64).range(100..=5000), env = "GRIDLINK_WAIT_INIT_DEVICE_MS")]
    pub wait_init_device_ms: u64,

    /// Time between forwarded log batches, in milliseconds.
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(500..=5000), env = "GRIDLINK_FORWARD_LOG_INTERVAL_MS")]
    pub forward_log_interval_ms: u64,

    /// Lowest log level forwarded to clients.
    #[arg(long, value_enum, default_value_t = ForwardLevel::Info, env = "GRIDLINK_LOG_FORWARDING_LEVEL")]
    pub log_forwarding_level: ForwardLevel,

    /// Interval between network-traffic samples, in seconds.
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..=3600), env = "GRIDLINK_NETWORK_SAMPLE_INTERVAL_SECS")]
    pub network_sample_interval_secs: u64,

    /// Interval between fabric heartbeats, in seconds. Slow beats: this
    /// gateway serves humans, not control loops.
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..), env = "GRIDLINK_HEARTBEAT_INTERVAL_SECS")]
    pub heartbeat_interval_secs: u64,

    /// Interval between topology-update cycles, in milliseconds.
    #[arg(long, default_value_t = 500, env = "GRIDLINK_THROTTLE_INTERVAL_MS")]
    pub throttle_interval_ms: u64,

    /// Maximum instance changes dispatched per topology-update cycle; reaching
    /// it triggers an early cycle.
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..), env = "GRIDLINK_MAX_CHANGES_PER_CYCLE")]
    pub max_changes_per_cycle: u64,

    /// Minimum client version admitted at login. If this does not parse as
    /// a semantic version, no version check is enforced.
    #[arg(long, default_value = "2.10.4", env = "GRIDLINK_MIN_CLIENT_VERSION")]
    pub min_client_version: String,

    /// Refuse every mutating request.
    #[arg(long, default_value_t = false, env = "GRIDLINK_READ_ONLY")]
    pub read_only: bool,

    /// Class ids whose devices are treated like macros: slot-call timeouts on
    /// them are ignored.
    #[arg(long = "ignore-timeout-class", env = "GRIDLINK_IGNORE_TIMEOUT_CLASSES", value_delimiter = ',')]
    pub ignore_timeout_classes: Vec<String>,

    /// Lower bound, in seconds, for client-requested slot timeouts; the
    /// effective timeout is the maximum of this and the client's value.
    #[arg(long, default_value_t = 10, env = "GRIDLINK_TIMEOUT_SECS")]
    pub timeout_secs: u64,

    /// The data-log manager instance to query for the logger map.
    #[arg(long, default_value = "GridLink_DataLoggerManager", env = "GRIDLINK_DATA_LOG_MANAGER_ID")]
    pub data_log_manager_id: String,
}

impl GatewayConfig {
    pub fn delay_on_input(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.delay_on_input_ms)
    }

    pub fn property_update_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.property_update_interval_ms)
    }

    pub fn wait_init_device(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.wait_init_device_ms)
    }

    pub fn forward_log_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.forward_log_interval_ms)
    }

    pub fn network_sample_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.network_sample_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn throttle_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.throttle_interval_ms)
    }
}
