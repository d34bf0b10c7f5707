use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::tracer::{LogTracer, Tracer};

pub const DEFAULT_BATCH_MAX: usize = 256;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_METADATA_REFRESH_INTERVAL_MS: u64 = 10 * 60 * 1000;
pub const DEFAULT_CLAIM_TIMEOUT_MS: u64 = 30_000;

/// Added to the metadata refresh interval so a topic watch tick always sees
/// metadata at least as fresh as the client's own refresh.
pub const TOPIC_WATCH_MARGIN: Duration = Duration::from_secs(1);

/// Broker-facing settings of a consumer group member.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    pub brokers: Vec<String>,
    #[serde(default = "default_metadata_refresh_interval_ms")]
    pub metadata_refresh_interval_ms: u64,
    #[serde(default)]
    pub initial_offset: InitialOffset,
    #[serde(default)]
    pub rebalance_strategy: RebalanceStrategy,
    pub session_timeout_ms: Option<u32>,
    pub heartbeat_interval_ms: Option<u32>,
    #[serde(default = "default_claim_timeout_ms")]
    pub claim_timeout_ms: u64,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
}

/// Where a partition without a committed offset starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialOffset {
    #[default]
    Newest,
    Oldest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceStrategy {
    Sticky,
    #[default]
    Range,
    #[serde(alias = "roundrobin")]
    RoundRobin,
}

fn default_metadata_refresh_interval_ms() -> u64 {
    DEFAULT_METADATA_REFRESH_INTERVAL_MS
}

fn default_claim_timeout_ms() -> u64 {
    DEFAULT_CLAIM_TIMEOUT_MS
}

impl InitialOffset {
    /// librdkafka `auto.offset.reset` value.
    pub fn as_offset_reset(&self) -> &'static str {
        match self {
            InitialOffset::Newest => "latest",
            InitialOffset::Oldest => "earliest",
        }
    }
}

impl RebalanceStrategy {
    /// librdkafka `partition.assignment.strategy` value.
    pub fn as_assignment_strategy(&self) -> &'static str {
        match self {
            RebalanceStrategy::Sticky => "cooperative-sticky",
            RebalanceStrategy::Range => "range",
            RebalanceStrategy::RoundRobin => "roundrobin",
        }
    }
}

pub async fn load_config(config_path: Option<&str>) -> Result<ConsumerConfig, ConfigError> {
    let config = match config_path {
        Some(path) => ConsumerConfig::from_file(path)?,
        None => ConsumerConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

impl ConsumerConfig {
    pub fn new(brokers: Vec<String>) -> Self {
        Self {
            brokers,
            metadata_refresh_interval_ms: DEFAULT_METADATA_REFRESH_INTERVAL_MS,
            initial_offset: InitialOffset::default(),
            rebalance_strategy: RebalanceStrategy::default(),
            session_timeout_ms: None,
            heartbeat_interval_ms: None,
            claim_timeout_ms: DEFAULT_CLAIM_TIMEOUT_MS,
            security_protocol: None,
            sasl_mechanisms: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
        }
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            origin: path.to_string(),
            error: Box::new(e),
        })?;
        let config: ConsumerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let config_str = std::env::var("CONSUMER_CONFIG").map_err(|_| ConfigError::MissingField {
            field: "CONSUMER_CONFIG".to_string(),
        })?;
        let config: ConsumerConfig = serde_yaml::from_str(&config_str)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "At least one broker host must be configured".to_string(),
            });
        }
        if self.brokers.iter().any(|b| b.trim().is_empty()) {
            return Err(ConfigError::ValidationFailed {
                reason: "Broker hosts cannot be empty".to_string(),
            });
        }
        if self.metadata_refresh_interval_ms == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "Metadata refresh interval must be positive".to_string(),
            });
        }
        if self.claim_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "Claim timeout must be positive".to_string(),
            });
        }
        if let (Some(session), Some(heartbeat)) = (self.session_timeout_ms, self.heartbeat_interval_ms)
        {
            if heartbeat >= session {
                return Err(ConfigError::ValidationFailed {
                    reason: format!(
                        "Heartbeat interval ({heartbeat}ms) must be lower than session timeout ({session}ms)"
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    pub fn metadata_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.metadata_refresh_interval_ms)
    }

    /// Polling interval of the regex topic watcher.
    pub fn topic_watch_interval(&self) -> Duration {
        self.metadata_refresh_interval() + TOPIC_WATCH_MARGIN
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }
}

/// Consumer-side behaviour: batching, retry pacing, tracing.
#[derive(Clone)]
pub struct ConsumerOptions {
    pub batch_mode: bool,
    pub batch_max: usize,
    pub retry_interval: Duration,
    pub tracer: Arc<dyn Tracer>,
    /// Run innermost, after the standard interceptors.
    pub interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            batch_mode: false,
            batch_max: DEFAULT_BATCH_MAX,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            tracer: Arc::new(LogTracer),
            interceptors: vec![],
        }
    }
}

impl std::fmt::Debug for ConsumerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerOptions")
            .field("batch_mode", &self.batch_mode)
            .field("batch_max", &self.batch_max)
            .field("retry_interval", &self.retry_interval)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

impl ConsumerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables batch mode with up to `max` messages per handler call.
    pub fn batch(mut self, max: usize) -> Self {
        self.batch_mode = true;
        self.batch_max = max.max(1);
        self
    }

    pub fn batch_mode(mut self, enabled: bool) -> Self {
        self.batch_mode = enabled;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Upper bound of a batch; 1 unless batch mode is enabled.
    pub fn batch_capacity(&self) -> usize {
        if self.batch_mode {
            self.batch_max.max(1)
        } else {
            1
        }
    }

    pub fn interceptor_chain(&self) -> InterceptorChain {
        self.interceptors.iter().fold(
            InterceptorChain::standard(self.retry_interval, self.tracer.clone()),
            |chain, interceptor| chain.with_shared(interceptor.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG_YAML: &str = r#"
brokers:
  - kafka-1:9092
  - kafka-2:9092
metadata_refresh_interval_ms: 30000
initial_offset: oldest
rebalance_strategy: round_robin
session_timeout_ms: 10000
heartbeat_interval_ms: 3000
"#;

    #[test]
    fn test_parse_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG_YAML.as_bytes()).unwrap();

        let config = ConsumerConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.bootstrap_servers(), "kafka-1:9092,kafka-2:9092");
        assert_eq!(config.initial_offset, InitialOffset::Oldest);
        assert_eq!(config.rebalance_strategy, RebalanceStrategy::RoundRobin);
        assert_eq!(config.claim_timeout_ms, DEFAULT_CLAIM_TIMEOUT_MS);
        assert_eq!(config.topic_watch_interval(), Duration::from_secs(31));
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults_when_fields_omitted() {
        let config: ConsumerConfig = serde_yaml::from_str("brokers: [localhost:9092]").unwrap();
        assert_eq!(
            config.metadata_refresh_interval_ms,
            DEFAULT_METADATA_REFRESH_INTERVAL_MS
        );
        assert_eq!(config.initial_offset, InitialOffset::Newest);
        assert_eq!(config.rebalance_strategy, RebalanceStrategy::Range);
        assert_eq!(config.initial_offset.as_offset_reset(), "latest");
    }

    #[test]
    fn test_strategy_mapping() {
        assert_eq!(
            RebalanceStrategy::Sticky.as_assignment_strategy(),
            "cooperative-sticky"
        );
        assert_eq!(RebalanceStrategy::Range.as_assignment_strategy(), "range");
        assert_eq!(
            RebalanceStrategy::RoundRobin.as_assignment_strategy(),
            "roundrobin"
        );
        let parsed: RebalanceStrategy = serde_yaml::from_str("roundrobin").unwrap();
        assert_eq!(parsed, RebalanceStrategy::RoundRobin);
        assert_eq!(
            serde_json::to_string(&InitialOffset::Oldest).unwrap(),
            "\"oldest\""
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ConsumerConfig::new(vec![]).validate().is_err());
        assert!(ConsumerConfig::new(vec![" ".to_string()]).validate().is_err());

        let mut config = ConsumerConfig::new(vec!["localhost:9092".to_string()]);
        config.metadata_refresh_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ConsumerConfig::new(vec!["localhost:9092".to_string()]);
        config.session_timeout_ms = Some(3000);
        config.heartbeat_interval_ms = Some(3000);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_load_error() {
        let err = ConsumerConfig::from_file("/nonexistent/consumer.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::LoadFailed { .. }));
    }

    #[test]
    fn test_batch_capacity() {
        assert_eq!(ConsumerOptions::default().batch_capacity(), 1);
        assert_eq!(
            ConsumerOptions::default().batch_mode(true).batch_capacity(),
            DEFAULT_BATCH_MAX
        );
        assert_eq!(ConsumerOptions::new().batch(16).batch_capacity(), 16);
        assert_eq!(ConsumerOptions::new().batch(0).batch_capacity(), 1);
    }

    #[test]
    fn test_user_interceptors_run_inside_standard_chain() {
        struct Audit;
        impl Interceptor for Audit {
            fn name(&self) -> &'static str {
                "audit"
            }
            fn wrap(
                &self,
                next: Arc<dyn crate::handler::MessageHandler>,
            ) -> Arc<dyn crate::handler::MessageHandler> {
                next
            }
        }

        let chain = ConsumerOptions::new().interceptor(Audit).interceptor_chain();
        assert_eq!(chain.names(), vec!["trace_context", "retry", "span", "audit"]);
    }
}
