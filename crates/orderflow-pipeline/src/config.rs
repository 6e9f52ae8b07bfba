//! Runtime configuration shared by every pipeline process.
//!
//! Values come from an optional TOML file layered under `ORDERFLOW_*`
//! environment variables. Every field has a default, so an empty
//! environment yields a working standalone setup.

use std::{path::{Path, PathBuf}, time::Duration};

use serde::Deserialize;
use uuid::Uuid;

use crate::{
  Error, Result,
  aggregator::AggregatorConfig,
  materializer::MaterializerConfig,
  relay::RelayConfig,
};

/// Which bus implementation connects the processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
  /// In-process log. Only meaningful when every stage runs in one process.
  #[default]
  Memory,
  Kafka,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  pub bus_backend:             BusBackend,
  pub kafka_bootstrap_servers: String,
  /// SASL credentials; both must be set to enable SASL.
  pub kafka_sasl_username:     Option<String>,
  pub kafka_sasl_password:     Option<String>,
  /// Defaults to `PLAIN` when credentials are set.
  pub kafka_sasl_mechanism:    Option<String>,

  pub outbox_topic: String,
  pub dlq_topic:    String,
  pub stats_topic:  String,

  pub aggregator_group:   String,
  pub materializer_group: String,
  /// Relay lease owner. A random id is generated when unset.
  pub worker_id:          Option<String>,

  pub batch_size:           usize,
  pub poll_interval_secs:   f64,
  pub publish_timeout_secs: f64,
  pub max_retries:          u32,
  pub lease_ttl_secs:       f64,

  pub store_path:      PathBuf,
  pub projection_path: PathBuf,

  pub window_size_secs:      u64,
  pub allowed_lateness_secs: u64,
  pub idle_timeout_secs:     f64,
  pub poll_timeout_secs:     f64,

  pub listen_addr: String,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      bus_backend:             BusBackend::Memory,
      kafka_bootstrap_servers: "localhost:9092".into(),
      kafka_sasl_username:     None,
      kafka_sasl_password:     None,
      kafka_sasl_mechanism:    None,

      outbox_topic: "orders.events".into(),
      dlq_topic:    "orders.events.dlq".into(),
      stats_topic:  "orders.sku-stats".into(),

      aggregator_group:   "sku-aggregator-v1".into(),
      materializer_group: "materializer-v1".into(),
      worker_id:          None,

      batch_size:           50,
      poll_interval_secs:   10.0,
      publish_timeout_secs: 5.0,
      max_retries:          5,
      lease_ttl_secs:       300.0,

      store_path:      "orderflow.db".into(),
      projection_path: "orderflow-projections.db".into(),

      window_size_secs:      60,
      allowed_lateness_secs: 5,
      idle_timeout_secs:     10.0,
      poll_timeout_secs:     1.0,

      listen_addr: "127.0.0.1:8080".into(),
    }
  }
}

fn secs(field: &str, value: f64) -> Result<Duration> {
  Duration::try_from_secs_f64(value)
    .map_err(|e| Error::InvalidConfig(format!("{field} = {value}: {e}")))
}

fn positive(field: &str, value: f64) -> Result<Duration> {
  let duration = secs(field, value)?;
  if duration.is_zero() {
    return Err(Error::InvalidConfig(format!("{field} must be greater than zero")));
  }
  Ok(duration)
}

impl PipelineConfig {
  /// Read `path` (if it exists) and the environment, then validate.
  pub fn load(path: &Path) -> Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(config::Environment::with_prefix("ORDERFLOW").try_parsing(true))
      .build()?;
    let config: Self = settings.try_deserialize()?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if self.batch_size == 0 {
      return Err(Error::InvalidConfig("batch_size must be at least 1".into()));
    }
    if self.max_retries == 0 {
      return Err(Error::InvalidConfig("max_retries must be at least 1".into()));
    }
    if self.window_size_secs == 0 {
      return Err(Error::InvalidConfig("window_size_secs must be at least 1".into()));
    }
    for (field, topic) in [
      ("outbox_topic", &self.outbox_topic),
      ("dlq_topic", &self.dlq_topic),
      ("stats_topic", &self.stats_topic),
    ] {
      if topic.trim().is_empty() {
        return Err(Error::InvalidConfig(format!("{field} must not be empty")));
      }
    }
    if self.outbox_topic == self.dlq_topic {
      return Err(Error::InvalidConfig(
        "outbox_topic and dlq_topic must differ".into(),
      ));
    }
    secs("poll_interval_secs", self.poll_interval_secs)?;
    positive("publish_timeout_secs", self.publish_timeout_secs)?;
    positive("lease_ttl_secs", self.lease_ttl_secs)?;
    secs("idle_timeout_secs", self.idle_timeout_secs)?;
    positive("poll_timeout_secs", self.poll_timeout_secs)?;
    Ok(())
  }

  pub fn publish_timeout(&self) -> Result<Duration> {
    positive("publish_timeout_secs", self.publish_timeout_secs)
  }

  pub fn relay(&self) -> Result<RelayConfig> {
    Ok(RelayConfig {
      worker_id:       self
        .worker_id
        .clone()
        .unwrap_or_else(|| format!("relay-{}", Uuid::new_v4())),
      topic:           self.outbox_topic.clone(),
      dlq_topic:       self.dlq_topic.clone(),
      batch_size:      self.batch_size,
      poll_interval:   secs("poll_interval_secs", self.poll_interval_secs)?,
      publish_timeout: self.publish_timeout()?,
      max_retries:     self.max_retries,
      lease_ttl:       positive("lease_ttl_secs", self.lease_ttl_secs)?,
    })
  }

  pub fn aggregator(&self) -> Result<AggregatorConfig> {
    Ok(AggregatorConfig {
      input_topic:      self.outbox_topic.clone(),
      output_topic:     self.stats_topic.clone(),
      group_id:         self.aggregator_group.clone(),
      window_size:      Duration::from_secs(self.window_size_secs),
      allowed_lateness: Duration::from_secs(self.allowed_lateness_secs),
      idle_timeout:     secs("idle_timeout_secs", self.idle_timeout_secs)?,
      poll_timeout:     positive("poll_timeout_secs", self.poll_timeout_secs)?,
      publish_timeout:  self.publish_timeout()?,
    })
  }

  pub fn materializer(&self) -> Result<MaterializerConfig> {
    Ok(MaterializerConfig {
      stats_topic:  self.stats_topic.clone(),
      events_topic: self.outbox_topic.clone(),
      group_id:     self.materializer_group.clone(),
      poll_timeout: positive("poll_timeout_secs", self.poll_timeout_secs)?,
    })
  }
}
