//! Kafka backend over librdkafka.
//!
//! Producers wait for the broker acknowledgement (`acks=all`, idempotent)
//! before reporting success. Consumers join a group with auto-commit on, so
//! an offset counts as consumed once the message has been handed out.

use std::time::Duration;

use chrono::DateTime;
use orderflow_core::bus::{BusMessage, Consumer, DeliveryError, Producer};
use rdkafka::{
  ClientConfig, Message as _,
  consumer::{Consumer as _, StreamConsumer},
  error::{KafkaError, RDKafkaErrorCode},
  producer::{FutureProducer, FutureRecord, Producer as _},
};
use tracing::{debug, info};

use crate::{BusError, Result};

/// Connection settings shared by producers and consumers.
#[derive(Clone, Debug)]
pub struct KafkaConfig {
  /// Comma-separated bootstrap servers.
  pub bootstrap_servers: String,
  /// Upper bound librdkafka spends delivering one message.
  pub message_timeout:   Duration,
  pub security_protocol: Option<String>,
  pub sasl_mechanism:    Option<String>,
  pub sasl_username:     Option<String>,
  pub sasl_password:     Option<String>,
}

impl KafkaConfig {
  pub fn new(bootstrap_servers: impl Into<String>) -> Self {
    Self {
      bootstrap_servers: bootstrap_servers.into(),
      message_timeout:   Duration::from_secs(5),
      security_protocol: None,
      sasl_mechanism:    None,
      sasl_username:     None,
      sasl_password:     None,
    }
  }

  pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
    self.message_timeout = timeout;
    self
  }

  pub fn with_sasl(
    mut self,
    username: impl Into<String>,
    password: impl Into<String>,
    mechanism: impl Into<String>,
  ) -> Self {
    self.sasl_username = Some(username.into());
    self.sasl_password = Some(password.into());
    self.sasl_mechanism = Some(mechanism.into());
    self.security_protocol.get_or_insert_with(|| "SASL_SSL".to_owned());
    self
  }

  pub(crate) fn producer_config(&self) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
      .set("bootstrap.servers", &self.bootstrap_servers)
      .set("message.timeout.ms", self.message_timeout.as_millis().to_string())
      .set("acks", "all")
      .set("enable.idempotence", "true");
    self.apply_security(&mut config);
    config
  }

  pub(crate) fn consumer_config(&self, group_id: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
      .set("bootstrap.servers", &self.bootstrap_servers)
      .set("group.id", group_id)
      .set("enable.auto.commit", "true")
      .set("auto.offset.reset", "earliest");
    self.apply_security(&mut config);
    config
  }

  fn apply_security(&self, config: &mut ClientConfig) {
    let optional = [
      ("security.protocol", &self.security_protocol),
      ("sasl.mechanism", &self.sasl_mechanism),
      ("sasl.username", &self.sasl_username),
      ("sasl.password", &self.sasl_password),
    ];
    for (key, value) in optional {
      if let Some(value) = value {
        config.set(key, value);
      }
    }
  }
}

// ─── Producer ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct KafkaProducer {
  producer: FutureProducer,
}

impl KafkaProducer {
  pub fn new(config: &KafkaConfig) -> Result<Self> {
    let producer: FutureProducer = config
      .producer_config()
      .create()
      .map_err(|e| BusError::Connection(format!("failed to create Kafka producer: {e}")))?;
    info!(bootstrap_servers = %config.bootstrap_servers, "kafka producer ready");
    Ok(Self { producer })
  }
}

fn delivery_error(err: KafkaError, timeout: Duration) -> DeliveryError {
  match err {
    KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut)
    | KafkaError::Flush(RDKafkaErrorCode::OperationTimedOut) => {
      DeliveryError::Timeout(timeout)
    }
    other => DeliveryError::Rejected(other.to_string()),
  }
}

impl Producer for KafkaProducer {
  async fn send(
    &self,
    topic: &str,
    key: &str,
    payload: &[u8],
    timeout: Duration,
  ) -> Result<(), DeliveryError> {
    let record = FutureRecord::to(topic).key(key).payload(payload);
    let delivery = self.producer.send(record, timeout);

    match tokio::time::timeout(timeout, delivery).await {
      Err(_) => Err(DeliveryError::Timeout(timeout)),
      Ok(Err((err, _))) => Err(delivery_error(err, timeout)),
      Ok(Ok((partition, offset))) => {
        debug!(%topic, %key, partition, offset, "kafka delivery acknowledged");
        Ok(())
      }
    }
  }

  async fn flush(&self, timeout: Duration) -> Result<(), DeliveryError> {
    let producer = self.producer.clone();
    tokio::task::spawn_blocking(move || producer.flush(timeout))
      .await
      .map_err(|e| DeliveryError::Rejected(e.to_string()))?
      .map_err(|e| delivery_error(e, timeout))
  }
}

// ─── Consumer ────────────────────────────────────────────────────────────────

pub struct KafkaConsumer {
  consumer: StreamConsumer,
}

impl KafkaConsumer {
  pub fn new(config: &KafkaConfig, group_id: &str, topics: &[&str]) -> Result<Self> {
    let consumer: StreamConsumer = config
      .consumer_config(group_id)
      .create()
      .map_err(|e| BusError::Connection(format!("failed to create Kafka consumer: {e}")))?;
    consumer
      .subscribe(topics)
      .map_err(|e| BusError::Subscribe(format!("failed to subscribe to {topics:?}: {e}")))?;
    info!(%group_id, ?topics, "subscribed to kafka topics");
    Ok(Self { consumer })
  }
}

impl Consumer for KafkaConsumer {
  type Error = BusError;

  async fn poll(&mut self, timeout: Duration) -> Result<Option<BusMessage>> {
    let message = match tokio::time::timeout(timeout, self.consumer.recv()).await {
      Err(_) => return Ok(None),
      Ok(Err(e)) => return Err(BusError::Consume(e.to_string())),
      Ok(Ok(message)) => message,
    };

    Ok(Some(BusMessage {
      topic:     message.topic().to_owned(),
      key:       message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
      payload:   message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
      timestamp: message
        .timestamp()
        .to_millis()
        .and_then(DateTime::from_timestamp_millis),
      offset:    message.offset(),
    }))
  }
}
