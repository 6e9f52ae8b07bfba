//! `orderflow`: runs one pipeline stage, the query API, or everything in a
//! single process.
//!
//! Reads `orderflow.toml` (or the path given with `--config`) layered under
//! `ORDERFLOW_*` environment variables.
//!
//! ```text
//! orderflow standalone
//! orderflow order create --item A:2:1250 --item B:1
//! orderflow order pay <order-id>
//! ```
//!
//! The `relay`, `aggregator` and `materializer` commands run one stage per
//! process against Kafka and need the `kafka` feature.

use std::{
  fmt,
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::{Context as _, bail};
use clap::{Args, Parser, Subcommand};
use orderflow_bus::MemoryBus;
use orderflow_core::event::{LineItem, OrderCreated};
use orderflow_pipeline::{
  BusBackend, PipelineConfig,
  aggregator::Aggregator,
  materializer::Materializer,
  relay::Relay,
  shutdown::{self, Shutdown},
};
use orderflow_store_sqlite::{OrderStatus, SqliteStore};
use tokio::net::TcpListener;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(author, version, about = "Outbox relay and order stream aggregation")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "orderflow.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Publish committed outbox rows to the primary topic.
  Relay,
  /// Sum line-item quantities per SKU over tumbling windows.
  Aggregator,
  /// Write window totals and the audit trail into the projection store.
  Materializer,
  /// Serve the read-only query API over the projection store.
  Query,
  /// Run every stage and the query API in one process on the in-memory bus.
  Standalone,
  /// Write orders through the outbox.
  #[command(subcommand)]
  Order(OrderCommand),
}

#[derive(Subcommand)]
enum OrderCommand {
  /// Place a new order.
  Create(CreateOrder),
  /// Mark a created order as paid.
  Pay { order_id: String },
  /// Cancel a created order.
  Cancel { order_id: String },
  /// Print an order as JSON.
  Show { order_id: String },
}

#[derive(Args)]
struct CreateOrder {
  /// Order id. A random one is generated when omitted.
  #[arg(long)]
  order_id: Option<String>,

  /// Line item as `SKU:QTY` or `SKU:QTY:UNIT_PRICE`. Repeatable.
  #[arg(long = "item", value_parser = parse_item, required = true)]
  items: Vec<LineItem>,

  #[arg(long)]
  currency: Option<String>,
}

fn parse_item(raw: &str) -> Result<LineItem, String> {
  let mut parts = raw.split(':');
  let sku = parts.next().filter(|s| !s.is_empty()).ok_or("missing sku")?;
  let qty = parts
    .next()
    .ok_or("missing quantity")?
    .parse::<i64>()
    .map_err(|e| format!("invalid quantity: {e}"))?;
  let unit_price = parts
    .next()
    .map(str::parse::<i64>)
    .transpose()
    .map_err(|e| format!("invalid unit price: {e}"))?;
  if parts.next().is_some() {
    return Err("expected SKU:QTY or SKU:QTY:UNIT_PRICE".into());
  }
  Ok(LineItem { sku: sku.to_owned(), qty, unit_price })
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  let config = PipelineConfig::load(&cli.config)
    .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

  match cli.command {
    Command::Relay => run_stage(Stage::Relay, &config).await,
    Command::Aggregator => run_stage(Stage::Aggregator, &config).await,
    Command::Materializer => run_stage(Stage::Materializer, &config).await,
    Command::Query => query(&config).await,
    Command::Standalone => standalone(&config).await,
    Command::Order(command) => order(&config, command).await,
  }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

async fn open_store(path: &Path) -> anyhow::Result<SqliteStore> {
  let path = expand_tilde(path);
  SqliteStore::open(&path)
    .await
    .with_context(|| format!("failed to open store at {}", path.display()))
}

/// A shutdown handle fired by SIGINT or SIGTERM.
fn on_signal() -> Shutdown {
  let (trigger, shutdown) = shutdown::channel();
  tokio::spawn(trigger.trigger_on_signal());
  shutdown
}

async fn bind(address: &str) -> anyhow::Result<TcpListener> {
  let listener = TcpListener::bind(address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;
  info!("Listening on http://{address}");
  Ok(listener)
}

async fn serve(
  listener: TcpListener,
  store: SqliteStore,
  shutdown: Shutdown,
) -> anyhow::Result<()> {
  let app = orderflow_api::api_router(Arc::new(store));
  axum::serve(listener, app)
    .with_graceful_shutdown(async move { shutdown.wait().await })
    .await
    .context("server error")
}

// ─── Commands ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Stage {
  Relay,
  Aggregator,
  Materializer,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Relay => "relay",
      Self::Aggregator => "aggregator",
      Self::Materializer => "materializer",
    })
  }
}

#[cfg(feature = "kafka")]
async fn run_stage(stage: Stage, config: &PipelineConfig) -> anyhow::Result<()> {
  if config.bus_backend != BusBackend::Kafka {
    bail!("the {stage} command runs against Kafka; set bus_backend = \"kafka\" or use `standalone`");
  }
  let client = kafka::client_config(config)?;
  let shutdown = on_signal();

  match stage {
    Stage::Relay => {
      let store = open_store(&config.store_path).await?;
      let producer = kafka::producer(&client)?;
      Relay::new(store, producer, config.relay()?).run(&shutdown).await?;
    }
    Stage::Aggregator => {
      let stage_config = config.aggregator()?;
      let consumer = kafka::consumer(&client, &stage_config.group_id, &[
        stage_config.input_topic.as_str(),
      ])?;
      let producer = kafka::producer(&client)?;
      Aggregator::new(consumer, producer, stage_config)?.run(&shutdown).await?;
    }
    Stage::Materializer => {
      let store = open_store(&config.projection_path).await?;
      let stage_config = config.materializer()?;
      let consumer =
        kafka::consumer(&client, &stage_config.group_id, &stage_config.topics())?;
      Materializer::new(store, consumer, stage_config).run(&shutdown).await?;
    }
  }
  Ok(())
}

#[cfg(not(feature = "kafka"))]
async fn run_stage(stage: Stage, _config: &PipelineConfig) -> anyhow::Result<()> {
  bail!(
    "the {stage} command needs a build with the `kafka` feature; use `standalone` for an in-process pipeline"
  )
}

#[cfg(feature = "kafka")]
mod kafka {
  use anyhow::Context as _;
  use orderflow_bus::kafka::{KafkaConfig, KafkaConsumer, KafkaProducer};
  use orderflow_pipeline::PipelineConfig;

  pub fn client_config(config: &PipelineConfig) -> anyhow::Result<KafkaConfig> {
    let mut kafka = KafkaConfig::new(config.kafka_bootstrap_servers.as_str())
      .with_message_timeout(config.publish_timeout()?);
    if let (Some(username), Some(password)) =
      (&config.kafka_sasl_username, &config.kafka_sasl_password)
    {
      let mechanism = config.kafka_sasl_mechanism.as_deref().unwrap_or("PLAIN");
      kafka = kafka.with_sasl(username.as_str(), password.as_str(), mechanism);
    }
    Ok(kafka)
  }

  pub fn producer(config: &KafkaConfig) -> anyhow::Result<KafkaProducer> {
    KafkaProducer::new(config).context("failed to create Kafka producer")
  }

  pub fn consumer(
    config: &KafkaConfig,
    group_id: &str,
    topics: &[&str],
  ) -> anyhow::Result<KafkaConsumer> {
    KafkaConsumer::new(config, group_id, topics)
      .with_context(|| format!("failed to join consumer group {group_id}"))
  }
}

async fn query(config: &PipelineConfig) -> anyhow::Result<()> {
  let store = open_store(&config.projection_path).await?;
  let listener = bind(&config.listen_addr).await?;
  serve(listener, store, on_signal()).await
}

/// Every stage in one process over a [`MemoryBus`].
///
/// On a signal the relay and aggregator stop first; the materializer and the
/// API keep running for a short grace period so the windows the aggregator
/// flushes on its way out are still stored.
async fn standalone(config: &PipelineConfig) -> anyhow::Result<()> {
  if config.bus_backend != BusBackend::Memory {
    bail!("standalone runs on the in-memory bus; set bus_backend = \"memory\"");
  }

  let orders = open_store(&config.store_path).await?;
  let projections = open_store(&config.projection_path).await?;
  let listener = bind(&config.listen_addr).await?;
  let bus = MemoryBus::new();

  let relay = Relay::new(orders, bus.clone(), config.relay()?);

  let aggregator_config = config.aggregator()?;
  let consumer = bus.subscribe(aggregator_config.group_id.clone(), &[
    aggregator_config.input_topic.as_str(),
  ]);
  let mut aggregator = Aggregator::new(consumer, bus.clone(), aggregator_config)?;

  let materializer_config = config.materializer()?;
  let grace = materializer_config.poll_timeout * 3;
  let consumer =
    bus.subscribe(materializer_config.group_id.clone(), &materializer_config.topics());
  let mut materializer = Materializer::new(projections.clone(), consumer, materializer_config);

  let upstream = on_signal();
  let (downstream_trigger, downstream) = shutdown::channel();

  let producers = async {
    let (relayed, aggregated) =
      tokio::join!(relay.run(&upstream), aggregator.run(&upstream));
    tokio::time::sleep(grace).await;
    downstream_trigger.trigger();
    relayed?;
    aggregated?;
    anyhow::Ok(())
  };
  let (produced, materialized, served) = tokio::join!(
    producers,
    materializer.run(&downstream),
    serve(listener, projections, downstream.clone()),
  );
  produced?;
  materialized?;
  served?;
  info!("standalone pipeline stopped");
  Ok(())
}

async fn order(config: &PipelineConfig, command: OrderCommand) -> anyhow::Result<()> {
  let store = open_store(&config.store_path).await?;

  let record = match command {
    OrderCommand::Create(args) => {
      let order_id = args.order_id.unwrap_or_else(|| Uuid::new_v4().to_string());
      store
        .create_order(OrderCreated {
          order_id,
          items: args.items,
          currency: args.currency,
          total_amount: None,
        })
        .await
        .context("failed to create order")?
    }
    OrderCommand::Pay { order_id } => store
      .transition_order(&order_id, OrderStatus::Paid)
      .await
      .context("failed to pay order")?,
    OrderCommand::Cancel { order_id } => store
      .transition_order(&order_id, OrderStatus::Canceled)
      .await
      .context("failed to cancel order")?,
    OrderCommand::Show { order_id } => {
      let order = store
        .get_order(&order_id)
        .await?
        .with_context(|| format!("order {order_id} not found"))?;
      println!("{}", serde_json::to_string_pretty(&order)?);
      return Ok(());
    }
  };

  info!(
    order_id = %record.aggregate_id,
    event_type = %record.event_type,
    event_id = %record.id,
    "event captured"
  );
  println!("{}", record.aggregate_id);
  Ok(())
}
