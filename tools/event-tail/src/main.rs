mod config;

use anyhow::Context;
use event_bus::consumer_retry::RetryConfig;
use event_bus::{provision, EventBus, InMemoryBus, NatsBus, StreamSpec};
use event_consumer::{
    db, Consumer, ConsumerConfig, DeadLetterPolicy, IdempotencyLedger, InMemoryLedger, PgLedger,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{BusType, Config, LogFormat};

const DLQ_STREAM_MAX_AGE: Duration = Duration::from_secs(60 * 60 * 24 * 30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(config.log_format);

    tracing::info!(
        bus_type = ?config.bus_type,
        subject = %config.subject,
        durable_name = %config.durable_name,
        stream = %config.stream_name,
        "Starting event-tail"
    );

    let bus: Arc<dyn EventBus> = match config.bus_type {
        BusType::InMemory => {
            tracing::info!("Using InMemory event bus");
            Arc::new(InMemoryBus::new())
        }
        BusType::Nats => {
            tracing::info!("Connecting to NATS at {}", config.nats_url);
            let client = async_nats::connect(&config.nats_url)
                .await
                .context("Failed to connect to NATS")?;
            Arc::new(NatsBus::new(client))
        }
    };

    let dead_letter = DeadLetterPolicy {
        max_attempts: config.dlq_max_attempts,
        ..Default::default()
    };

    let streams = [
        StreamSpec::new(&config.stream_name, config.stream_subjects()).with_max_age(config.stream_max_age),
        StreamSpec::new("DLQ", [format!("{}.>", dead_letter.subject_prefix)]).with_max_age(DLQ_STREAM_MAX_AGE),
    ];
    provision(bus.as_ref(), &streams, &RetryConfig::default())
        .await
        .context("Failed to provision streams")?;

    let ledger: Arc<dyn IdempotencyLedger> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to ledger database...");
            let pool = db::init_pool(url).await.context("Failed to connect to database")?;
            let ledger = PgLedger::new(pool);
            ledger.migrate().await.context("Failed to run migrations")?;
            Arc::new(ledger)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; processed events are forgotten on restart");
            Arc::new(InMemoryLedger::new())
        }
    };

    let consumer = Consumer::<serde_json::Value>::bind(
        bus,
        config.subject.clone(),
        config.durable_name.clone(),
        ledger,
        |ctx, envelope| async move {
            tracing::info!(
                event_id = %envelope.id(),
                event_type = %envelope.event_type(),
                source = %envelope.source(),
                occurred_at = %envelope.occurred_at(),
                trace_id = %ctx.trace_id(),
                correlation_id = %ctx.correlation_id(),
                causation_id = %ctx.causation_id(),
                payload = %envelope.payload(),
                "Event received"
            );
            Ok(())
        },
    )
    .with_config(ConsumerConfig {
        max_in_flight: config.max_in_flight,
        dead_letter,
    });

    let shutdown = consumer.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, draining in-flight events");
            shutdown.cancel();
        }
    });

    consumer.start().await?;
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
