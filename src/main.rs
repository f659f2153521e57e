use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use leaseq::codec::TYPE_HEADER;
use leaseq::config::Settings;
use leaseq::dsn::Dsn;
use leaseq::store::{connect_store, MessageId, MessageRecord};
use leaseq::telemetry;
use leaseq::transport::MaintenanceScheduler;

#[derive(Parser)]
#[command(
    name = "leaseq",
    version,
    about = "Inspect and maintain leaseq message queues"
)]
struct Cli {
    /// Queue DSN, overrides the configured `queue.dsn`
    #[arg(long, global = true, env = "LEASEQ_DSN")]
    dsn: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the queue table or collection
    Setup,
    /// Print the number of queued messages
    Count,
    /// List queued messages in claim order
    List {
        /// Show at most this many messages
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Print one message
    Show {
        /// Message id, 32 hex chars or a UUID
        id: String,
    },
    /// Remove expired messages and release timed-out leases
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::new().context("failed to load configuration")?;
    if let Some(dsn) = cli.dsn {
        settings.queue.dsn = dsn;
    }
    telemetry::init_tracing(&settings.logging)?;

    let dsn = Dsn::parse(&settings.queue.dsn)?;
    tracing::debug!(dsn = %dsn, "Configuration loaded");
    let store = connect_store(&dsn, &settings, None).await?;

    match cli.command {
        Command::Setup => {
            store.setup().await?;
            println!("{} `{}` ready", store.backend(), store.collection());
        }
        Command::Count => {
            println!("{}", store.count().await?);
        }
        Command::List { limit } => {
            let now = Utc::now();
            for record in store.list_all(limit).await? {
                println!(
                    "{}  {:>6}  {}  {:<8}  {}",
                    record.id,
                    record.priority,
                    record.published_at.to_rfc3339(),
                    state(&record, now),
                    record.headers.get(TYPE_HEADER).map(String::as_str).unwrap_or("-"),
                );
            }
        }
        Command::Show { id } => {
            let id = MessageId::parse(&id)?;
            match store.find(&id).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&describe(&record))?),
                None => anyhow::bail!("no message with id {}", id),
            }
        }
        Command::Sweep => {
            let report = MaintenanceScheduler::default()
                .force(store.as_ref(), Utc::now())
                .await;
            println!(
                "expired: {}, reclaimed: {}",
                report.expired.map_or("failed".to_string(), |n| n.to_string()),
                report.reclaimed.map_or("failed".to_string(), |n| n.to_string()),
            );
        }
    }

    Ok(())
}

fn state(record: &MessageRecord, now: chrono::DateTime<Utc>) -> &'static str {
    if record.is_leased() {
        "leased"
    } else if record.is_expired(now) {
        "expired"
    } else if record.is_delayed(now) {
        "delayed"
    } else {
        "ready"
    }
}

fn describe(record: &MessageRecord) -> serde_json::Value {
    serde_json::json!({
        "id": record.id.to_hex(),
        "published_at": record.published_at,
        "priority": record.priority,
        "time_to_live": record.time_to_live,
        "delayed_until": record.delayed_until,
        "uniq_key": record.uniq_key,
        "delivery_id": record.delivery_id.map(|d| d.to_hex()),
        "redeliver_after": record.redeliver_after,
        "headers": record.headers,
        "properties": record.properties,
        "body": String::from_utf8_lossy(&record.body),
    })
}
