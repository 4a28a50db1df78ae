#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unnecessary_wraps,
    dead_code
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use swarmlink::comms::{handler_fn, MessageBroker, QueueOptions};
use swarmlink::observability::{spawn_trace_sink, DeliveryTraceLogger};
use swarmlink::{Config, ConfigCommands, MetricsFormat, MetricsSnapshot};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const SOAK_SENDER: &str = "soak-driver";
const SOAK_MESSAGE_TYPE: &str = "soak.ping";

/// `swarmlink` - in-process messaging for agent swarms.
#[derive(Parser, Debug)]
#[command(name = "swarmlink")]
#[command(version)]
#[command(about = "In-process inter-agent messaging broker.", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    #[command(long_about = "\
Manage swarmlink configuration.

Inspect the effective configuration, export the JSON Schema for \
config.toml, or validate the file on disk.

Examples:
  swarmlink config show
  swarmlink config schema > schema.json
  swarmlink --config-dir /tmp/swarm config validate")]
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    /// Drive an in-process broker with synthetic traffic and print metrics
    #[command(long_about = "\
Run a soak test against an in-process broker.

Registers N agents, subscribes each one to direct pings and to a shared \
work queue, then sends M messages split between the two paths. Prints \
the final metrics snapshot once every accepted message was handled or \
the timeout elapsed.

Examples:
  swarmlink soak --agents 16 --messages 10000
  swarmlink soak --format prometheus")]
    Soak {
        /// Number of simulated agents
        #[arg(long, default_value_t = 8)]
        agents: usize,
        /// Number of messages to send
        #[arg(long, default_value_t = 1_000)]
        messages: usize,
        /// Seconds to wait for in-flight deliveries before reporting
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        /// Metrics output format
        #[arg(long, value_enum, default_value_t = MetricsFormat::Json)]
        format: MetricsFormat,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("SWARMLINK_CONFIG_DIR", config_dir);
    }

    // Schema export stays stdout-only: no config load, no logging.
    if let Commands::Config {
        config_command: ConfigCommands::Schema,
    } = &cli.command
    {
        let schema = schemars::schema_for!(Config);
        println!(
            "{}",
            serde_json::to_string_pretty(&schema).context("failed to serialize JSON Schema")?
        );
        return Ok(());
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = Config::load_or_init().await?;

    match cli.command {
        Commands::Config { config_command } => match config_command {
            ConfigCommands::Show => {
                print!(
                    "{}",
                    toml::to_string_pretty(&config).context("failed to render config")?
                );
                Ok(())
            }
            ConfigCommands::Validate => {
                println!("Config OK: {}", config.config_path.display());
                Ok(())
            }
            ConfigCommands::Schema => Ok(()),
        },

        Commands::Soak {
            agents,
            messages,
            timeout_secs,
            format,
        } => {
            let snapshot =
                run_soak(&config, agents, messages, Duration::from_secs(timeout_secs)).await?;
            println!("{}", render_metrics(&snapshot, format)?);
            Ok(())
        }
    }
}

async fn run_soak(
    config: &Config,
    agents: usize,
    messages: usize,
    timeout: Duration,
) -> Result<MetricsSnapshot> {
    if agents == 0 {
        bail!("--agents must be at least 1");
    }

    let broker = Arc::new(MessageBroker::new(config.comms.clone()));
    broker.initialize()?;

    let sink = match DeliveryTraceLogger::from_config(&config.observability, &config.config_dir()) {
        Some(logger) => {
            info!(path = %logger.path().display(), "delivery trace enabled");
            Some(spawn_trace_sink(Arc::new(logger), broker.subscribe_events()?))
        }
        None => None,
    };

    let handled = Arc::new(AtomicU64::new(0));
    let agent_ids: Vec<String> = (0..agents).map(|n| format!("agent-{n}")).collect();
    let queue_id = broker.create_queue("soak-jobs", QueueOptions::default())?;
    let ack = config.comms.enable_persistence;

    for agent_id in &agent_ids {
        let handler = {
            let handled = Arc::clone(&handled);
            let broker: Weak<MessageBroker> = Arc::downgrade(&broker);
            let agent_id = agent_id.clone();
            handler_fn(move |message| {
                let handled = Arc::clone(&handled);
                let broker = broker.clone();
                let agent_id = agent_id.clone();
                async move {
                    handled.fetch_add(1, Ordering::Relaxed);
                    if ack {
                        if let Some(broker) = broker.upgrade() {
                            broker.acknowledge_message(&message.id, &agent_id)?;
                        }
                    }
                    Ok(())
                }
            })
        };
        broker.subscribe(agent_id, SOAK_MESSAGE_TYPE, handler.clone())?;
        broker.subscribe_to_queue(&queue_id, agent_id, handler)?;
    }

    let started = tokio::time::Instant::now();
    let mut accepted = 0_u64;
    let mut rejected = 0_u64;
    for seq in 0..messages {
        let payload = json!({ "seq": seq });
        let sent = if seq % 2 == 0 {
            broker.send_message(
                SOAK_SENDER,
                &agent_ids[seq % agents],
                SOAK_MESSAGE_TYPE,
                payload,
            )
        } else {
            broker.send_to_queue(&queue_id, SOAK_SENDER, SOAK_MESSAGE_TYPE, payload)
        };
        match sent {
            Ok(_) => accepted += 1,
            Err(err) => {
                rejected += 1;
                warn!("soak send {seq} rejected: {err}");
            }
        }
    }

    // Polling mode parks direct deliveries in inboxes; drain them as the agents would.
    let deadline = started + timeout;
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        for agent_id in &agent_ids {
            let drained = broker.poll_messages(agent_id, usize::MAX)?;
            handled.fetch_add(drained.len() as u64, Ordering::Relaxed);
        }
        let progress = broker.get_metrics();
        if progress.messages_delivered + progress.messages_failed + progress.messages_expired
            >= accepted
        {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(
                delivered = progress.messages_delivered,
                accepted, "soak timed out before every message settled"
            );
            break;
        }
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(10)) => {}
            _ = &mut interrupted => {
                warn!("soak interrupted; reporting partial metrics");
                break;
            }
        }
    }

    let snapshot = broker.get_metrics();
    info!(
        agents,
        accepted,
        rejected,
        handled = handled.load(Ordering::Relaxed),
        elapsed_ms = started.elapsed().as_millis(),
        "soak finished"
    );

    broker.shutdown().await;
    drop(broker);
    if let Some(sink) = sink {
        if tokio::time::timeout(Duration::from_secs(5), sink).await.is_err() {
            warn!("delivery trace sink did not drain in time");
        }
    }
    Ok(snapshot)
}

fn render_metrics(snapshot: &MetricsSnapshot, format: MetricsFormat) -> Result<String> {
    match format {
        MetricsFormat::Json => {
            serde_json::to_string_pretty(snapshot).context("failed to serialize metrics")
        }
        #[cfg(feature = "observability-prometheus")]
        MetricsFormat::Prometheus => snapshot.render_prometheus(),
        #[cfg(not(feature = "observability-prometheus"))]
        MetricsFormat::Prometheus => {
            bail!("Prometheus output requires the `observability-prometheus` feature")
        }
        MetricsFormat::Plain => Ok(snapshot.render_plain()),
    }
}
