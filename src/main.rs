//! GeoPhoto CLI
//!
//! Command-line peer for GeoPhoto channels:
//! - Listen on a channel and print (or save) incoming photos
//! - Send a photo with its coordinates
//! - Generate a config file

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use geophoto::{
    looks_like_jpeg, ClientError, Config, Coordinates, FileImageSource, FixedLocation,
    GeoPhotoClient, GeoPhotoMessage, LoggingConfig, Operation, PresentationSink,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "geophoto")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Share geotagged photos over an MQTT channel")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Broker host
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Broker port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Unsubscribe the previous channel when switching
    #[arg(long, global = true)]
    pub strict: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print every photo published on a channel until Ctrl-C
    Listen {
        /// Channel name
        #[arg(long)]
        channel: String,
        /// Directory to save received images into
        #[arg(long)]
        save_dir: Option<PathBuf>,
    },

    /// Publish one photo
    Send {
        /// Channel name
        #[arg(long)]
        channel: String,
        /// Path to a JPEG file
        #[arg(long)]
        image: PathBuf,
        /// Latitude in decimal degrees
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        /// Longitude in decimal degrees
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        /// Capture date, YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Seconds to wait for the message to come back
        #[arg(long, default_value = "5")]
        wait_secs: u64,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        write_config(output.as_deref())?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(host) = cli.host {
        config.broker.host = host;
    }
    if let Some(port) = cli.port {
        config.broker.port = port;
    }
    if cli.strict {
        config.broker.strict_channel_switch = true;
    }

    init_logging(&config.logging);
    tracing::info!("GeoPhoto v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Listen { channel, save_dir } => {
            if let Some(dir) = &save_dir {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }

            let presenter = Arc::new(ConsolePresenter::new(save_dir, None));
            let client = GeoPhotoClient::mqtt(&config.broker, presenter);

            if join(&client, &channel).await.is_err() {
                client.disconnect().await;
                return Ok(ExitCode::FAILURE);
            }
            println!(
                "Listening on {:?} at {} (Ctrl-C to stop)",
                channel,
                client.broker_address()
            );

            tokio::signal::ctrl_c().await?;

            let stats = client.dispatch_stats();
            client.disconnect().await;
            println!(
                "Received {} messages, dropped {}",
                stats.delivered, stats.dropped
            );
        }

        Commands::Send {
            channel,
            image,
            lat,
            lon,
            date,
            wait_secs,
        } => {
            let (echo_tx, mut echo_rx) = mpsc::unbounded_channel();
            let presenter = Arc::new(ConsolePresenter::new(None, Some(echo_tx)));
            let client = GeoPhotoClient::mqtt(&config.broker, presenter);
            let coordinates = Coordinates::new(lat, lon);

            if join(&client, &channel).await.is_err() {
                client.disconnect().await;
                return Ok(ExitCode::FAILURE);
            }

            let published = match date {
                Some(date) => {
                    let bytes = tokio::fs::read(&image)
                        .await
                        .with_context(|| format!("reading {}", image.display()))?;
                    client
                        .publish(GeoPhotoMessage::new(coordinates, date, bytes))
                        .await
                }
                None => {
                    client
                        .publish_from_sources(
                            &FixedLocation(Some(coordinates)),
                            &FileImageSource::new(&image),
                        )
                        .await
                }
            };
            if published.is_err() {
                client.disconnect().await;
                return Ok(ExitCode::FAILURE);
            }
            println!("Sent {} to {:?}", image.display(), channel);

            if wait_secs > 0 {
                match tokio::time::timeout(Duration::from_secs(wait_secs), echo_rx.recv()).await {
                    Ok(Some(())) => println!("Broker delivered the message back"),
                    _ => println!("No echo within {}s", wait_secs),
                }
            }

            client.disconnect().await;
        }

        Commands::Config { output } => write_config(output.as_deref())?,
    }

    Ok(ExitCode::SUCCESS)
}

/// A client failure the presenter has already printed
#[derive(Debug)]
struct Reported;

impl From<ClientError> for Reported {
    fn from(_: ClientError) -> Self {
        Reported
    }
}

/// Connect and make `channel` the active channel
async fn join(client: &GeoPhotoClient, channel: &str) -> Result<(), Reported> {
    client.connect().await?;
    client.subscribe(channel).await?;
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("geophoto={}", logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn write_config(output: Option<&Path>) -> anyhow::Result<()> {
    let config = geophoto::config::generate_default_config();

    match output {
        Some(path) => {
            // Create parent directory if needed
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &config)?;
            println!("Config written to {:?}", path);
        }
        None => {
            print!("{}", config);
        }
    }
    Ok(())
}

/// Prints deliveries and failures to the terminal
struct ConsolePresenter {
    save_dir: Option<PathBuf>,
    echo: Option<mpsc::UnboundedSender<()>>,
}

impl ConsolePresenter {
    fn new(save_dir: Option<PathBuf>, echo: Option<mpsc::UnboundedSender<()>>) -> Self {
        Self { save_dir, echo }
    }

    fn save(&self, dir: &Path, topic: &str, message: &GeoPhotoMessage) {
        let name = format!(
            "{}_{}_{:.5}_{:.5}.jpg",
            topic.replace('/', "_"),
            message.captured_date,
            message.coordinates.latitude,
            message.coordinates.longitude
        );
        let path = dir.join(name);
        match std::fs::write(&path, &message.image_bytes) {
            Ok(()) => println!("  saved {}", path.display()),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to save image"),
        }
    }
}

impl PresentationSink for ConsolePresenter {
    fn on_message(&self, topic: &str, message: GeoPhotoMessage) {
        let kind = if looks_like_jpeg(&message.image_bytes) {
            "JPEG"
        } else {
            "unrecognized image"
        };
        println!(
            "[{}] {} taken {} at {} ({} bytes)",
            topic,
            kind,
            message.captured_date,
            message.coordinates,
            message.image_bytes.len()
        );

        if let Some(dir) = &self.save_dir {
            self.save(dir, topic, &message);
        }
        if let Some(echo) = &self.echo {
            let _ = echo.send(());
        }
    }

    fn on_failure(&self, operation: Operation, error: &ClientError) {
        eprintln!("{} failed: {}", operation, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geophoto::{BrokerConfig, MemoryBroker, MemoryConnector};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FailureCount {
        failures: Mutex<Vec<Operation>>,
    }

    impl PresentationSink for FailureCount {
        fn on_message(&self, _topic: &str, _message: GeoPhotoMessage) {}

        fn on_failure(&self, operation: Operation, _error: &ClientError) {
            self.failures.lock().unwrap().push(operation);
        }
    }

    #[tokio::test]
    async fn test_join_reports_connect_failure_once() {
        let broker = Arc::new(MemoryBroker::default());
        broker.set_accepting(false);
        let sink = Arc::new(FailureCount::default());
        let client = GeoPhotoClient::new(
            &BrokerConfig::new("memory", 1883),
            Arc::new(MemoryConnector::new(broker)),
            sink.clone(),
        );

        assert!(join(&client, "c1").await.is_err());
        // Subscribe is never attempted after a failed connect
        assert_eq!(*sink.failures.lock().unwrap(), vec![Operation::Connect]);
    }

    #[tokio::test]
    async fn test_join_subscribes_after_connect() {
        let broker = Arc::new(MemoryBroker::default());
        let sink = Arc::new(FailureCount::default());
        let client = GeoPhotoClient::new(
            &BrokerConfig::new("memory", 1883),
            Arc::new(MemoryConnector::new(Arc::clone(&broker))),
            sink.clone(),
        );

        assert!(join(&client, "c1").await.is_ok());
        assert_eq!(client.active_channel().await, Some("c1".to_string()));
        assert!(sink.failures.lock().unwrap().is_empty());
    }
}
