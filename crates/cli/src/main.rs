use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;

use spread_stager_broker::sim::SimTransport;
use spread_stager_broker::transport::BrokerTransport;
use spread_stager_core::clock::DayChoice;
use spread_stager_core::ConfigLoader;
use spread_stager_engine::{CycleTuning, DailyCycle};
use spread_stager_signals::parser::{SignalDefaults, SignalParser};
use spread_stager_signals::{FileSource, SignalGatherer, SignalSource, StaticSource};

#[derive(Parser)]
#[command(name = "spread-stager")]
#[command(about = "Automated staging of conditional SPX bull call spreads", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CheckDay {
    /// Stage for today's session
    Today,
    /// Stage for the next session (run the evening before)
    Next,
}

impl From<CheckDay> for DayChoice {
    fn from(day: CheckDay) -> Self {
        match day {
            CheckDay::Today => Self::Today,
            CheckDay::Next => Self::Next,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daily staging cycle as a daemon
    Run {
        /// Config file path
        #[arg(short, long, default_value = "config/Stager.toml")]
        config: String,
        /// Which session's open the first iteration targets
        #[arg(long, value_enum, default_value_t = CheckDay::Today)]
        check_day: CheckDay,
        /// Override the configured broker client id
        #[arg(long)]
        client_id: Option<i32>,
        /// Rehearse against the in-process simulated broker
        #[arg(long)]
        paper: bool,
        /// File re-read on every gathering pass as the signal feed
        #[arg(long)]
        signals_file: Option<PathBuf>,
        /// Opening print reported by the simulated broker
        #[arg(long)]
        open_price: Option<Decimal>,
    },
    /// Parse a signals file and print the normalized batch as JSON
    ParseSignals {
        /// Signals file to parse
        #[arg(short, long)]
        file: PathBuf,
        /// Config file path (supplies the pattern and defaults)
        #[arg(short, long, default_value = "config/Stager.toml")]
        config: String,
    },
}

/// Manual-entry fallback: reads one line of feed text from stdin.
struct StdinSource;

#[async_trait::async_trait]
impl SignalSource for StdinSource {
    async fn latest_message(&self) -> Result<Option<String>> {
        eprintln!("No signals gathered from the feed. Paste a signal line (empty to skip):");
        let line = tokio::task::spawn_blocking(|| {
            let mut buf = String::new();
            std::io::stdin().read_line(&mut buf).map(|_| buf)
        })
        .await??;
        let line = line.trim();
        if line.is_empty() {
            Ok(None)
        } else {
            Ok(Some(line.to_string()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Run {
            config,
            check_day,
            client_id,
            paper,
            signals_file,
            open_price,
        } => {
            run_daemon(
                &config,
                check_day.into(),
                client_id,
                paper,
                signals_file,
                open_price,
            )
            .await?;
        }
        Commands::ParseSignals { file, config } => {
            run_parse_signals(&file, &config)?;
        }
    }

    Ok(())
}

async fn run_daemon(
    config_path: &str,
    day_choice: DayChoice,
    client_id: Option<i32>,
    paper: bool,
    signals_file: Option<PathBuf>,
    open_price: Option<Decimal>,
) -> Result<()> {
    let mut config = ConfigLoader::load(config_path)?;
    if let Some(id) = client_id {
        config.broker.client_id = id;
    }
    if !paper {
        anyhow::bail!("no live broker transport is wired up yet; run with --paper");
    }

    tracing::info!(
        host = config.broker.host,
        port = config.broker.port,
        client_id = config.broker.client_id,
        symbol = config.trading.underlying_symbol,
        "Starting spread stager (paper)"
    );

    let parser = SignalParser::new(&config.signals.pattern, SignalDefaults::from(&config.trading))?;
    let source: Arc<dyn SignalSource> = match &signals_file {
        Some(path) => Arc::new(FileSource::new(path.clone())),
        None => Arc::new(StaticSource::new(None)),
    };
    let gatherer = SignalGatherer::new(source, Some(Arc::new(StdinSource)), parser);

    let sim = Arc::new(SimTransport::new());
    seed_paper_broker(&sim, &config, signals_file.as_deref(), open_price)?;

    let cycle = DailyCycle::new(
        config,
        CycleTuning::default(),
        sim as Arc<dyn BrokerTransport>,
        gatherer,
        day_choice,
    );
    cycle.run().await;
    Ok(())
}

/// Seeds the simulated broker so a paper rehearsal can resolve the same
/// instruments the signals file will ask for.
fn seed_paper_broker(
    sim: &SimTransport,
    config: &spread_stager_core::AppConfig,
    signals_file: Option<&Path>,
    open_price: Option<Decimal>,
) -> Result<()> {
    sim.add_index(&config.trading.underlying_symbol, 416_904);
    if let Some(open) = open_price {
        sim.set_open_price(open);
    }

    let Some(path) = signals_file else {
        return Ok(());
    };
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let parser = SignalParser::new(&config.signals.pattern, SignalDefaults::from(&config.trading))?;
    let mut next_id = 1_000;
    for signal in parser.parse_batch(&text) {
        for strike in [signal.long_strike, signal.short_strike] {
            next_id += 1;
            sim.add_option(
                signal.expiry,
                strike,
                spread_stager_broker::types::OptionRight::Call,
                next_id,
            );
        }
    }
    Ok(())
}

fn run_parse_signals(file: &Path, config_path: &str) -> Result<()> {
    use anyhow::Context;

    let config = ConfigLoader::load(config_path)?;
    let parser = SignalParser::new(&config.signals.pattern, SignalDefaults::from(&config.trading))?;
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read signals file: {}", file.display()))?;

    let signals = parser.parse_batch(&text);
    tracing::info!(count = signals.len(), "Parsed signal batch");
    println!("{}", serde_json::to_string_pretty(&signals)?);
    Ok(())
}
