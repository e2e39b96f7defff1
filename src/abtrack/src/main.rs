//! abtrack - simulate one visitor page load against the experiment engine.
//!
//! Loads experiments from a JSON file, resolves and presents the experiments
//! on the page, replays optional clicks and external events, drives the
//! activity clock, and prints page outcomes plus every reported event.

use std::sync::Arc;

use abtrack_cache::open_store;
use abtrack_core::config::{AppConfig, StoreBackend};
use abtrack_core::event_bus::ChannelSink;
use abtrack_core::types::{AudienceContext, DeviceClass, Experiment, PageContext};
use abtrack_engine::driver::{run_clock, ClockOptions};
use abtrack_engine::{ActivitySignal, ElementEvent, Engine, StaticContent};
use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Device {
    Mobile,
    Tablet,
    Desktop,
}

impl From<Device> for DeviceClass {
    fn from(device: Device) -> Self {
        match device {
            Device::Mobile => DeviceClass::Mobile,
            Device::Tablet => DeviceClass::Tablet,
            Device::Desktop => DeviceClass::Desktop,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "abtrack")]
#[command(about = "Experiment assignment and conversion tracking engine")]
#[command(version)]
struct Cli {
    /// JSON file holding an array of experiments
    #[arg(long, env = "ABTRACK__EXPERIMENTS")]
    experiments: std::path::PathBuf,

    /// Identity of the page being loaded
    #[arg(long)]
    page_id: String,

    /// Full URL of the page being loaded
    #[arg(long)]
    url: String,

    /// Experiment ids present on the page (comma separated)
    #[arg(long, value_delimiter = ',')]
    present: Vec<String>,

    #[arg(long, value_enum, default_value_t = Device::Desktop)]
    device: Device,

    /// Opaque visitor id attached to every report
    #[arg(long)]
    visitor: Option<String>,

    /// Use the Redis store (overrides config)
    #[arg(long, default_value_t = false)]
    redis: bool,

    /// Selectors matched by a simulated click (comma separated)
    #[arg(long, value_delimiter = ',')]
    click: Vec<String>,

    /// External event as NAME or NAME=VALUE
    #[arg(long)]
    external: Option<String>,

    /// Visible page text for text-appearance triggers
    #[arg(long, default_value = "")]
    text: String,

    /// Seconds of simulated activity to drive the clock for
    #[arg(long, default_value_t = 0)]
    active_seconds: u64,

    /// Constrained mode: sample only the first two variations
    #[arg(long, env = "ABTRACK__ENGINE__CONSTRAINED_MODE")]
    constrained: Option<bool>,
}

fn parse_external(raw: &str) -> anyhow::Result<(String, Option<f64>)> {
    match raw.split_once('=') {
        Some((name, value)) => {
            let value = value
                .parse()
                .with_context(|| format!("invalid external event value {value:?}"))?;
            Ok((name.to_string(), Some(value)))
        }
        None => Ok((raw.to_string(), None)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "abtrack=info,abtrack_engine=info".into()),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if cli.redis {
        config.store.backend = StoreBackend::Redis;
    }
    if let Some(constrained) = cli.constrained {
        config.engine.constrained_mode = constrained;
    }

    let raw = std::fs::read_to_string(&cli.experiments)
        .with_context(|| format!("reading {}", cli.experiments.display()))?;
    let experiments: Vec<Experiment> =
        serde_json::from_str(&raw).context("parsing experiment configuration")?;
    info!(
        experiments = experiments.len(),
        store = ?config.store.backend,
        "Configuration loaded"
    );

    let store = open_store(&config.store)?;
    let (sink, mut receiver) = ChannelSink::new(config.reporting.channel_capacity);

    // Reporting runs on its own task; the engine never waits on it.
    let reporter = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "Unserializable event"),
            }
        }
    });

    let page = PageContext {
        page_id: cli.page_id.clone(),
        url: cli.url.clone(),
    };
    let audience = AudienceContext {
        url: cli.url.clone(),
        device: cli.device.into(),
        is_local_dev: config.store.backend == StoreBackend::Local,
    };
    let visitor = cli
        .visitor
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut engine = Engine::new(
        config.engine.clone(),
        store,
        Arc::new(sink),
        page,
        audience,
        experiments,
    )
    .with_visitor(visitor);

    let present: Vec<&str> = cli.present.iter().map(String::as_str).collect();
    let outcomes = engine.load_page(&present);
    println!("{}", serde_json::to_string(&outcomes)?);

    if outcomes.iter().any(|o| o.is_navigation()) {
        info!("Navigation requested, page work ends here");
    } else {
        if !cli.click.is_empty() {
            let selectors: Vec<&str> = cli.click.iter().map(String::as_str).collect();
            engine.on_dom_event(&ElementEvent::click(&selectors));
        }
        if let Some(raw) = &cli.external {
            let (name, value) = parse_external(raw)?;
            engine.on_external_event(&name, value);
        }
        if cli.active_seconds > 0 {
            let content = StaticContent {
                main: cli.text.clone(),
                frames: Vec::new(),
            };
            let (_shutdown_tx, shutdown_rx) = watch::channel(false);
            let fired = run_clock(
                &mut engine,
                &content,
                ClockOptions::from_millis(
                    config.engine.tick_interval_ms,
                    Some(cli.active_seconds),
                ),
                shutdown_rx,
                |engine, now| engine.signal(ActivitySignal::Key, now),
            )
            .await;
            info!(fired = fired.len(), "Activity clock finished");
        }
    }

    // Dropping the engine closes the reporting channel.
    drop(engine);
    reporter.await?;
    Ok(())
}
