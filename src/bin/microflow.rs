use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::time::{interval, Duration};

use microflow::logging::LoggingConfig;
use microflow::{load_bundle_from_path, Engine, Value};

#[derive(Parser)]
#[command(name = "microflow", version, about = "Microflow runtime CLI", author)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a flow bundle until its flows finish
    Run {
        asset: PathBuf,
        /// Flow to start
        #[arg(long, default_value = "main")]
        flow: String,
        /// Scheduling quantum in milliseconds
        #[arg(long, default_value_t = 16)]
        tick_ms: u64,
        /// Stop after this many ticks even if flows are still live
        #[arg(long)]
        max_ticks: Option<u64>,
    },
    /// Print a summary of a flow bundle
    Inspect { asset: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    LoggingConfig::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            asset,
            flow,
            tick_ms,
            max_ticks,
        } => run(asset, flow, tick_ms, max_ticks).await,
        Command::Inspect { asset } => inspect(asset),
    }
}

async fn run(
    asset: PathBuf,
    flow: String,
    tick_ms: u64,
    max_ticks: Option<u64>,
) -> anyhow::Result<()> {
    let bundle =
        load_bundle_from_path(&asset).with_context(|| format!("loading {}", asset.display()))?;
    let mut engine = Engine::new(bundle);
    let errors = engine.error_log();
    engine.start_flow_by_name(&flow, Value::Undefined)?;

    let mut ticker = interval(Duration::from_millis(tick_ms.max(1)));
    let mut ticks = 0u64;
    loop {
        ticker.tick().await;
        engine.tick();
        ticks += 1;
        if engine.is_idle() {
            break;
        }
        if max_ticks.map(|limit| ticks >= limit).unwrap_or(false) {
            engine.stop();
            break;
        }
    }

    for record in errors.recent() {
        eprintln!(
            "flow error at component {}: {}",
            record.component_index, record.message
        );
    }
    println!("finished after {ticks} ticks");
    Ok(())
}

fn inspect(asset: PathBuf) -> anyhow::Result<()> {
    let bundle = load_bundle_from_path(&asset)?;
    for flow in bundle.flows() {
        println!(
            "{} ({} components, {} variables)",
            flow.name,
            flow.components.len(),
            flow.variables.len()
        );
        for component in &flow.components {
            println!("  {:<20} {}", component.name, component.kind.type_name());
        }
    }
    Ok(())
}
