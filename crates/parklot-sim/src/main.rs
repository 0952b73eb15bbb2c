use std::process;
use std::time::Duration;

use anyhow::Context;
use parklot::{
    HoldRange, JsonLinesSink, LotSupervisor, PresentationSink, SimulationConfig,
    SimulationOutcome, SimulationReport, SlotIndex, TracingSink, VehicleId,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventFormat {
    Text,
    Json,
    None,
}

#[derive(Debug, PartialEq, Eq)]
struct Options {
    capacity: Option<usize>,
    vehicles: Option<usize>,
    hold_min_ms: Option<u64>,
    hold_max_ms: Option<u64>,
    arrival_ms: Option<u64>,
    seed: Option<u64>,
    events: EventFormat,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            capacity: None,
            vehicles: None,
            hold_min_ms: None,
            hold_max_ms: None,
            arrival_ms: None,
            seed: None,
            events: EventFormat::Text,
        }
    }
}

fn print_usage() {
    eprintln!("Usage: parklot-sim [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --capacity <n>       Parking slots [default: 20, env PARKLOT_CAPACITY]");
    eprintln!("  --vehicles <n>       Vehicles to simulate [default: 20, env PARKLOT_VEHICLES]");
    eprintln!("  --hold-min-ms <ms>   Shortest hold [default: 50000, env PARKLOT_HOLD_MIN_MS]");
    eprintln!("  --hold-max-ms <ms>   Longest hold [default: 99000, env PARKLOT_HOLD_MAX_MS]");
    eprintln!("  --arrival-ms <ms>    Delay between arrivals [default: 0, env PARKLOT_ARRIVAL_MS]");
    eprintln!("  --seed <n>           Seed for hold durations [env PARKLOT_SEED]");
    eprintln!("  --events <format>    Transition output: text, json or none [default: text]");
    eprintln!();
    eprintln!("Logging: RUST_LOG, or PARKLOT_LOG=debug|info|warn|error; LOG_FORMAT=json.");
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            print_usage();
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(options).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    fn value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T, String> {
        let raw = args.get(i).ok_or(format!("{flag} requires a value"))?;
        raw.parse()
            .map_err(|_| format!("invalid value for {flag}: '{raw}'"))
    }

    let mut options = Options::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--capacity" => {
                i += 1;
                options.capacity = Some(value(args, i, flag)?);
            }
            "--vehicles" => {
                i += 1;
                options.vehicles = Some(value(args, i, flag)?);
            }
            "--hold-min-ms" => {
                i += 1;
                options.hold_min_ms = Some(value(args, i, flag)?);
            }
            "--hold-max-ms" => {
                i += 1;
                options.hold_max_ms = Some(value(args, i, flag)?);
            }
            "--arrival-ms" => {
                i += 1;
                options.arrival_ms = Some(value(args, i, flag)?);
            }
            "--seed" => {
                i += 1;
                options.seed = Some(value(args, i, flag)?);
            }
            "--events" => {
                i += 1;
                options.events = match args.get(i).map(String::as_str) {
                    Some("text") => EventFormat::Text,
                    Some("json") => EventFormat::Json,
                    Some("none") => EventFormat::None,
                    Some(other) => {
                        return Err(format!(
                            "invalid events format '{other}', expected text, json or none"
                        ));
                    }
                    None => return Err("--events requires a value".to_string()),
                };
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(options)
}

/// Environment first, then flags on top.
fn build_config(options: &Options) -> anyhow::Result<SimulationConfig> {
    let mut config = SimulationConfig::from_env().context("reading PARKLOT_* environment")?;

    if let Some(capacity) = options.capacity {
        config = config.with_capacity(capacity)?;
    }
    if let Some(vehicles) = options.vehicles {
        config = config.with_vehicles(vehicles);
    }
    if options.hold_min_ms.is_some() || options.hold_max_ms.is_some() {
        let min = options
            .hold_min_ms
            .map(Duration::from_millis)
            .unwrap_or(config.hold.min());
        let max = options
            .hold_max_ms
            .map(Duration::from_millis)
            .unwrap_or(config.hold.max());
        config = config.with_hold(HoldRange::new(min, max)?);
    }
    if let Some(ms) = options.arrival_ms {
        config = config.with_arrival_interval(Duration::from_millis(ms));
    }
    if let Some(seed) = options.seed {
        config = config.with_seed(seed);
    }

    Ok(config)
}

/// Initialize tracing with PARKLOT_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PARKLOT_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("parklot={level},parklot_sim={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Sink for `--events none`.
struct DiscardSink;

impl PresentationSink for DiscardSink {
    fn on_approach(&mut self, _vehicle: VehicleId) {}
    fn on_entered(&mut self, _vehicle: VehicleId, _slot: SlotIndex) {}
    fn on_queued_to_depart(&mut self, _vehicle: VehicleId) {}
    fn on_departed(&mut self, _vehicle: VehicleId) {}
}

async fn run(options: Options) -> anyhow::Result<()> {
    let config = build_config(&options)?;
    info!("parklot-sim {}", env!("CARGO_PKG_VERSION"));

    let supervisor = LotSupervisor::new(config);
    let cancel = supervisor.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted - emptying the lot");
            cancel.cancel();
        }
    });

    let report = match options.events {
        EventFormat::Text => simulate(&supervisor, TracingSink).await?,
        EventFormat::Json => simulate(&supervisor, JsonLinesSink::new(std::io::stdout())).await?,
        EventFormat::None => simulate(&supervisor, DiscardSink).await?,
    };

    // Keep stdout line-delimited when it already carries JSON events.
    let json = if options.events == EventFormat::Json {
        serde_json::to_string(&report)
    } else {
        serde_json::to_string_pretty(&report)
    }
    .context("serializing report")?;
    println!("{json}");

    Ok(())
}

async fn simulate<S: PresentationSink>(
    supervisor: &LotSupervisor,
    sink: S,
) -> anyhow::Result<SimulationReport> {
    let SimulationOutcome { report, .. } = supervisor
        .run(sink)
        .await
        .context("simulation aborted")?;
    Ok(report)
}
