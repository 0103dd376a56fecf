use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use traffic_net::admin;
use traffic_net::config::{PhaseAuthority, SimConfig};
use traffic_net::coordinator::Coordinator;
use traffic_net::dashboard;
use traffic_net::entry::{self, EntrySettings};
use traffic_net::intersection::{IntersectionProcess, IntersectionSettings};
use traffic_net::simulation::Shutdown;
use traffic_net::sink::{self, SinkSettings};

#[derive(Parser)]
#[command(name = "traffic_net")]
#[command(about = "Distributed traffic signal network simulation")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct CommonArgs {
    /// JSON configuration file; built-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Coordinator host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Coordinator port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Real seconds per simulated second
    #[arg(long, global = true)]
    time_scale: Option<f64>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator
    Coordinator {
        /// Event log file
        #[arg(long)]
        event_log: Option<PathBuf>,

        /// Write the ordered event list here on shutdown
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Run one intersection
    Intersection {
        /// Crossing id, e.g. Cr1
        id: String,

        /// Port for direct arrivals
        #[arg(long)]
        listen_port: Option<u16>,

        /// Arbitrate phases inside the process instead of at the coordinator
        #[arg(long)]
        local_phases: bool,
    },
    /// Run one entry generator
    Entry {
        /// Entry id, e.g. E1
        id: String,

        /// Vehicles per simulated second
        #[arg(long)]
        rate: Option<f64>,

        /// Seed for a reproducible vehicle stream
        #[arg(long)]
        seed: Option<u64>,

        /// Stop after this many vehicles
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Log telemetry pushed by the coordinator
    Dashboard,
    /// Collect vehicle exits and publish traffic statistics
    Sink {
        /// Milliseconds between two statistics reports
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Print the recorded history of one vehicle
    History {
        vehicle_id: String,
    },
    /// Stop the whole network
    Stop,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli.common)?;
    let topology = Arc::new(config.topology()?);

    match cli.command {
        Command::Coordinator { event_log, export } => {
            let mut coordinator_config = config.coordinator.clone();
            if let Some(path) = event_log {
                coordinator_config.event_log = path;
            }
            if export.is_some() {
                coordinator_config.export = export;
            }
            let coordinator = Coordinator::bind(&coordinator_config, config.policy)?;
            coordinator.serve()
        }
        Command::Intersection {
            id,
            listen_port,
            local_phases,
        } => {
            let mut settings = IntersectionSettings::from_config(&config, &id)?;
            if let Some(port) = listen_port {
                settings.listen_port = port;
            }
            if local_phases {
                settings.phase_authority = PhaseAuthority::Local;
            }
            let process = IntersectionProcess::start(settings, topology)?;
            process.wait();
            info!("{} stopped", id);
            Ok(())
        }
        Command::Entry { id, rate, seed, limit } => {
            let mut settings = EntrySettings::from_config(&config, &id)?;
            if let Some(rate) = rate {
                settings.rate = rate;
            }
            settings.seed = seed;
            settings.limit = limit;
            entry::run(settings, topology, Shutdown::new())
        }
        Command::Dashboard => {
            let updates =
                dashboard::run(&config.coordinator.address(), config.link, &Shutdown::new())?;
            info!("dashboard received {} updates", updates);
            Ok(())
        }
        Command::Sink { interval_ms } => {
            let mut settings = SinkSettings::from_config(&config);
            if let Some(ms) = interval_ms {
                settings.interval = Duration::from_millis(ms.max(1));
            }
            let stats = sink::run(settings, &Shutdown::new())?;
            info!("sink stopped after {} vehicles", stats.total_vehicles);
            Ok(())
        }
        Command::History { vehicle_id } => {
            let records =
                admin::request_history(&config.coordinator.address(), config.link, &vehicle_id)?;
            if records.is_empty() {
                println!("no records for {}", vehicle_id);
            }
            for record in records {
                println!(
                    "{:>8.2}  {:<18} {:<6} {}",
                    record.sim_time, record.kind, record.node, record.details
                );
            }
            Ok(())
        }
        Command::Stop => admin::send_stop(&config.coordinator.address(), config.link),
    }
}

fn load_config(args: &CommonArgs) -> Result<SimConfig> {
    let mut config = SimConfig::load_or_default(args.config.as_deref())?;
    if let Some(host) = &args.host {
        config.coordinator.host = host.clone();
    }
    if let Some(port) = args.port {
        config.coordinator.port = port;
    }
    if let Some(scale) = args.time_scale {
        config.time_scale = scale;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}
