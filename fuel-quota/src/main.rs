use clap::{Parser, Subcommand};
use fuel_plans::{PlanId, ResourceKey};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use fuel_quota::{
    api::{self, AppState},
    config::{QuotaConfig, DEFAULT_CONFIG_PATH},
    MonthBucket, QuotaEngine, StationDirectory, StationId,
};

#[derive(Debug, Parser)]
#[command(name = "fuel-quota", author, version, about)]
struct Opts {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Overrides `log_level` from the config file
    #[clap(long)]
    log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the usage quota HTTP API.
    Serve {
        /// Overrides `listen` from the config file
        #[clap(long)]
        listen: Option<SocketAddr>,
    },

    /// Record one unit of usage for a station in the current month.
    Record {
        station: StationId,
        resource: ResourceKey,
    },

    /// Show usage against the plan limit.
    Check {
        station: StationId,
        resource: ResourceKey,

        /// Plan to check against instead of the station's assignment
        #[clap(long)]
        plan: Option<PlanId>,

        /// Month to report on, YYYY-MM (defaults to the current month)
        #[clap(long)]
        month: Option<MonthBucket>,
    },

    /// Show whether the station's plan leaves a resource uncapped.
    Unlocked {
        station: StationId,
        resource: ResourceKey,

        #[clap(long)]
        plan: Option<PlanId>,
    },

    /// Show monthly totals for a station and resource.
    History {
        station: StationId,
        resource: ResourceKey,
    },

    /// Delete usage records for months before the given one.
    Prune {
        #[clap(long)]
        before: MonthBucket,
    },

    /// List configured plans and their limits.
    Plans,

    /// Generate shell completion scripts
    Completions {
        #[clap(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = Opts::parse();

    if let Command::Completions { shell } = opts.command {
        use clap::CommandFactory;
        let mut app = Opts::command();
        let app_name = app.get_name().to_string();
        clap_complete::generate(shell, &mut app, app_name, &mut std::io::stdout());
        return Ok(());
    }

    let config = QuotaConfig::load(&opts.config)?;
    let level = log::LevelFilter::from_str(opts.log_level.as_deref().unwrap_or(&config.log_level))?;
    simple_logger::SimpleLogger::new().with_level(level).init()?;

    let registry = Arc::new(config.plan_registry()?);
    let stations = Arc::new(config.station_directory(&registry)?);
    let engine: QuotaEngine = config.build_engine(registry.clone())?;

    let plan_for = |station: StationId, explicit: Option<PlanId>| match explicit {
        Some(plan) => Ok(plan),
        None => stations.plan_for(station),
    };

    match opts.command {
        Command::Serve { listen } => {
            let addr = listen.unwrap_or(config.listen);
            let state = AppState {
                engine,
                stations: stations.clone(),
            };
            api::serve(addr, state).await?;
        }
        Command::Record { station, resource } => {
            let (month, count) = engine.record_usage_stamped(station, &resource).await?;
            println!("station {station} {resource} {month}: {count}");
        }
        Command::Check { station, resource, plan, month } => {
            let plan = plan_for(station, plan)?;
            print_json(&engine.check_limit(station, &resource, &plan, month).await?)?;
        }
        Command::Unlocked { station, resource, plan } => {
            let plan = plan_for(station, plan)?;
            let unlocked = engine.is_feature_unlocked(station, &plan, &resource)?;
            println!("{}", if unlocked { "unlocked" } else { "locked" });
        }
        Command::History { station, resource } => {
            for (month, count) in engine.usage_history(station, &resource).await? {
                println!("{month}\t{count}");
            }
        }
        Command::Prune { before } => {
            let removed = engine.prune_before(before).await?;
            println!("removed {removed} usage records before {before}");
        }
        Command::Plans => {
            print_json(&registry.plans().collect::<Vec<_>>())?;
        }
        Command::Completions { .. } => {}
    }

    Ok(())
}
