use anyhow::{ensure, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use smartpin_harness::{run_simulator, SimulatorConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("smartpin-harness")
        .version(env!("CARGO_PKG_VERSION"))
        .about("SmartPin sync convergence harness")
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run concurrent clients against an in-memory backend")
                .arg(
                    Arg::new("clients")
                        .long("clients")
                        .value_parser(value_parser!(usize))
                        .help("Number of concurrent clients"),
                )
                .arg(
                    Arg::new("ops")
                        .long("ops")
                        .value_parser(value_parser!(u64))
                        .help("Number of operations to simulate"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("reject-rate")
                        .long("reject-rate")
                        .value_parser(value_parser!(f64))
                        .help("Chance that a commit is refused, in [0, 1]"),
                )
                .arg(
                    Arg::new("disconnect-rate")
                        .long("disconnect-rate")
                        .value_parser(value_parser!(f64))
                        .help("Chance per operation that a channel is cut, in [0, 1]"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("TOML file with simulator and sync settings"),
                )
                .arg(
                    Arg::new("stop-on-violation")
                        .long("stop-on-violation")
                        .action(ArgAction::SetTrue)
                        .help("Stop simulation on first violation"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output report as JSON"),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Defaults, then the config file, then explicit flags
fn simulator_config(args: &ArgMatches) -> anyhow::Result<SimulatorConfig> {
    let mut config = match args.get_one::<PathBuf>("config") {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => SimulatorConfig::default(),
    };

    if let Some(clients) = args.get_one::<usize>("clients") {
        config.clients = *clients;
    }
    if let Some(ops) = args.get_one::<u64>("ops") {
        config.ops = *ops;
    }
    if let Some(seed) = args.get_one::<u64>("seed") {
        config.seed = *seed;
    }
    if let Some(rate) = args.get_one::<f64>("reject-rate") {
        config.reject_rate = *rate;
    }
    if let Some(rate) = args.get_one::<f64>("disconnect-rate") {
        config.disconnect_rate = *rate;
    }
    if args.get_flag("stop-on-violation") {
        config.stop_on_first_violation = true;
    }

    for (name, rate) in [
        ("reject-rate", config.reject_rate),
        ("disconnect-rate", config.disconnect_rate),
        ("offline-rate", config.offline_rate),
    ] {
        ensure!((0.0..=1.0).contains(&rate), "{name} must be within [0, 1], got {rate}");
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let config = simulator_config(args)?;
            let json = args.get_flag("json");
            if !json {
                println!("Running SmartPin simulator...");
                println!("Clients: {}", config.clients);
                println!("Operations: {}", config.ops);
                println!("Seed: {}", config.seed);
                println!();
            }

            let report = run_simulator(config).await;

            if json {
                println!("{}", report.to_json()?);
            } else {
                println!("{}", report.generate_text());
            }
            std::process::exit(if report.passed() { 0 } else { 1 });
        }
        _ => {
            cli().print_help()?;
            Ok(())
        }
    }
}
