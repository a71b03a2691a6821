use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use reaper::backend::Backend;
use reaper::config::ReaperConfig;
use reaper::engine::Engine;
use reaper::fs_backend::FsBackend;
use reaper::net_backend::{compile_whitelist, NetBackend, NetPolicy};
use reaper::sink::DirectorySink;
use reaper_scu::DcmtkScu;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "reaper",
    about = "Unattended ingestion daemon for imaging instruments",
    version
)]
struct Cli {
    /// Configuration file (TOML); defaults apply when absent.
    #[arg(short, long, global = true, env = "REAPER_CONFIG")]
    config: Option<PathBuf>,

    /// Full log output on the console, not just warnings.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch a directory tree an instrument console writes into.
    File(FileArgs),
    /// Poll a query/retrieve peer over the network.
    Net(NetArgs),
}

#[derive(Args)]
struct FileArgs {
    /// Root of the instrument's output tree.
    path: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct NetArgs {
    /// Instrument host.
    host: String,
    /// Instrument port.
    port: u16,
    /// Local port the instrument connects back to for transfers.
    return_port: u16,
    /// Our application entity title.
    aet: String,
    /// The instrument's application entity title.
    aec: String,

    /// Leave subject identity in the data (de-identification is the default).
    #[arg(long)]
    no_anonymize: bool,

    /// Patient id glob a series must match to be reaped.
    #[arg(long)]
    whitelist: Option<String>,

    /// Patient ids to silently discard (repeatable).
    #[arg(long)]
    blacklist: Vec<String>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct CommonArgs {
    /// Seconds between polls.
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Consecutive unchanged polls before an item is reaped.
    #[arg(long)]
    stable_cycles: Option<u32>,

    /// Directory committed archives are moved into.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Persist the reaped/failed sets here across restarts.
    #[arg(long)]
    state_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    reaper_logging::init_logging(reaper_logging::LogConfig {
        app_name: "reaper",
        verbose: cli.verbose,
    })?;

    let mut config = match &cli.config {
        Some(path) => ReaperConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ReaperConfig::default(),
    };

    match cli.command {
        Command::File(args) => {
            apply_common(&mut config, &args.common);
            let backend = FsBackend::new(args.path.clone())
                .with_context(|| format!("opening data directory {}", args.path.display()))?;
            run(backend, &config)
        }
        Command::Net(args) => {
            apply_common(&mut config, &args.common);
            if let Some(pattern) = &args.whitelist {
                config.whitelist = pattern.clone();
            }
            if !args.blacklist.is_empty() {
                config.blacklist = args.blacklist.clone();
            }
            if args.no_anonymize {
                config.anonymize = false;
            }

            let scu = DcmtkScu {
                host: args.host.clone(),
                port: args.port,
                return_port: args.return_port,
                aet: args.aet.clone(),
                aec: args.aec.clone(),
            };
            let policy = NetPolicy {
                anonymize: config.anonymize,
                timezone: config.timezone()?,
                whitelist: compile_whitelist(&config.whitelist).map_err(|error| {
                    anyhow::anyhow!("invalid whitelist {:?}: {error}", config.whitelist)
                })?,
                blacklist: config.blacklist.clone(),
            };
            let backend = NetBackend::new(scu, args.aec.clone(), policy);
            run(backend, &config)
        }
    }
}

fn apply_common(config: &mut ReaperConfig, args: &CommonArgs) {
    if let Some(secs) = args.poll_interval {
        config.poll_interval_secs = secs;
    }
    if let Some(cycles) = args.stable_cycles {
        config.stable_cycles = cycles;
    }
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    if let Some(state_file) = &args.state_file {
        config.state_file = Some(state_file.clone());
    }
}

fn run<B: Backend>(backend: B, config: &ReaperConfig) -> Result<()> {
    let sink = Box::new(
        DirectorySink::new(config.output_dir.clone())
            .with_context(|| format!("opening output directory {}", config.output_dir.display()))?,
    );
    let mut engine = Engine::new(backend, sink, config.engine_options())
        .context("starting acquisition engine")?;
    install_signal_handlers(engine.shutdown_flag())?;
    engine.run();
    Ok(())
}

#[cfg(unix)]
fn install_signal_handlers(flag: Arc<AtomicBool>) -> Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&flag))
        .context("installing SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, flag)
        .context("installing SIGTERM handler")?;
    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handlers(_flag: Arc<AtomicBool>) -> Result<()> {
    Ok(())
}
