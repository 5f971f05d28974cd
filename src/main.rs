use clap::Parser;
use lazynote::cli::{self, CacheAction, Commands, ConfigAction};
use lazynote::graphics::EnvProbe;
use lazynote::{config, logging};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "lazynote")]
#[command(about = "Terminal note preview with inline images", long_about = None)]
struct Args {
    /// Config file (default: <config dir>/lazynote/config.yaml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log file (default: <data dir>/lazynote/lazynote.log)
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

fn main() {
    let args = Args::parse();

    if let Some(path) = args.log_file.clone().or_else(logging::default_log_path) {
        if let Err(e) = logging::init(&path) {
            eprintln!("warning: logging disabled: {:#}", e);
        }
    }

    let code = match run(args) {
        Ok(()) => 0,
        Err(code) => code,
    };
    std::process::exit(code);
}

fn run(args: Args) -> Result<(), i32> {
    let explicit = args.config.as_deref();

    // Config commands report their own load errors.
    if let Commands::Config { action } = &args.command {
        return match action {
            ConfigAction::Validate => cli::config::validate(explicit),
            ConfigAction::Show => cli::config::show(explicit),
        };
    }

    let cfg = config::load(explicit).map_err(|e| {
        eprintln!("{}", e);
        1
    })?;
    tracing::debug!(config = ?cfg.source_path, "Loaded config");

    match &args.command {
        Commands::Preview(preview) => cli::preview::run(&cfg, &EnvProbe::from_env(), preview),
        Commands::Cache { action } => match action {
            CacheAction::Stats => cli::cache::stats(&cfg),
            CacheAction::Invalidate { reference } => cli::cache::invalidate(&cfg, reference),
        },
        Commands::Probe => cli::probe::run(&EnvProbe::from_env()),
        Commands::Config { .. } => Ok(()),
    }
}
