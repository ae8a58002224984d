use std::fs;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use multirun::{logger, CancellationToken, Config, Manager};

const DEFAULT_CONFIG: &str = "multirun.yaml";

#[derive(Debug, Parser)]
#[command(
    name = "multirun",
    version,
    about = "Run and supervise a set of processes from one config file"
)]
struct Cli {
    /// More log output (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Write logs to a daily-rotating file in DIR instead of stderr.
    #[arg(long, value_name = "DIR", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a sample config file ("-" prints it to stdout).
    #[command(visible_alias = "i")]
    Init {
        #[arg(default_value = DEFAULT_CONFIG)]
        path: String,
    },
    /// Check a config file without running anything ("-" reads stdin).
    #[command(visible_alias = "v")]
    Validate { path: String },
    /// Start every process in the config file ("-" reads stdin).
    #[command(visible_alias = "r")]
    Run {
        path: String,
        /// Plain prefixes even on a terminal.
        #[arg(long)]
        no_color: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match logger::init_tracing(cli.verbose, cli.log_file.as_deref()) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("warning: logging disabled: {}", e);
            None
        }
    };

    let result = match cli.command {
        Commands::Init { path } => init(&path),
        Commands::Validate { path } => validate(&path),
        Commands::Run { path, no_color } => run(&path, no_color).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init(path: &str) -> Result<()> {
    let text = Config::sample()
        .to_yaml()
        .context("serializing sample config")?;

    if path == "-" {
        print!("{}", text);
        return Ok(());
    }

    fs::write(path, text).with_context(|| format!("writing config file {}", path))?;
    println!("New config file written to: {}", path);
    Ok(())
}

fn validate(path: &str) -> Result<()> {
    Config::read(path).context("reading config")?;
    println!("Config file is valid!");
    Ok(())
}

async fn run(path: &str, no_color: bool) -> Result<()> {
    let config = Config::read(path).context("reading config")?;
    let colored = !no_color && std::io::stdout().is_terminal();

    let manager = Manager::new(config).with_color(colored);
    manager
        .run(&CancellationToken::new())
        .await
        .context("running processes")?;
    Ok(())
}
