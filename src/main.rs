//! Flowgate - a programmable proxy router

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use flowgate::app::Instance;
use flowgate::config::Config;
use flowgate::error::Result;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    let path = args.config.unwrap_or_else(|| PathBuf::from("config.json"));
    let config = Config::load(&path)?;

    if args.check {
        config.validate()?;
        Instance::new(&config)?;
        println!("{}: configuration ok", path.display());
        return Ok(());
    }

    // RUST_LOG wins over the configured level
    if !config.log.disabled {
        let log_level = std::env::var("RUST_LOG")
            .ok()
            .and_then(|s| s.parse().ok())
            .or_else(|| config.log.level.parse().ok())
            .unwrap_or(Level::INFO);

        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| flowgate::Error::Config(format!("set tracing subscriber: {}", e)))?;
    }

    info!("Flowgate v{} starting with {}", env!("CARGO_PKG_VERSION"), path.display());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let instance = Instance::new(&config)?;
        instance.run().await
    })?;

    info!("Goodbye!");
    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    check: bool,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut check = false;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--check" => check = true,
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self { config, check, version }
    }
}

fn print_help() {
    println!(r#"Flowgate - a programmable proxy router

USAGE:
    flowgate [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file (default: config.json)
    --check                 Validate the configuration and exit
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    flowgate -c config.json
    flowgate -c config.json --check
"#);
}

fn print_version() {
    println!("Flowgate v{}", env!("CARGO_PKG_VERSION"));
}
