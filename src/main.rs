//! groupnode — node entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config, apply CLI overrides
//!   3. Resolve effective log level (CLI `-v` flags > env > config)
//!   4. Init logger once
//!   5. Spawn Ctrl-C → shutdown signal watcher
//!   6. Run the node sequencer: identity, groups, start, load generator, park

use tokio_util::sync::CancellationToken;
use tracing::info;

use groupnode::{
    config, error::AppError, ledger::memory::MemoryLedgerFactory, logger, node::NodeSequencer,
};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}

async fn run() -> Result<(), AppError> {
    // Load .env if present; the file is optional.
    let _ = dotenvy::dotenv();

    let args = parse_cli_args()?;

    let mut config = config::load(args.config_path.as_deref())?;
    if let Some(tx_speed) = args.tx_speed {
        config.set_tx_speed(tx_speed)?;
    }
    if args.no_load {
        config.load.enabled = false;
    }

    let effective_log_level = args.log_level.unwrap_or(config.log_level.as_str());
    let force_cli_level = args.log_level.is_some();

    logger::init(effective_log_level, force_cli_level)?;

    info!(
        data_dir = %config.data_dir.display(),
        groups = config.groups.len(),
        load_enabled = config.load.enabled,
        configured_log_level = %config.log_level,
        effective_log_level = %effective_log_level,
        "config loaded"
    );

    // Shared shutdown token; only Ctrl-C cancels it.
    let shutdown = CancellationToken::new();

    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            ctrlc_token.cancel();
        }
    });

    let mut node = NodeSequencer::new(config, MemoryLedgerFactory);
    node.run(&shutdown).await
}

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<String>,
    tx_speed: Option<f64>,
    no_load: bool,
}

fn parse_cli_args() -> Result<CliArgs, AppError> {
    let mut verbosity = 0u8;
    let mut config_path = None;
    let mut tx_speed = None;
    let mut no_load = false;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: groupnode [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -f, --config <PATH>        Path to configuration file (default: config/default.toml)");
                println!("  -v, -vv, -vvv, -vvvv       Increase logging verbosity");
                println!("      --tx-speed <N>         Load generator rate in tx/s, in (0, 1000]");
                println!("      --no-load              Do not start the load generator");
                std::process::exit(0);
            }
            "-f" | "--config" => {
                let path = iter
                    .next()
                    .ok_or_else(|| AppError::Config("-f/--config requires a path argument".into()))?;
                config_path = Some(path);
            }
            "--tx-speed" => {
                let value = iter
                    .next()
                    .ok_or_else(|| AppError::Config("--tx-speed requires a value".into()))?;
                let speed = value
                    .parse::<f64>()
                    .map_err(|e| AppError::Config(format!("--tx-speed '{value}': {e}")))?;
                tx_speed = Some(speed);
            }
            "--no-load" => no_load = true,
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            _ => {}
        }
    }

    Ok(CliArgs {
        log_level: logger::level_for_verbosity(verbosity),
        config_path,
        tx_speed,
        no_load,
    })
}
