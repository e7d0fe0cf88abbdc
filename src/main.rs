//! charge-tracker — live EV charging-session daemon and CLI
//!
//! `charge-tracker serve` (or no subcommand) runs the daemon; the other
//! subcommands send a single request to a running daemon and print the reply.

use charge_tracker::config::{self, TrackerConfig};
use charge_tracker::ipc::{self, Request};
use charge_tracker::session::SessionTally;
use charge_tracker::{InMemoryLedger, SessionTracker, client, server};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "charge-tracker", about = "Live EV charging-session tracker")]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Socket path (defaults to $XDG_RUNTIME_DIR/charge-tracker.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the tracker daemon
    Serve,
    /// Write the default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Start a charging session
    Start { driver: String, charger: String },
    /// Show a live session
    Status { session_id: String },
    /// Stop a session and settle it
    Stop { session_id: String, charger: String },
    /// List live sessions
    Live,
    /// Show the live session of a driver
    Driver { driver: String },
    /// List recently completed sessions
    Recent,
    /// Retry settlement of a stopped session (tally JSON from `stop`)
    Settle { tally: String },
    /// Show a driver's recorded sessions
    History { driver: String },
    /// List registered drivers
    Drivers,
    /// Show platform energy and CO2 totals
    Insights,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("CHARGE_TRACKER_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn load_config(path: Option<&Path>) -> TrackerConfig {
    match path {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    }
}

fn init_config(path: Option<&Path>, force: bool) -> Result<PathBuf, String> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(config::default_config_path)
        .ok_or("no config directory on this platform")?;
    if path.exists() && !force {
        return Err(format!("{} exists (use --force)", path.display()));
    }
    config::save_config_to(&TrackerConfig::default(), &path).map_err(|e| e.to_string())?;
    Ok(path)
}

async fn run_daemon(config: TrackerConfig, socket: PathBuf) -> std::io::Result<()> {
    let ledger = Arc::new(InMemoryLedger::new());
    let tracker = SessionTracker::new(config, ledger).map_err(std::io::Error::other)?;
    tracker.spawn_reaper();

    let listener = server::bind(&socket)?;
    tokio::select! {
        () = server::serve(listener, tracker.clone()) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for ctrl-c: {}", e);
            }
            info!("shutting down");
        }
    }

    tracker.shutdown();
    if let Err(e) = std::fs::remove_file(&socket) {
        warn!("Failed to remove socket {}: {}", socket.display(), e);
    }
    Ok(())
}

fn request_for(command: Command) -> Result<Request, String> {
    let request = match command {
        Command::Start { driver, charger } => Request::Start { driver, charger },
        Command::Status { session_id } => Request::Status { session_id },
        Command::Stop {
            session_id,
            charger,
        } => Request::Stop {
            session_id,
            charger,
        },
        Command::Live => Request::Live,
        Command::Driver { driver } => Request::Driver { driver },
        Command::Recent => Request::Recent,
        Command::Settle { tally } => {
            let tally: SessionTally =
                serde_json::from_str(&tally).map_err(|e| format!("invalid tally: {e}"))?;
            Request::Settle { tally }
        }
        Command::History { driver } => Request::History { driver },
        Command::Drivers => Request::Drivers,
        Command::Insights => Request::Insights,
        Command::Serve | Command::InitConfig { .. } => {
            return Err("not a client command".into());
        }
    };
    Ok(request)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let socket = cli.socket.unwrap_or_else(ipc::socket_path);

    match cli.command {
        None | Some(Command::Serve) => {
            let config = load_config(cli.config.as_deref());
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("failed to create tokio runtime: {e}");
                    return ExitCode::FAILURE;
                }
            };
            if let Err(e) = runtime.block_on(run_daemon(config, socket)) {
                eprintln!("charge-tracker: {e}");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Some(Command::InitConfig { force }) => match init_config(cli.config.as_deref(), force) {
            Ok(path) => {
                println!("wrote {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("charge-tracker: {e}");
                ExitCode::FAILURE
            }
        },
        Some(command) => {
            let request = match request_for(command) {
                Ok(r) => r,
                Err(e) => {
                    eprintln!("charge-tracker: {e}");
                    return ExitCode::FAILURE;
                }
            };
            match client::send(&socket, &request) {
                Ok(response) => {
                    let is_error = matches!(response, ipc::Response::Error { .. });
                    match serde_json::to_string_pretty(&response) {
                        Ok(json) => println!("{json}"),
                        Err(e) => eprintln!("charge-tracker: {e}"),
                    }
                    if is_error {
                        ExitCode::FAILURE
                    } else {
                        ExitCode::SUCCESS
                    }
                }
                Err(e) => {
                    eprintln!("charge-tracker: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
