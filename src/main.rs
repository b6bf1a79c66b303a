use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use game_updater::models::{
    AuthMode, Branch, LaunchIdentity, LaunchRequest, LauncherEvent, OperationOutcome,
    LATEST_VERSION,
};
use game_updater::utils::paths::{resolve_log_dir, resolve_root_dir};
use game_updater::{logging, LauncherConfig, OrchestratorDeps, Result, UpdateOrchestrator};

#[derive(Parser, Debug)]
#[command(name = "game-updater")]
#[command(about = "Installs, updates and launches the game client", long_about = None)]
struct Cli {
    /// Overrides the launcher root directory.
    #[arg(long)]
    root: Option<PathBuf>,
    /// Keep warnings out of stderr; they still go to the log file.
    #[arg(long)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bring an instance up to date and start the client.
    Launch {
        name: String,
        #[arg(long, default_value = "release")]
        branch: Branch,
        /// Pin a published version instead of following latest.
        #[arg(long)]
        version: Option<u32>,
        #[arg(long, default_value = "00000000-0000-0000-0000-000000000000")]
        uuid: String,
        #[arg(long, requires = "session_token")]
        identity_token: Option<String>,
        #[arg(long, requires = "identity_token")]
        session_token: Option<String>,
    },
    /// Print published versions, newest first.
    Versions {
        #[arg(long, default_value = "release")]
        branch: Branch,
    },
    /// Print installed instances for every branch.
    List,
    /// Delete an installed instance.
    Remove {
        #[arg(long, default_value = "release")]
        branch: Branch,
        #[arg(long, default_value_t = LATEST_VERSION)]
        version: u32,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let root = cli.root.unwrap_or_else(resolve_root_dir);
    let config = LauncherConfig::load(&root)?;
    logging::init(&resolve_log_dir(&config.root_dir), !cli.quiet)?;

    let deps = OrchestratorDeps::production(&config);
    let (orchestrator, mut events) = UpdateOrchestrator::new(&config, deps);

    match cli.command {
        Commands::Launch {
            name,
            branch,
            version,
            uuid,
            identity_token,
            session_token,
        } => {
            let auth = match (identity_token, session_token) {
                (Some(identity_token), Some(session_token)) => AuthMode::Authenticated {
                    identity_token,
                    session_token,
                },
                _ => AuthMode::Offline,
            };
            let request = LaunchRequest {
                display_name: name,
                branch,
                version: version.unwrap_or(LATEST_VERSION),
                identity: LaunchIdentity { uuid, auth },
            };

            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    print_event(&event);
                }
            });

            let handle = orchestrator.start(request)?;
            let mut status = handle.status_watch();
            let interrupt = orchestrator.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received");
                    interrupt.cancel_active();
                    interrupt.stop_game();
                }
            });

            let outcome = handle.wait().await;
            match &outcome {
                OperationOutcome::Launched(game) => {
                    println!("started pid {} from {}", game.pid, game.instance_dir.display());
                    let _ = status.wait_for(|state| state.is_terminal()).await;
                }
                OperationOutcome::Failed { kind, message } => {
                    eprintln!("failed ({kind:?}): {message}");
                    return Ok(ExitCode::FAILURE);
                }
                OperationOutcome::Cancelled => {
                    eprintln!("cancelled");
                    return Ok(ExitCode::from(130));
                }
                OperationOutcome::Busy => {
                    eprintln!("another operation is already running");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Commands::Versions { branch } => {
            let versions = orchestrator.resolver().get_version_list(branch).await?;
            if versions.is_empty() {
                println!("No published versions on {branch}");
            }
            for version in versions {
                println!("{version}");
            }
        }
        Commands::List => {
            for branch in Branch::ALL {
                let checkpoint = orchestrator.instances().load_latest_checkpoint(branch)?;
                for version in orchestrator.instances().list_installed(branch) {
                    match (version, checkpoint) {
                        (LATEST_VERSION, Some(checkpoint)) => {
                            println!("{branch} latest (v{})", checkpoint.version)
                        }
                        (LATEST_VERSION, None) => println!("{branch} latest"),
                        (version, _) => println!("{branch} {version}"),
                    }
                }
            }
        }
        Commands::Remove { branch, version } => {
            if orchestrator.instances().delete_instance(branch, version)? {
                println!("removed");
            } else {
                println!("nothing installed for {branch} {version}");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_event(event: &LauncherEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(err) => tracing::warn!("failed to encode event: {}", err),
    }
}
