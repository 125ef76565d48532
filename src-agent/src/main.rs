mod commands;
mod events;
mod logging;
mod state;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, warn};
use studyflow::{load_config, AppState, LogFormat, TrackerConfig, TrackerSettings};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use commands::Command;
use events::AgentEvent;
use state::AgentState;

/// Headless studyflow job tracker driven by line commands on stdin.
#[derive(Parser, Debug)]
#[command(name = "studyflow-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the tracker configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run against an in-memory backend instead of the configured one
    #[arg(long)]
    offline: bool,
}

fn build_state(args: &Args, config: Option<&TrackerConfig>) -> Result<AgentState, String> {
    if args.offline {
        let settings = config.map(TrackerSettings::from_config).unwrap_or_default();
        let capacity = config.map_or(64, |c| c.channel_capacity);
        info!("Running offline against an in-memory backend");
        return Ok(AgentState::offline(settings, capacity));
    }

    let config = config.ok_or("--config is required unless --offline is given")?;
    AgentState::online(config).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match load_config(path) {
            Ok(config) => Some(config),
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    logging::init(config.as_ref().map_or(LogFormat::Text, |c| c.log_format));
    info!("Starting studyflow agent v{}", env!("CARGO_PKG_VERSION"));

    let mut state = match build_state(&args, config.as_ref()) {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(256);
    let writer = events::spawn_writer(event_rx);
    let bridge = events::spawn_cache_bridge(state.tracker.cache(), event_tx.clone());

    let monitor = state.start_monitor();
    state.set_app_state(AppState::Active);

    let (stop_tx, mut stop_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    }) {
        warn!("Failed to install Ctrl-C handler: {}", e);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to read command: {}", e);
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let event = match line.parse::<Command>() {
                    Ok(Command::Quit) => break,
                    Ok(command) => commands::execute(&state, command).await,
                    Err(e) => AgentEvent::err("parse", e),
                };
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    }

    state.shutdown();
    if let Some(monitor) = monitor {
        monitor.abort();
    }
    bridge.abort();
    drop(event_tx);
    let _ = writer.await;

    info!("Studyflow agent stopped");
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_and_offline() {
        let args = Args::try_parse_from(["studyflow-agent", "-c", "tracker.json", "--offline"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("tracker.json")));
        assert!(args.offline);

        let args = Args::try_parse_from(["studyflow-agent"]).unwrap();
        assert!(args.config.is_none());
        assert!(!args.offline);
    }

    #[test]
    fn test_rejects_unknown_argument() {
        assert!(Args::try_parse_from(["studyflow-agent", "--verbose"]).is_err());
        assert!(Args::try_parse_from(["studyflow-agent", "--config"]).is_err());
    }

    #[test]
    fn test_online_mode_requires_config() {
        let args = Args::try_parse_from(["studyflow-agent"]).unwrap();
        let err = build_state(&args, None).err().unwrap();
        assert!(err.contains("--config"));
    }
}
