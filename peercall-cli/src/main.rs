//! Peercall CLI Application

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use peercall_core::prelude::*;
use peercall_core::{CallError, FailureKind};
use settings::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

mod settings;

type Service = CallService<WebSocketTransport>;
type Input = Lines<BufReader<Stdin>>;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Our user id on the chat server
    #[arg(short, long, env = "PEERCALL_USER", global = true)]
    user: Option<String>,

    /// Signaling server URL
    #[arg(short, long, env = "PEERCALL_SERVER", global = true)]
    server: Option<String>,

    /// Auth token for the signaling server
    #[arg(long, env = "PEERCALL_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a user
    Call {
        /// User id to call
        peer: String,

        /// Send audio (defaults to the settings file)
        #[arg(long)]
        audio: Option<bool>,

        /// Send video (defaults to the settings file)
        #[arg(long)]
        video: Option<bool>,
    },

    /// Wait for incoming calls
    Listen {
        /// Accept incoming calls without asking
        #[arg(long)]
        auto_accept: bool,
    },

    /// Print the effective settings as JSON
    Config {
        /// Also write them to the settings file
        #[arg(long)]
        save: bool,
    },
}

enum Decision {
    Accept,
    Reject,
    Gone,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("peercall=info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone();

    let mut settings = Settings::load(config_path.as_deref())?;
    settings.apply_overrides(cli.user, cli.server, cli.token);

    match cli.command {
        Commands::Call { peer, audio, video } => {
            let media = MediaPreferences {
                audio: audio.unwrap_or(settings.default_media.audio),
                video: video.unwrap_or(settings.default_media.video),
            };
            handle_call(&settings, &peer, media).await
        }
        Commands::Listen { auto_accept } => handle_listen(&settings, auto_accept).await,
        Commands::Config { save } => handle_config(&settings, config_path, save),
    }
}

async fn connect(settings: &Settings) -> Result<Service> {
    let user = settings.user_id()?;
    let transport = Arc::new(WebSocketTransport::new(settings.transport_config()));
    let service = CallService::builder(user.clone(), transport)
        .with_config(settings.service_config())
        .build();

    service
        .start()
        .await
        .with_context(|| format!("connecting to {}", settings.server))?;
    println!("Signed in as {user} on {}", settings.server);
    Ok(service)
}

async fn handle_call(settings: &Settings, peer: &str, media: MediaPreferences) -> Result<()> {
    let peer: UserId = peer.parse().context("invalid peer id")?;
    let service = connect(settings).await?;
    let mut events = service.subscribe_events();
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    println!("Calling {peer} ({})", describe_media(media));
    let outcome = match service.call_with_media(peer, media).await {
        Ok(()) => {
            print_help();
            in_call(&service, &mut events, &mut input).await
        }
        Err(e) => Err(e.into()),
    };

    service.shutdown().await?;
    match CallError::from_end_reason(outcome?) {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

async fn handle_listen(settings: &Settings, auto_accept: bool) -> Result<()> {
    let service = connect(settings).await?;
    let mut events = service.subscribe_events();
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    println!("Waiting for calls, Ctrl-C to quit");
    if auto_accept {
        println!("Auto-accept: enabled");
    }

    let outcome = listen(&service, &mut events, &mut input, auto_accept).await;
    service.shutdown().await?;
    outcome
}

fn handle_config(settings: &Settings, path: Option<PathBuf>, save: bool) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(settings)?);
    if save {
        let Some(path) = path.or_else(Settings::default_path) else {
            bail!("no config directory available; pass --config");
        };
        settings.save(&path)?;
        println!("Saved to {}", path.display());
    }
    Ok(())
}

async fn listen(
    service: &Service,
    events: &mut broadcast::Receiver<CallEvent>,
    input: &mut Input,
    auto_accept: bool,
) -> Result<()> {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        };

        match event {
            Ok(CallEvent::IncomingCall {
                from_user_id,
                media,
            }) => {
                println!("Incoming call from {from_user_id} ({})", describe_media(media));
                let decision = if auto_accept {
                    Decision::Accept
                } else {
                    prompt_decision(events, input).await?
                };

                match decision {
                    Decision::Accept => match service.accept_call().await {
                        Ok(()) => {
                            print_help();
                            in_call(service, events, input).await?;
                            println!("Waiting for calls, Ctrl-C to quit");
                        }
                        Err(e) => println!("Could not accept call: {e}"),
                    },
                    Decision::Reject => {
                        if let Err(e) = service.reject_call().await {
                            tracing::warn!("Reject failed: {}", e);
                        }
                    }
                    Decision::Gone => {}
                }
            }
            Ok(CallEvent::CallEnded { reason, .. }) => {
                println!("Call ended: {}", describe_reason(reason));
            }
            Ok(other) => {
                tracing::debug!("Received event: {:?}", other);
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event stream lagged");
            }
            Err(RecvError::Closed) => bail!("call manager stopped"),
        }
    }
}

async fn prompt_decision(
    events: &mut broadcast::Receiver<CallEvent>,
    input: &mut Input,
) -> Result<Decision> {
    println!("Accept? [y/n]");
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CallEvent::CallEnded { reason, .. }) => {
                    println!("Call ended: {}", describe_reason(reason));
                    return Ok(Decision::Gone);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("call manager stopped"),
            },
            line = input.next_line() => match line?.as_deref().map(str::trim) {
                Some("y") => return Ok(Decision::Accept),
                Some("n") | None => return Ok(Decision::Reject),
                Some(_) => println!("Please answer y or n"),
            },
        }
    }
}

/// Print events and run stdin commands until the call ends
async fn in_call(
    service: &Service,
    events: &mut broadcast::Receiver<CallEvent>,
    input: &mut Input,
) -> Result<EndReason> {
    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CallEvent::CallEnded { reason, .. }) => {
                    println!("Call ended: {}", describe_reason(reason));
                    return Ok(reason);
                }
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged");
                }
                Err(RecvError::Closed) => bail!("call manager stopped"),
            },
            line = input.next_line(), if stdin_open => match line? {
                Some(line) => run_command(service, line.trim()).await,
                None => {
                    stdin_open = false;
                    hang_up(service).await;
                }
            },
            _ = tokio::signal::ctrl_c() => hang_up(service).await,
        }
    }
}

async fn run_command(service: &Service, command: &str) {
    match command {
        "m" => println!("Microphone {}", on_off(service.toggle_mic().await)),
        "c" => println!("Camera {}", on_off(service.toggle_cam().await)),
        "q" => hang_up(service).await,
        "" => {}
        _ => print_help(),
    }
}

async fn hang_up(service: &Service) {
    if let Err(e) = service.end_call().await {
        tracing::warn!("Hang up failed: {}", e);
    }
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::StateChanged { state } => match state.peer() {
            Some(peer) => println!("Call {}: {peer}", state.name()),
            None => println!("Call {}", state.name()),
        },
        CallEvent::IncomingCall {
            from_user_id,
            media,
        } => println!(
            "Incoming call from {from_user_id} ({}) while busy",
            describe_media(*media)
        ),
        CallEvent::RemoteTrackAdded { track_id, kind } => {
            println!("Receiving {kind} track {track_id}");
        }
        CallEvent::CallEnded { reason, .. } => {
            println!("Call ended: {}", describe_reason(*reason));
        }
    }
}

fn print_help() {
    println!("Commands: m = toggle microphone, c = toggle camera, q = hang up");
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

fn describe_media(media: MediaPreferences) -> &'static str {
    match (media.audio, media.video) {
        (true, true) => "audio + video",
        (true, false) => "audio only",
        (false, true) => "video only",
        (false, false) => "no media",
    }
}

fn describe_reason(reason: EndReason) -> &'static str {
    match reason {
        EndReason::LocalHangup => "hung up",
        EndReason::RemoteHangup => "the other side hung up",
        EndReason::Rejected => "call was declined",
        EndReason::Declined => "declined",
        EndReason::Missed => "missed",
        EndReason::Failed(FailureKind::MediaAcquisition) => "failed: could not capture media",
        EndReason::Failed(FailureKind::Negotiation) => "failed: negotiation",
        EndReason::Failed(FailureKind::PeerUnreachable) => "failed: peer unreachable",
        EndReason::Failed(FailureKind::Signaling) => "failed: signaling lost",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_call_arguments() {
        let cli = Cli::try_parse_from([
            "peercall", "--user", "7", "call", "bob", "--video", "false",
        ])
        .unwrap();
        assert_eq!(cli.user.as_deref(), Some("7"));
        match cli.command {
            Commands::Call { peer, audio, video } => {
                assert_eq!(peer, "bob");
                assert_eq!(audio, None);
                assert_eq!(video, Some(false));
            }
            _ => panic!("expected call command"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "peercall",
            "listen",
            "--auto-accept",
            "--server",
            "https://chat.example.org",
        ])
        .unwrap();
        assert_eq!(cli.server.as_deref(), Some("https://chat.example.org"));
        assert!(matches!(cli.command, Commands::Listen { auto_accept: true }));
    }

    #[test]
    fn test_call_requires_peer() {
        assert!(Cli::try_parse_from(["peercall", "call"]).is_err());
    }

    #[test]
    fn test_describe_media() {
        assert_eq!(describe_media(MediaPreferences::video_call()), "audio + video");
        assert_eq!(describe_media(MediaPreferences::audio_only()), "audio only");
    }
}
