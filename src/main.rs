//! Kaiwa CLI - terminal calling client for the Kaiwa platform
//!
//! Places and receives one-to-one audio/video calls from the terminal.

mod call;
mod config;
mod relay;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use call::media::MediaRuntime;
use call::noise::{NoiseGate, NoiseReducer};
use call::rendezvous::RelayRendezvous;
use call::session::{CallController, SessionDeps, SessionEvent};
use call::CallType;
use config::Config;
use relay::SignalingClient;

#[derive(Parser)]
#[command(name = "kaiwa-cli")]
#[command(about = "CLI calling client for the Kaiwa platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store identity and service endpoints
    Init {
        /// Participant id on the platform
        #[arg(long)]
        user: String,

        /// Display name shown to counterparts
        #[arg(long)]
        display_name: Option<String>,

        /// Realtime relay URL
        #[arg(long)]
        relay: Option<String>,

        /// Peer rendezvous base URL
        #[arg(long)]
        rendezvous: Option<String>,

        /// Rendezvous API key
        #[arg(long)]
        key: Option<String>,
    },

    /// Show the stored configuration
    Status,

    /// Call a user
    Call {
        /// Counterpart's participant id
        user: String,

        /// Request camera video as well as audio
        #[arg(long)]
        video: bool,
    },

    /// Wait for incoming calls
    Listen {
        /// Accept every incoming call without asking
        #[arg(long)]
        auto_accept: bool,
    },

    /// Test microphone capture: record 3 seconds then play back
    #[cfg(feature = "audio")]
    MicTest,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Init {
            user,
            display_name,
            relay,
            rendezvous,
            key,
        } => {
            let mut config = Config::load()?;
            config.user_id = Some(user);
            if display_name.is_some() {
                config.display_name = display_name;
            }
            if let Some(relay) = relay {
                config.relay_url = relay;
            }
            if let Some(rendezvous) = rendezvous {
                config.rendezvous_url = rendezvous;
            }
            if let Some(key) = key {
                config.rendezvous_key = key;
            }
            config.save()?;
            println!("Saved {}", Config::config_path()?.display());
        }
        Commands::Status => {
            let config = Config::load()?;
            match config.identity() {
                Ok((user, display)) => {
                    println!("Identity   : {} ({})", user, display);
                    println!("Relay      : {}", config.relay_url);
                    println!("Rendezvous : {} (key {})", config.rendezvous_url, config.rendezvous_key);
                    println!(
                        "Noise gate : {}",
                        if config.noise_reduction { "on" } else { "off" }
                    );
                }
                Err(e) => println!("{e:#}"),
            }
        }
        Commands::Call { user, video } => {
            let call_type = if video { CallType::Video } else { CallType::Audio };
            run_call(Some((user, call_type)), false).await?;
        }
        Commands::Listen { auto_accept } => {
            run_call(None, auto_accept).await?;
        }
        #[cfg(feature = "audio")]
        Commands::MicTest => {
            call::audio::mic_test()?;
        }
    }

    Ok(())
}

fn media_runtime() -> Arc<dyn MediaRuntime> {
    #[cfg(feature = "audio")]
    return Arc::new(call::audio::DeviceMediaRuntime);
    #[cfg(not(feature = "audio"))]
    Arc::new(call::media::NullMediaRuntime)
}

/// Wire up the controller against the configured services.
fn build_controller(config: &Config) -> Result<(CallController, Arc<SignalingClient>)> {
    let (user, display) = config.identity()?;

    let signaling = Arc::new(SignalingClient::connect(
        config.relay_url.clone(),
        user.clone(),
        display,
    ));
    let noise: Option<Arc<dyn NoiseReducer>> = config
        .noise_reduction
        .then(|| Arc::new(NoiseGate::new(config.noise_gate)) as Arc<dyn NoiseReducer>);

    let deps = SessionDeps {
        local_user: user,
        signaling: signaling.clone(),
        rendezvous: Arc::new(RelayRendezvous::new(
            config.rendezvous_url.clone(),
            config.rendezvous_key.clone(),
        )),
        media: media_runtime(),
        noise,
    };
    Ok((CallController::start(deps), signaling))
}

/// Interactive session loop, shared by `call` and `listen`.
///
/// `outgoing` rings the given user first; otherwise we sit and wait for a
/// ring. Keys: a=accept, r=reject, m=mic, c=camera, q=quit.
async fn run_call(outgoing: Option<(String, CallType)>, auto_accept: bool) -> Result<()> {
    let config = Config::load()?;
    let (controller, signaling) = build_controller(&config)?;
    let mut events = controller.subscribe();

    signaling
        .wait_connected(Duration::from_secs(10))
        .await
        .context("Relay connection failed")?;

    let one_shot = outgoing.is_some();
    if let Some((user, call_type)) = outgoing {
        println!("Calling {} ({})...", user, call_type);
        controller
            .initiate(&user, call_type)
            .await
            .with_context(|| format!("Cannot call {user}"))?;
    } else {
        println!("Listening for calls as {}... (Ctrl-C to stop)", signaling.user_id());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            ev = events.recv() => {
                let ev = match ev {
                    Ok(ev) => ev,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                match ev {
                    SessionEvent::IncomingCall { from, call_type } => {
                        println!("Incoming {} call from {}", call_type, from);
                        if auto_accept {
                            controller.accept_incoming_call().await.ok();
                        } else {
                            println!("  [a]ccept / [r]eject?");
                        }
                    }
                    SessionEvent::OutgoingCall { to, .. } => {
                        println!("Ringing {}...", to);
                    }
                    SessionEvent::RemoteAccepted => {
                        println!("Accepted — connecting...");
                    }
                    SessionEvent::Connected => {
                        println!("Connected. Keys: [m]ic, [c]amera, [q]uit");
                        spawn_playback(&controller).await;
                    }
                    SessionEvent::Failed { error } => {
                        println!("Call failed: {}", user_message(&error));
                    }
                    SessionEvent::Ended { reason } => {
                        println!("Call ended: {}", reason);
                        if one_shot {
                            break;
                        }
                    }
                }
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { continue };
                match line.trim() {
                    "a" => { controller.accept_incoming_call().await.ok(); }
                    "r" => { controller.reject_incoming_call().await.ok(); }
                    "m" => { controller.toggle_mic(None).await.ok(); }
                    "c" => { controller.toggle_camera(None).await.ok(); }
                    "q" => {
                        controller.end_call().await;
                        if one_shot {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    controller.dispose().await;
    Ok(())
}

fn user_message(error: &call::session::CallError) -> String {
    match error {
        call::session::CallError::Media(e) => format!("{} — {}", e, e.user_hint()),
        other => other.to_string(),
    }
}

/// Route remote frames to the speaker (with the `audio` feature) or just
/// count them.
async fn spawn_playback(controller: &CallController) {
    let Some(mut frames) = controller.remote_frames().await else {
        tracing::debug!("Remote stream has no frame channel");
        return;
    };

    #[cfg(feature = "audio")]
    let speaker = call::audio::AudioPlayback::start();
    #[cfg(not(feature = "audio"))]
    let speaker: Option<((), ())> = None;

    tokio::spawn(async move {
        let mut audio_frames: u64 = 0;
        let mut video_frames: u64 = 0;
        let mut last_report = std::time::Instant::now();

        while let Some(frame) = frames.recv().await {
            match frame {
                call::media::RemoteFrame::Audio(samples) => {
                    audio_frames += 1;
                    #[cfg(feature = "audio")]
                    if let Some((_, ref tx)) = speaker {
                        let _ = tx.try_send(samples);
                    }
                    #[cfg(not(feature = "audio"))]
                    drop(samples);
                }
                call::media::RemoteFrame::Video(_) => {
                    video_frames += 1;
                }
            }

            if last_report.elapsed() >= Duration::from_secs(5) {
                tracing::info!(
                    "Receiving: {} audio / {} video frames",
                    audio_frames,
                    video_frames
                );
                last_report = std::time::Instant::now();
            }
        }
        tracing::debug!("Remote frame channel closed");
        drop(speaker);
    });
}
