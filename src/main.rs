//! Application entry point: voice-duplex.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] from disk (returns default on first run).
//! 3. Open the output device; without one there is nothing to play into.
//! 4. Create the [`tokio`] runtime and connect to the relay.
//! 5. Create or join a session and start listening.
//! 6. Spawn the stdin command thread and the Ctrl-C watcher.
//! 7. Run the [`SessionRunner`] on the main thread until shutdown.
//!
//! # Keyboard
//!
//! | Input        | Command                          |
//! |--------------|----------------------------------|
//! | empty line   | end the current turn             |
//! | `b`          | barge in over the response       |
//! | `l`          | start listening                  |
//! | `s`          | stop listening                   |
//! | `q`          | quit                             |

use std::io::BufRead;

use anyhow::Context;
use tokio::sync::mpsc;
use voice_duplex::{
    audio::{MicrophoneSource, OutputStream},
    config::AppConfig,
    session::{
        new_shared_status, ControlMessage, InboundMessage, OutboundMessage, SessionCommand,
        SessionRunner,
    },
    transport,
};

// ---------------------------------------------------------------------------
// Command input
// ---------------------------------------------------------------------------

fn parse_command(line: &str) -> Option<SessionCommand> {
    match line.trim() {
        "" => Some(SessionCommand::EndTurn),
        "b" => Some(SessionCommand::BargeIn),
        "l" => Some(SessionCommand::StartListening),
        "s" => Some(SessionCommand::StopListening),
        "q" => Some(SessionCommand::Shutdown),
        _ => None,
    }
}

/// Blocking stdin reader; stdin has no async-friendly cancellation, so it
/// lives on its own thread and simply ends with the process.
fn spawn_stdin_commands(tx: mpsc::Sender<SessionCommand>) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("stdin-commands".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match parse_command(&line) {
                    Some(cmd) => {
                        if tx.blocking_send(cmd).is_err() {
                            break;
                        }
                    }
                    None => log::warn!("unknown command {line:?} (enter, b, l, s, q)"),
                }
            }
        })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("voice-duplex starting up");

    // 2. Configuration
    let config = AppConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });

    // 3. Output device
    let output = match OutputStream::open(config.playback.output_device.as_deref()) {
        Ok(output) => output,
        Err(e) => {
            log::error!("Audio output unavailable: {e}");
            return Err(e).context("cannot start without an output device");
        }
    };
    log::info!(
        "Audio output ready ({} Hz, {} ch)",
        output.sample_rate(),
        output.channels()
    );

    // 4. Runtime + relay
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let (inbound_tx, inbound_rx) = mpsc::channel::<InboundMessage>(256);
    let (command_tx, command_rx) = mpsc::channel::<SessionCommand>(16);

    let relay = rt
        .block_on(transport::connect(&config.relay.url, outbound_rx, inbound_tx))
        .context("relay connection failed")?;

    // 5. Session
    let hello = match &config.relay.session_id {
        Some(session_id) => ControlMessage::SessionJoin {
            session_id: session_id.clone(),
        },
        None => ControlMessage::SessionCreate,
    };
    outbound_tx
        .send(OutboundMessage::Control(hello))
        .context("relay writer closed")?;

    let status = new_shared_status();
    let runner = SessionRunner::new(
        &config,
        output.mixer(),
        MicrophoneSource::new(config.capture.clone()),
        outbound_tx,
        status,
    );
    // Capacity is 16 and nothing has been sent yet.
    let _ = command_tx.try_send(SessionCommand::StartListening);

    // 6. Inputs
    spawn_stdin_commands(command_tx.clone()).context("failed to spawn stdin thread")?;
    {
        let command_tx = command_tx.clone();
        rt.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Ctrl-C received");
                let _ = command_tx.send(SessionCommand::Shutdown).await;
            }
        });
    }

    // 7. Session loop (blocks until shutdown or relay close)
    rt.block_on(runner.run(inbound_rx, command_rx));

    relay.close();
    drop(output);
    log::info!("voice-duplex stopped");
    Ok(())
}
