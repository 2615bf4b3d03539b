//! Parley voice demo
//!
//! Joins one call with the settings from the voice settings file and logs
//! engine events until Ctrl-C.

mod args;

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use parley_client::voice::audio::{list_input_devices, list_output_devices};
use parley_client::{ConnectParams, VoiceConnection, VoiceEngine, VoiceEvent, VoiceSettings};

use args::Args;

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_devices() {
    println!("Input devices:");
    for device in list_input_devices() {
        println!("  {}", device);
    }
    println!("Output devices:");
    for device in list_output_devices() {
        println!("  {}", device);
    }
}

fn connect_params(args: &Args) -> Option<ConnectParams> {
    Some(ConnectParams {
        endpoint: args.endpoint.clone()?,
        token: args.token.clone()?,
        session_id: args.session_id.clone()?,
        server_id: args.server_id.clone()?,
        user_id: args.user_id.clone()?,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);

    if args.list_devices {
        print_devices();
        return ExitCode::SUCCESS;
    }

    let Some(params) = connect_params(&args) else {
        error!("missing connection parameters");
        return ExitCode::FAILURE;
    };

    let settings = match &args.config {
        Some(path) => VoiceSettings::load_from(path),
        None => VoiceSettings::load(),
    };
    info!(
        quality = %settings.quality,
        vad = ?settings.vad_method,
        "loaded voice settings"
    );

    let (engine, mut events) = VoiceEngine::new(settings);
    let connection = match VoiceConnection::connect(engine, params) {
        Ok(connection) => connection,
        Err(e) => {
            error!("failed to start voice session: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut exit = ExitCode::SUCCESS;
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(VoiceEvent::Disconnected(reason)) => {
                        if let Some(reason) = reason {
                            error!("disconnected: {}", reason);
                            exit = ExitCode::FAILURE;
                        }
                        break;
                    }
                    Some(VoiceEvent::DeviceError(message)) => warn!("device error: {}", message),
                    Some(event) => info!(?event, "voice event"),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("leaving call");
                break;
            }
        }
    }

    // Teardown joins the session thread
    if tokio::task::spawn_blocking(move || drop(connection))
        .await
        .is_err()
    {
        warn!("voice session did not shut down cleanly");
    }
    exit
}
