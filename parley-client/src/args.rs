//! Command-line argument parsing

use std::path::PathBuf;

use clap::Parser;

/// Join a Parley voice call from the terminal
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Voice relay endpoint (host[:port] or a ws/wss URL)
    #[arg(short, long, required_unless_present = "list_devices")]
    pub endpoint: Option<String>,

    /// Voice session token
    #[arg(short, long, required_unless_present = "list_devices")]
    pub token: Option<String>,

    /// Session id from the chat gateway
    #[arg(long, required_unless_present = "list_devices")]
    pub session_id: Option<String>,

    /// Server (guild) id the call belongs to
    #[arg(long, required_unless_present = "list_devices")]
    pub server_id: Option<String>,

    /// Our user id
    #[arg(short, long, required_unless_present = "list_devices")]
    pub user_id: Option<String>,

    /// Voice settings file (overrides the platform default)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// List audio devices and exit
    #[arg(long, default_value = "false")]
    pub list_devices: bool,

    /// Enable debug logging
    #[arg(long, default_value = "false")]
    pub debug: bool,
}
