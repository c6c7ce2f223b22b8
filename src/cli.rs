use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::broker::DEFAULT_PORT;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat broker, accepting TCP connections.
    Broker(BrokerArgs),
    /// Connect to a broker and participate in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Port the broker should listen on. Use 0 for an ephemeral port.
    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Hostname of the broker to connect to.
    pub hostname: String,

    /// Username used when joining the chat.
    pub username: String,

    /// Control port of the broker.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory where received files are stored.
    #[arg(long, default_value = ".")]
    pub download_dir: PathBuf,
}
