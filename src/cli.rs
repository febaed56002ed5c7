use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, relaying messages and files between clients.
    Server(ServerArgs),
    /// Connect to a chat server and participate in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:6000")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Name announced when joining the chat.
    #[arg(long)]
    pub name: String,

    /// Address of the chat server to connect to.
    #[arg(long, default_value = "127.0.0.1:6000")]
    pub server: SocketAddr,

    /// Address this client's transfer endpoint listens on; the bound address
    /// is advertised to the server for inbound file transfers.
    #[arg(long, default_value = "127.0.0.1:0")]
    pub transfer_listen: SocketAddr,
}
