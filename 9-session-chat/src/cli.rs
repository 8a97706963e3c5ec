use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    server::ServerConfig,
    session::{IDLE_TIMEOUT, MAX_PENDING, SessionConfig},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, accepting TCP connections.
    Serve(ServeArgs),
    /// Connect to a server and participate in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name announced to the server.
    #[arg(long)]
    pub name: String,

    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub server: SocketAddr,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    /// Outbound messages buffered per connection before new ones are dropped.
    #[arg(long, default_value_t = MAX_PENDING)]
    pub max_pending: usize,

    /// Seconds a connection may go without outbound traffic before it is closed.
    #[arg(long, default_value_t = IDLE_TIMEOUT.as_secs())]
    pub idle_timeout_secs: u64,
}

impl SessionArgs {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_pending: self.max_pending,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

impl ServeArgs {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            session: self.session.session_config(),
        }
    }
}
