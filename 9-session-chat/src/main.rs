use anyhow::Result;
use clap::Parser;
use tracing::info;

use session_chat::{
    cli::{Cli, Command},
    client,
    server::ChatServer,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let server = ChatServer::new(args.server_config());
            let addr = server.listen(args.listen).await?;
            info!("server listening on {}", addr);
            server.run_until_ctrl_c().await;
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
