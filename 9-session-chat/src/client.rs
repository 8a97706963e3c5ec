use std::sync::Arc;

use anyhow::Result;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::{
    cli::ClientArgs,
    message::Message,
    session::{Session, SessionHandler},
};

enum ClientEvent {
    Received(Message),
    Closed,
}

/// Forwards session callbacks into the terminal loop.
struct Forwarder {
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl SessionHandler for Forwarder {
    fn on_message(&self, _session: &Session, message: Message) {
        let _ = self.events.send(ClientEvent::Received(message));
    }

    fn on_close(&self, _session: &Session) {
        let _ = self.events.send(ClientEvent::Closed);
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let handler = Arc::new(Forwarder { events: events_tx });
    let session = Session::dial(args.server, args.session.session_config(), handler).await?;

    session.set_name(args.name.clone());
    session.send(Message::name(args.name.as_bytes()));

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&session, &args.name, &mut events, &mut stdin, &mut input).await?;
    session.close();
    session.closed().await;

    Ok(())
}

async fn run_client_loop(
    session: &Session,
    name: &str,
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            event = events.recv() => {
                if !handle_session_event(event).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, session, name).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_session_event(event: Option<ClientEvent>) -> Result<bool> {
    match event {
        Some(ClientEvent::Received(message)) => {
            render_message(message).await?;
            Ok(true)
        }
        Some(ClientEvent::Closed) | None => {
            write_stdout("*** connection closed").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    session: &Session,
    name: &str,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    session.send(Message::chat(name.as_bytes(), text.as_bytes()));
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn render_message(message: Message) -> io::Result<()> {
    match message {
        Message::Chat { name, words } => {
            write_stdout(&format!(
                "<{}> {}",
                String::from_utf8_lossy(&name),
                String::from_utf8_lossy(&words)
            ))
            .await
        }
        Message::Name { .. } => {
            debug!(name = %message.display_name(), "ignoring name announcement from server");
            Ok(())
        }
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
