use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use session_chat::{
    message::{Message, read_message, write_message},
    server::{ChatServer, ServerConfig, ServerEvent},
    session::{Session, SessionConfig, SessionHandler},
};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::{sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Every chat a client has received, as `(name, words)`.
#[derive(Default)]
struct ChatLog {
    chats: Mutex<Vec<(String, String)>>,
}

impl ChatLog {
    fn lines_from(&self, name: &str) -> Vec<String> {
        self.chats
            .lock()
            .iter()
            .filter(|(sender, _)| sender == name)
            .map(|(_, words)| words.clone())
            .collect()
    }

    fn count_from_others(&self, name: &str) -> usize {
        self.chats
            .lock()
            .iter()
            .filter(|(sender, _)| sender != name)
            .count()
    }
}

impl SessionHandler for ChatLog {
    fn on_message(&self, _session: &Session, message: Message) {
        if let Message::Chat { name, words } = message {
            self.chats.lock().push((
                String::from_utf8_lossy(&name).into_owned(),
                String::from_utf8_lossy(&words).into_owned(),
            ));
        }
    }
}

#[tokio::test]
async fn three_clients_join_chat_and_leave() -> Result<()> {
    let server = ChatServer::new(ServerConfig::default());
    let addr = server.listen("127.0.0.1:0").await?;

    let mut clients = Vec::new();
    for i in 0..3 {
        let id = format!("c{i:02}");
        let log = Arc::new(ChatLog::default());
        let session = Session::dial(addr, SessionConfig::default(), log.clone()).await?;
        wait_for_live(&server, i + 1).await?;

        let own = Arc::clone(&log);
        let task = tokio::spawn(async move {
            session.set_name(id.clone());
            session.send(Message::name(id.as_bytes()));
            for n in 0..3 {
                sleep(Duration::from_secs(1)).await;
                session.send(Message::chat(id.as_bytes(), format!("msg {n:02} from {id}")));
            }
            // Leave once the last line has come back through the server.
            let echoed = timeout(READ_TIMEOUT, async {
                while own.lines_from(&id).len() < 3 {
                    sleep(Duration::from_millis(10)).await;
                }
            })
            .await;
            session.close();
            session.closed().await;
            echoed.is_ok()
        });
        clients.push((format!("c{i:02}"), task, log));
    }

    sleep(Duration::from_secs(5)).await;
    timeout(Duration::from_secs(5), server.shutdown())
        .await
        .context("server shutdown timed out")?;

    for (id, task, log) in clients {
        assert!(task.await?, "{id} timed out waiting for its own lines");
        let expected: Vec<String> = (0..3).map(|n| format!("msg {n:02} from {id}")).collect();
        assert_eq!(log.lines_from(&id), expected);
        assert!(
            log.count_from_others(&id) >= 1,
            "{id} should hear at least one other client"
        );
    }

    let logs = server.logs();
    for live in 1..=3 {
        assert!(
            logs.iter()
                .any(|event| matches!(event, ServerEvent::Accepted { live: n, .. } if *n == live)),
            "expected an accept log with live={live}: {logs:?}"
        );
    }
    for i in 0..3 {
        let id = format!("c{i:02}");
        assert!(
            logs.iter()
                .any(|event| matches!(event, ServerEvent::Closed { name, .. } if *name == id)),
            "expected a close log for {id}: {logs:?}"
        );
    }
    let last_close = logs
        .iter()
        .rev()
        .find_map(|event| match event {
            ServerEvent::Closed { live, .. } => Some(*live),
            _ => None,
        })
        .context("no close events logged")?;
    assert_eq!(last_close, 0);
    assert!(server.registry().is_empty());

    Ok(())
}

#[tokio::test]
async fn departed_client_stops_receiving_broadcasts() -> Result<()> {
    let server = ChatServer::new(ServerConfig::default());
    let addr = server.listen("127.0.0.1:0").await?;

    let (mut alice_reader, mut alice_writer) = connect(addr).await?;
    let (bob_reader, mut bob_writer) = connect(addr).await?;
    let (mut carol_reader, _carol_writer) = connect(addr).await?;
    wait_for_live(&server, 3).await?;

    let hello = Message::chat("alice", "hello everyone");
    write_message(&mut alice_writer, &hello).await?;
    assert_eq!(next_message(&mut alice_reader).await?, hello);
    assert_eq!(next_message(&mut carol_reader).await?, hello);

    bob_writer.shutdown().await?;
    drop(bob_reader);
    drop(bob_writer);
    wait_for_live(&server, 2).await?;

    let again = Message::chat("alice", "bob left");
    assert_eq!(server.registry().len(), 2);
    write_message(&mut alice_writer, &again).await?;
    assert_eq!(next_message(&mut alice_reader).await?, again);
    assert_eq!(next_message(&mut carol_reader).await?, again);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn garbage_from_a_client_is_ignored() -> Result<()> {
    let server = ChatServer::new(ServerConfig::default());
    let addr = server.listen("127.0.0.1:0").await?;
    let (mut reader, mut writer) = connect(addr).await?;
    wait_for_live(&server, 1).await?;

    writer.write_all(b"GARBAGE\nCHAT only-one-token\nNAME not-base64!!\n").await?;
    let chat = Message::chat("dave", "still here");
    write_message(&mut writer, &chat).await?;

    assert_eq!(next_message(&mut reader).await?, chat);
    assert_eq!(server.registry().len(), 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn server_broadcast_reaches_connected_clients() -> Result<()> {
    let server = ChatServer::new(ServerConfig::default());
    let addr = server.listen("127.0.0.1:0").await?;
    let (mut first, _first_writer) = connect(addr).await?;
    let (mut second, _second_writer) = connect(addr).await?;
    wait_for_live(&server, 2).await?;

    let notice = Message::chat("server", "maintenance at noon");
    assert_eq!(server.broadcast(&notice), 2);
    assert_eq!(next_message(&mut first).await?, notice);
    assert_eq!(next_message(&mut second).await?, notice);

    server.shutdown().await;
    Ok(())
}

async fn connect(addr: SocketAddr) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn next_message(reader: &mut BufReader<OwnedReadHalf>) -> Result<Message> {
    let line = timeout(READ_TIMEOUT, read_message(reader))
        .await
        .context("timed out waiting for a message")??
        .context("connection closed")?;
    Ok(line?)
}

async fn wait_for_live(server: &ChatServer, expected: usize) -> Result<()> {
    let mut live = server.registry().live_count();
    timeout(READ_TIMEOUT, live.wait_for(|count| *count == expected))
        .await
        .with_context(|| format!("timed out waiting for {expected} live sessions"))??;
    Ok(())
}
