use std::io;

use base64::{Engine, engine::general_purpose::STANDARD};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[u8] = b"\r\n";

const NAME_TAG: &str = "NAME";
const CHAT_TAG: &str = "CHAT";

/// A single line of the chat protocol.
///
/// Payload fields are raw bytes. On the wire every field is base64 encoded, so
/// names and words may contain spaces, control bytes or newlines without
/// breaking the line framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Declares or updates the sender's display name.
    Name { name: Vec<u8> },
    /// A chat line, attributed to `name`.
    Chat { name: Vec<u8>, words: Vec<u8> },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown message tag {0:?}")]
    UnknownTag(String),
    #[error("{tag} expects {expected} tokens, found {found}")]
    TokenCount {
        tag: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl Message {
    pub fn name(name: impl Into<Vec<u8>>) -> Self {
        Message::Name { name: name.into() }
    }

    pub fn chat(name: impl Into<Vec<u8>>, words: impl Into<Vec<u8>>) -> Self {
        Message::Chat {
            name: name.into(),
            words: words.into(),
        }
    }

    /// Encodes the message as one newline-terminated wire line.
    pub fn encode(&self) -> String {
        match self {
            Message::Name { name } => format!("{NAME_TAG} {}\n", STANDARD.encode(name)),
            Message::Chat { name, words } => format!(
                "{CHAT_TAG} {} {}\n",
                STANDARD.encode(name),
                STANDARD.encode(words)
            ),
        }
    }

    /// Parses one wire line. A trailing `\n` or `\r\n` is optional.
    pub fn decode(line: &[u8]) -> Result<Message, DecodeError> {
        let line = trim_line_ending(line);
        // Split on single spaces so an empty field survives as an empty token.
        let tokens: Vec<&[u8]> = line.split(|byte| *byte == b' ').collect();

        match tokens[0] {
            tag if tag == NAME_TAG.as_bytes() => {
                expect_tokens(NAME_TAG, &tokens, 2)?;
                Ok(Message::Name {
                    name: STANDARD.decode(tokens[1])?,
                })
            }
            tag if tag == CHAT_TAG.as_bytes() => {
                expect_tokens(CHAT_TAG, &tokens, 3)?;
                Ok(Message::Chat {
                    name: STANDARD.decode(tokens[1])?,
                    words: STANDARD.decode(tokens[2])?,
                })
            }
            other => Err(DecodeError::UnknownTag(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    /// The name carried by the message, lossily converted for display.
    pub fn display_name(&self) -> String {
        match self {
            Message::Name { name } | Message::Chat { name, .. } => {
                String::from_utf8_lossy(name).into_owned()
            }
        }
    }
}

/// Reads one complete line and decodes it.
///
/// Returns `Ok(None)` at end of stream. A final line without a terminator is
/// still decoded. Decode failures are returned inside `Some` so callers can
/// skip bad lines and keep reading.
pub async fn read_message<R>(reader: &mut R) -> io::Result<Option<Result<Message, DecodeError>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let bytes = reader.read_until(b'\n', &mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(Message::decode(&line)))
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(message.encode().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn trim_line_ending(mut line: &[u8]) -> &[u8] {
    while let Some((last, rest)) = line.split_last() {
        if !LINE_ENDINGS.contains(last) {
            break;
        }
        line = rest;
    }
    line
}

fn expect_tokens(tag: &'static str, tokens: &[&[u8]], expected: usize) -> Result<(), DecodeError> {
    if tokens.len() != expected {
        return Err(DecodeError::TokenCount {
            tag,
            expected,
            found: tokens.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const AWKWARD: &[&[u8]] = &[
        b"",
        b"alice",
        b"two words",
        b"line\nbreak",
        b"crlf\r\n",
        b"\x00\x01\x7f\xff",
        b"NAME CHAT",
        b"   ",
    ];

    #[test]
    fn encodes_documented_wire_format() {
        assert_eq!(Message::name("alice").encode(), "NAME YWxpY2U=\n");
        assert_eq!(
            Message::chat("alice", "hi").encode(),
            "CHAT YWxpY2U= aGk=\n"
        );
        assert_eq!(Message::name("").encode(), "NAME \n");
    }

    #[test]
    fn awkward_payloads_survive_the_wire() {
        for name in AWKWARD {
            let announcement = Message::name(*name);
            let decoded = Message::decode(announcement.encode().as_bytes()).expect("decode name");
            assert_eq!(decoded, announcement);

            for words in AWKWARD {
                let chat = Message::chat(*name, *words);
                let encoded = chat.encode();
                assert_eq!(encoded.matches('\n').count(), 1, "framing broken: {encoded:?}");
                let decoded = Message::decode(encoded.as_bytes()).expect("decode chat");
                assert_eq!(decoded, chat);
            }
        }
    }

    #[test]
    fn decode_accepts_lines_without_terminator() {
        let decoded = Message::decode(b"CHAT YWxpY2U= aGk=").expect("decode");
        assert_eq!(decoded, Message::chat("alice", "hi"));

        let decoded = Message::decode(b"NAME YWxpY2U=\r\n").expect("decode");
        assert_eq!(decoded, Message::name("alice"));
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(matches!(
            Message::decode(b"GARBAGE\n"),
            Err(DecodeError::UnknownTag(tag)) if tag == "GARBAGE"
        ));
        assert!(matches!(
            Message::decode(b"\n"),
            Err(DecodeError::UnknownTag(_))
        ));
        assert!(matches!(
            Message::decode(b"name YWxpY2U=\n"),
            Err(DecodeError::UnknownTag(_))
        ));
    }

    #[test]
    fn rejects_wrong_token_count() {
        assert!(matches!(
            Message::decode(b"NAME\n"),
            Err(DecodeError::TokenCount {
                tag: "NAME",
                expected: 2,
                found: 1
            })
        ));
        assert!(matches!(
            Message::decode(b"CHAT YWxpY2U=\n"),
            Err(DecodeError::TokenCount { tag: "CHAT", .. })
        ));
        assert!(matches!(
            Message::decode(b"CHAT YWxpY2U= aGk= aGk=\n"),
            Err(DecodeError::TokenCount { found: 4, .. })
        ));
        // A doubled separator yields an extra empty token.
        assert!(matches!(
            Message::decode(b"NAME  YWxpY2U=\n"),
            Err(DecodeError::TokenCount { found: 3, .. })
        ));
    }

    #[test]
    fn rejects_invalid_base64() {
        assert!(matches!(
            Message::decode(b"NAME not-base64!!\n"),
            Err(DecodeError::Base64(_))
        ));
        assert!(matches!(
            Message::decode(b"CHAT YWxpY2U= %%%\n"),
            Err(DecodeError::Base64(_))
        ));
    }

    #[tokio::test]
    async fn stream_helpers_frame_one_message_per_line() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let message = Message::chat("alice", "hello\nbob");

        write_message(&mut writer, &message)
            .await
            .expect("write message");
        writer.write_all(b"GARBAGE\n").await.expect("write garbage");
        drop(writer);

        let parsed = read_message(&mut reader)
            .await
            .expect("read message")
            .expect("expected line")
            .expect("valid message");
        assert_eq!(parsed, message);

        let garbage = read_message(&mut reader).await.expect("read garbage");
        assert!(matches!(garbage, Some(Err(DecodeError::UnknownTag(_)))));

        let eof = read_message(&mut reader).await.expect("read eof");
        assert!(eof.is_none());
    }

    #[test]
    fn display_name_is_lossy() {
        assert_eq!(Message::chat("bob", "x").display_name(), "bob");
        assert_eq!(Message::name(vec![0xff]).display_name(), "\u{fffd}");
    }
}
