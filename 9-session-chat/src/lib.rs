//! Line-oriented TCP chat with a per-connection session engine.
//!
//! Every connection is a [`session::Session`] running two tasks: a read pump
//! that decodes incoming lines and a write pump that drains a bounded outbound
//! queue. The server keeps live sessions in a [`registry::ClientRegistry`] and
//! rebroadcasts every chat line to all of them, sender included.
//!
//! - [`message`] is the wire codec: `NAME <b64>` and `CHAT <b64> <b64>` lines.
//! - [`session`] owns one connection: send, close, idle timeout, backpressure.
//! - [`registry`] tracks live sessions by id and fans messages out.
//! - [`server`] accepts connections, routes messages and shuts down cleanly.
//! - [`cli`] and [`client`] back the `session_chat` binary.

pub mod cli;
pub mod client;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
