//! Transports carrying line-delimited JSON-RPC to and from a session
//!
//! A session only sees a [`Connection`]: a pair of channels of complete JSON
//! lines. Each transport pumps those channels to its own medium:
//!
//! - `stdio` - standard input/output for CLI usage
//! - `sse` - server-sent events for server-to-peer traffic, HTTP POST for
//!   peer-to-server traffic
//!
//! [`Connection::pair`] builds two connected in-memory ends, used by tests
//! and by embedders that run the peer in the same process.

pub mod sse;
pub mod stdio;

use tokio::sync::mpsc;

pub use sse::{SseServer, SseServerHandle};
pub use stdio::spawn_stdio;

/// Buffer size of each direction of a connection
pub const CHANNEL_CAPACITY: usize = 64;

/// One duplex line channel, as seen by the session
#[derive(Debug)]
pub struct Connection {
    /// Lines arriving from the peer. `None` from `recv` means the peer hung up.
    pub inbound: mpsc::Receiver<String>,
    /// Lines going to the peer
    pub outbound: mpsc::Sender<String>,
}

impl Connection {
    pub fn new(inbound: mpsc::Receiver<String>, outbound: mpsc::Sender<String>) -> Self {
        Self { inbound, outbound }
    }

    /// Two in-memory ends wired to each other
    pub fn pair() -> (Connection, Connection) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (Connection::new(a_rx, b_tx), Connection::new(b_rx, a_tx))
    }
}
