//! Stdio transport for MCP
//!
//! Reads line-delimited JSON from stdin into a [`Connection`] and writes the
//! session's outbound lines to stdout.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{CHANNEL_CAPACITY, Connection};

/// Handles to the two pump tasks of a stdio connection
#[derive(Debug)]
pub struct StdioTasks {
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

/// Connect process stdin/stdout
pub fn spawn_stdio() -> (Connection, StdioTasks) {
    spawn_io(tokio::io::stdin(), tokio::io::stdout())
}

/// Connect any reader/writer pair as a line transport
pub fn spawn_io<R, W>(reader: R, writer: W) -> (Connection, StdioTasks)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let tasks = StdioTasks {
        reader: tokio::spawn(read_lines(reader, in_tx)),
        writer: tokio::spawn(write_lines(writer, out_rx)),
    };
    (Connection::new(in_rx, out_tx), tasks)
}

async fn read_lines<R>(reader: R, inbound: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    tracing::info!("Stdio transport started, waiting for input");

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::trace!(input = %line, "Received line");
                if inbound.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::info!("Stdin closed, shutting down");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read from stdin");
                break;
            }
        }
    }
}

async fn write_lines<W>(mut writer: W, mut outbound: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = outbound.recv().await {
        tracing::trace!(output = %line, "Sending line");
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::error!(error = %e, "Failed to write to stdout");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn test_lines_flow_both_ways() {
        let (mut peer_in, server_in) = duplex(1024);
        let (server_out, mut peer_out) = duplex(1024);

        let (mut conn, tasks) = spawn_io(server_in, server_out);

        peer_in.write_all(b"{\"a\":1}\n\n").await.unwrap();
        assert_eq!(conn.inbound.recv().await.unwrap(), "{\"a\":1}");
        assert_eq!(conn.inbound.recv().await.unwrap(), "");

        conn.outbound.send("{\"b\":2}".to_string()).await.unwrap();
        drop(conn.outbound);
        tasks.writer.await.unwrap();

        let mut written = String::new();
        peer_out.read_to_string(&mut written).await.unwrap();
        assert_eq!(written, "{\"b\":2}\n");

        drop(peer_in);
        assert!(conn.inbound.recv().await.is_none());
    }
}
