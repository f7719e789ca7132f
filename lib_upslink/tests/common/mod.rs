//! A scripted mock UPS server for integration tests: accepts
//! connections on a loopback port and answers each request line through
//! a caller-supplied handler.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Sentinel response: hang up on the client instead of answering.
#[allow(dead_code)]
pub const CLOSE: &str = "<close>";

/// Spawn a mock server; `respond` maps one request line to the response
/// lines to send back. Connections are served one at a time, which is
/// all a monitor session ever opens.
pub async fn spawn_upsd<F>(mut respond: F) -> SocketAddr
where
    F: FnMut(&str) -> Vec<String> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };

            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();

            'conn: while let Ok(Some(line)) = lines.next_line().await {
                for reply in respond(&line) {
                    if reply == CLOSE {
                        break 'conn;
                    }
                    if write
                        .write_all(format!("{reply}\n").as_bytes())
                        .await
                        .is_err()
                    {
                        break 'conn;
                    }
                }
            }
        }
    });

    addr
}
