//! Shared helpers for integration tests.
//!
//! [`mock_server`] runs a scripted Redis stand-in: it decodes each
//! inbound command with the crate's own parser, asserts the command
//! arrives in the scripted order, and answers with canned wire bytes.
//! One script per accepted connection, so reconnection flows can be
//! exercised deterministically.

#![allow(dead_code)]

use std::time::Duration;

use redlink::resp::parser::{ParserEvent, ReplyParser, StreamParser};
use redlink::{Event, Reply};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// What the mock does after one expected command.
pub enum Action {
    /// Write these bytes (may contain several frames, e.g. a
    /// confirmation followed by pushes).
    Respond(Vec<u8>),
    /// Drop the connection without answering.
    Close,
}

/// One scripted exchange: the expected command (name and text args,
/// space-joined, lowercase name) and the mock's reaction. An empty
/// `expect` marks an unsolicited action performed without waiting for
/// a command.
pub struct Exchange {
    pub expect: &'static str,
    pub action: Action,
}

/// Respond with `bytes` after seeing `expect`.
pub fn ex(expect: &'static str, bytes: &[u8]) -> Exchange {
    ex_owned(expect, bytes.to_vec())
}

/// Respond with owned `bytes` after seeing `expect`.
pub fn ex_owned(expect: &'static str, bytes: Vec<u8>) -> Exchange {
    Exchange {
        expect,
        action: Action::Respond(bytes),
    }
}

/// Unsolicited: drop the connection as soon as the script reaches this
/// point.
pub fn drop_connection() -> Exchange {
    Exchange {
        expect: "",
        action: Action::Close,
    }
}

/// Unsolicited: push `bytes` without waiting for a command.
pub fn push(bytes: &[u8]) -> Exchange {
    Exchange {
        expect: "",
        action: Action::Respond(bytes.to_vec()),
    }
}

/// Drop the connection after seeing `expect`.
pub fn close_after(expect: &'static str) -> Exchange {
    Exchange {
        expect,
        action: Action::Close,
    }
}

/// Keep the connection open after the previous exchange; any further
/// command is a test failure.
pub fn hold() -> Exchange {
    Exchange {
        expect: "(no further commands expected)",
        action: Action::Respond(Vec::new()),
    }
}

/// A healthy INFO reply for the readiness probe.
pub fn ready_info() -> Vec<u8> {
    let payload = "# Server\r\nredis_version:3.2.11\r\n\r\n# Persistence\r\nloading:0\r\n";
    format!("${}\r\n{}\r\n", payload.len(), payload).into_bytes()
}

/// The standard first exchange of every connection.
pub fn handshake() -> Exchange {
    Exchange {
        expect: "info",
        action: Action::Respond(ready_info()),
    }
}

/// Start a mock server. The `i`-th accepted connection is served with
/// `scripts[i]` (concurrently, so several clients can stay connected);
/// a connection closes when its script is exhausted.
pub async fn mock_server(scripts: Vec<Vec<Exchange>>) -> (String, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        for script in scripts {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve_connection(socket, script));
        }
    });

    (addr.ip().to_string(), addr.port())
}

/// Serve one connection against its script.
pub async fn serve_connection<S>(mut socket: S, script: Vec<Exchange>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut parser = StreamParser::new();
    let mut decoded: Vec<ParserEvent> = Vec::new();
    let mut buf = vec![0u8; 8192];
    let mut script: std::collections::VecDeque<Exchange> = script.into();

    loop {
        // Unsolicited actions fire before any further command is read.
        while matches!(script.front(), Some(e) if e.expect.is_empty()) {
            match script.pop_front().unwrap().action {
                Action::Respond(bytes) => socket.write_all(&bytes).await.unwrap(),
                Action::Close => return,
            }
        }
        if script.is_empty() {
            return;
        }

        if let Some(event) = pop_front(&mut decoded) {
            let ParserEvent::Reply(request) = event else {
                panic!("mock received an error frame");
            };
            let line = request_line(&request);
            let exchange = script.pop_front().unwrap();
            assert_eq!(line, exchange.expect, "command order mismatch");
            match exchange.action {
                Action::Respond(bytes) => socket.write_all(&bytes).await.unwrap(),
                Action::Close => return,
            }
            continue;
        }

        let n = match socket.read(&mut buf).await {
            Ok(n) => n,
            Err(_) => return,
        };
        if n == 0 {
            return;
        }
        parser
            .execute(&buf[..n], &mut decoded)
            .expect("mock received malformed request framing");
    }
}

fn pop_front(events: &mut Vec<ParserEvent>) -> Option<ParserEvent> {
    if events.is_empty() {
        None
    } else {
        Some(events.remove(0))
    }
}

/// Flatten a decoded request array into `name arg arg …`.
fn request_line(request: &Reply) -> String {
    let Reply::Array(items) = request else {
        panic!("request was not a multi-bulk array");
    };
    let mut parts = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let text = item
            .as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        if index == 0 {
            parts.push(text.to_ascii_lowercase());
        } else {
            parts.push(text);
        }
    }
    parts.join(" ")
}

/// Wait for a matching event, panicking after two seconds.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<Event>,
    mut matcher: impl FnMut(&Event) -> bool,
) -> Event {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.expect("event stream ended");
            if matcher(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
