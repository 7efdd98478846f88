//! User-facing client handle and per-command entry points.
//!
//! [`create_client`] spawns the connection engine and returns a
//! cloneable [`Client`]. Commands may be submitted immediately: until
//! the connection is ready they wait in the offline queue and are
//! flushed in order once the handshake completes.
//!
//! Most commands go through the generic [`Client::send_command`]; the
//! entry points below cover the catalog commands with irregular
//! argument shapes (`hmset` field maps, `sadd`/`srem` member lists,
//! `eval` key/arg split, the subscribe family).

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::command::{Arg, Command, Completion};
use crate::config::{ClientOptions, Endpoint};
use crate::connection::engine::{self, ConnectionStatus, SharedServerInfo, SharedStatus};
use crate::error::{RedlinkError, Result};
use crate::events::{Event, EventBus};
use crate::resp::types::Reply;
use crate::server_info::ServerInfo;

/// Create a client for `endpoint` and start connecting in the
/// background. Must be called within a tokio runtime.
pub fn create_client(endpoint: Endpoint, options: ClientOptions) -> Client {
    let handles = engine::spawn(endpoint, options);
    Client {
        sender: handles.sender,
        events: handles.events,
        status: handles.status,
        server_info: handles.server_info,
    }
}

/// Handle to a connection engine. Cheap to clone; all clones share one
/// connection, one pipeline and one event stream.
#[derive(Clone)]
pub struct Client {
    sender: mpsc::Sender<Command>,
    events: EventBus,
    status: SharedStatus,
    server_info: SharedServerInfo,
}

impl Client {
    /// Create a client from a `redis://` URL (see
    /// [`Endpoint::from_url`]).
    pub fn from_url(url: &str, mut options: ClientOptions) -> Result<Self> {
        let endpoint = Endpoint::from_url(url, &mut options)?;
        Ok(create_client(endpoint, options))
    }

    /// Subscribe to the client's event stream (`connect`, `ready`,
    /// `message`, `reconnecting`, …).
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Snapshot of the connection state.
    pub fn status(&self) -> ConnectionStatus {
        self.status.read().clone()
    }

    /// The parsed reply of the most recent readiness probe.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().clone()
    }

    /// Submit a command and await its reply.
    ///
    /// This is the generic entry point behind every typed wrapper; any
    /// catalog command can be issued through it.
    pub async fn send_command(&self, name: &str, args: Vec<Arg>) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        let command = Command::new(name, args, Completion::Reply(tx));
        self.sender
            .send(command)
            .await
            .map_err(|_| RedlinkError::Closed)?;
        rx.await.map_err(|_| RedlinkError::Closed)?
    }

    // ── Strings / keys ─────────────────────────────────────────────

    pub async fn get(&self, key: impl Into<Arg>) -> Result<Reply> {
        self.send_command("get", vec![key.into()]).await
    }

    pub async fn set(&self, key: impl Into<Arg>, value: impl Into<Arg>) -> Result<Reply> {
        self.send_command("set", vec![key.into(), value.into()]).await
    }

    pub async fn setex(
        &self,
        key: impl Into<Arg>,
        seconds: u64,
        value: impl Into<Arg>,
    ) -> Result<Reply> {
        self.send_command("setex", vec![key.into(), seconds.into(), value.into()])
            .await
    }

    pub async fn del(
        &self,
        keys: impl IntoIterator<Item = impl Into<Arg>>,
    ) -> Result<Reply> {
        self.send_command("del", collect_args(keys)).await
    }

    pub async fn exists(&self, key: impl Into<Arg>) -> Result<Reply> {
        self.send_command("exists", vec![key.into()]).await
    }

    pub async fn incr(&self, key: impl Into<Arg>) -> Result<Reply> {
        self.send_command("incr", vec![key.into()]).await
    }

    pub async fn expire(&self, key: impl Into<Arg>, seconds: u64) -> Result<Reply> {
        self.send_command("expire", vec![key.into(), seconds.into()])
            .await
    }

    pub async fn mget(
        &self,
        keys: impl IntoIterator<Item = impl Into<Arg>>,
    ) -> Result<Reply> {
        self.send_command("mget", collect_args(keys)).await
    }

    pub async fn ping(&self) -> Result<Reply> {
        self.send_command("ping", vec![]).await
    }

    // ── Hashes ─────────────────────────────────────────────────────

    pub async fn hget(&self, key: impl Into<Arg>, field: impl Into<Arg>) -> Result<Reply> {
        self.send_command("hget", vec![key.into(), field.into()]).await
    }

    pub async fn hset(
        &self,
        key: impl Into<Arg>,
        field: impl Into<Arg>,
        value: impl Into<Arg>,
    ) -> Result<Reply> {
        self.send_command("hset", vec![key.into(), field.into(), value.into()])
            .await
    }

    /// `HMSET key field value [field value …]` from a pair list.
    pub async fn hmset(
        &self,
        key: impl Into<Arg>,
        pairs: impl IntoIterator<Item = (impl Into<Arg>, impl Into<Arg>)>,
    ) -> Result<Reply> {
        let mut args = vec![key.into()];
        for (field, value) in pairs {
            args.push(field.into());
            args.push(value.into());
        }
        self.send_command("hmset", args).await
    }

    /// Replies arrive as a field/value mapping ([`Reply::Map`]), or
    /// [`Reply::Nil`] for a missing key.
    pub async fn hgetall(&self, key: impl Into<Arg>) -> Result<Reply> {
        self.send_command("hgetall", vec![key.into()]).await
    }

    // ── Sets ───────────────────────────────────────────────────────

    /// `SADD key member [member …]`; the member list is flattened
    /// into the argument list.
    pub async fn sadd(
        &self,
        key: impl Into<Arg>,
        members: impl IntoIterator<Item = impl Into<Arg>>,
    ) -> Result<Reply> {
        let mut args = vec![key.into()];
        args.extend(members.into_iter().map(Into::into));
        self.send_command("sadd", args).await
    }

    /// `SREM key member [member …]`, flattened like [`Client::sadd`].
    pub async fn srem(
        &self,
        key: impl Into<Arg>,
        members: impl IntoIterator<Item = impl Into<Arg>>,
    ) -> Result<Reply> {
        let mut args = vec![key.into()];
        args.extend(members.into_iter().map(Into::into));
        self.send_command("srem", args).await
    }

    pub async fn smembers(&self, key: impl Into<Arg>) -> Result<Reply> {
        self.send_command("smembers", vec![key.into()]).await
    }

    // ── Lists ──────────────────────────────────────────────────────

    pub async fn lpush(
        &self,
        key: impl Into<Arg>,
        values: impl IntoIterator<Item = impl Into<Arg>>,
    ) -> Result<Reply> {
        let mut args = vec![key.into()];
        args.extend(values.into_iter().map(Into::into));
        self.send_command("lpush", args).await
    }

    pub async fn rpush(
        &self,
        key: impl Into<Arg>,
        values: impl IntoIterator<Item = impl Into<Arg>>,
    ) -> Result<Reply> {
        let mut args = vec![key.into()];
        args.extend(values.into_iter().map(Into::into));
        self.send_command("rpush", args).await
    }

    pub async fn lrange(
        &self,
        key: impl Into<Arg>,
        start: i64,
        stop: i64,
    ) -> Result<Reply> {
        self.send_command("lrange", vec![key.into(), start.into(), stop.into()])
            .await
    }

    // ── Scripting ──────────────────────────────────────────────────

    /// `EVAL script numkeys key [key …] arg [arg …]`.
    pub async fn eval(
        &self,
        script: impl Into<Arg>,
        keys: impl IntoIterator<Item = impl Into<Arg>>,
        args: impl IntoIterator<Item = impl Into<Arg>>,
    ) -> Result<Reply> {
        let keys: Vec<Arg> = keys.into_iter().map(Into::into).collect();
        let mut all = vec![script.into(), Arg::from(keys.len())];
        all.extend(keys);
        all.extend(args.into_iter().map(Into::into));
        self.send_command("eval", all).await
    }

    // ── Connection-level commands ──────────────────────────────────

    /// Select a database; the choice is remembered and re-applied
    /// after reconnects.
    pub async fn select(&self, db: u32) -> Result<Reply> {
        self.send_command("select", vec![Arg::from(u64::from(db))]).await
    }

    /// Authenticate. The password is retained for reconnect
    /// handshakes.
    pub async fn auth(&self, password: impl Into<String>) -> Result<Reply> {
        self.send_command("auth", vec![Arg::Text(password.into())]).await
    }

    pub async fn info(&self) -> Result<Reply> {
        self.send_command("info", vec![]).await
    }

    /// Put the server into MONITOR mode; echoed command lines arrive
    /// as [`Event::Monitor`].
    pub async fn monitor(&self) -> Result<Reply> {
        self.send_command("monitor", vec![]).await
    }

    /// Ask the server to close the connection. No reconnection is
    /// attempted afterwards.
    pub async fn quit(&self) -> Result<Reply> {
        self.send_command("quit", vec![]).await
    }

    // ── Pub/sub ────────────────────────────────────────────────────

    pub async fn publish(
        &self,
        channel: impl Into<Arg>,
        payload: impl Into<Arg>,
    ) -> Result<Reply> {
        self.send_command("publish", vec![channel.into(), payload.into()])
            .await
    }

    /// Subscribe to channels. Resolves with the first confirmed
    /// channel name; messages arrive as [`Event::Message`].
    pub async fn subscribe(
        &self,
        channels: impl IntoIterator<Item = impl Into<Arg>>,
    ) -> Result<Reply> {
        self.send_command("subscribe", collect_args(channels)).await
    }

    pub async fn unsubscribe(
        &self,
        channels: impl IntoIterator<Item = impl Into<Arg>>,
    ) -> Result<Reply> {
        self.send_command("unsubscribe", collect_args(channels)).await
    }

    pub async fn psubscribe(
        &self,
        patterns: impl IntoIterator<Item = impl Into<Arg>>,
    ) -> Result<Reply> {
        self.send_command("psubscribe", collect_args(patterns)).await
    }

    pub async fn punsubscribe(
        &self,
        patterns: impl IntoIterator<Item = impl Into<Arg>>,
    ) -> Result<Reply> {
        self.send_command("punsubscribe", collect_args(patterns)).await
    }
}

fn collect_args(items: impl IntoIterator<Item = impl Into<Arg>>) -> Vec<Arg> {
    items.into_iter().map(Into::into).collect()
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal scripted server: answers INFO with a ready payload,
    /// then sends `responses` one per subsequent read.
    async fn mock_server(responses: Vec<Vec<u8>>) -> (String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];

            // Handshake: the INFO probe.
            let n = socket.read(&mut buf).await.unwrap();
            assert!(buf[..n].windows(4).any(|w| w.eq_ignore_ascii_case(b"info")));
            let payload = "redis_version:3.2.11\r\nloading:0\r\n";
            let reply = format!("${}\r\n{}\r\n", payload.len(), payload);
            socket.write_all(reply.as_bytes()).await.unwrap();

            for response in responses {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                socket.write_all(&response).await.unwrap();
            }
            // Keep the socket open until the client goes away.
            let _ = socket.read(&mut buf).await;
        });

        (addr.ip().to_string(), addr.port())
    }

    #[tokio::test]
    async fn set_then_get() {
        let (host, port) = mock_server(vec![b"+OK\r\n$3\r\nbar\r\n".to_vec()]).await;
        let client = create_client(Endpoint::tcp(host, port), ClientOptions::default());

        // Submitted before readiness: both wait in the offline queue
        // and are flushed in order.
        let set = client.set("foo", "bar");
        let get = client.get("foo");
        let (set, get) = tokio::join!(set, get);
        assert_eq!(set.unwrap(), Reply::Simple("OK".into()));
        assert_eq!(get.unwrap(), Reply::Text("bar".into()));
    }

    #[tokio::test]
    async fn ready_event_fires() {
        let (host, port) = mock_server(vec![]).await;
        let client = create_client(Endpoint::tcp(host, port), ClientOptions::default());
        let mut events = client.events();
        loop {
            match events.recv().await.unwrap() {
                Event::Ready => break,
                Event::Error(err) => panic!("unexpected error: {err}"),
                _ => {}
            }
        }
        assert!(client.status().ready);
    }

    #[tokio::test]
    async fn send_command_after_engine_stops_is_closed() {
        let (host, port) = mock_server(vec![b"+OK\r\n".to_vec()]).await;
        let client = create_client(Endpoint::tcp(host, port), ClientOptions::default());
        client.quit().await.unwrap();
        // The engine winds down once the server closes; eventually the
        // submission channel rejects new work.
        loop {
            match client.ping().await {
                Err(RedlinkError::Closed) => break,
                Err(_) | Ok(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        }
    }
}
