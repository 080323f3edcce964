//! The jet channel's TCP tunneling logic (spec.md §4.6).
//!
//! `TcpConnector` bridges exactly one TCP flow through the jet channel. The *host* listens on a
//! local port and, when a client dials it, tells the *peer* (over a `forward_to` jet command) to
//! open an outbound TCP connection to the real destination. Data then flows as jet-channel
//! chunks in both directions. At most one `ActiveTcpConnection` exists at a time; a second
//! inbound TCP connection to the host listener is refused immediately.

use crate::engine::PersistentWebsocket;
use anyhow::{anyhow, Context};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Parse an address of the form `host`, `host:port`, `[ipv6]`, or `[ipv6]:port`. `default_port`
/// is used when the input names no port.
pub fn parse_addr(input: &str, default_port: u16) -> anyhow::Result<(String, u16)> {
    let (host, port_str) = if let Some(rest) = input.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| anyhow!("unterminated '[' in address {input:?}"))?;
        let host = rest[..end].to_string();
        let after = &rest[end + 1..];
        (host, after.strip_prefix(':').unwrap_or("").to_string())
    } else if let Some((h, p)) = input.rsplit_once(':') {
        (h.to_string(), p.to_string())
    } else {
        (input.to_string(), String::new())
    };
    let port = if port_str.is_empty() {
        default_port
    } else {
        port_str
            .parse::<u16>()
            .with_context(|| format!("invalid port in address {input:?}"))?
    };
    Ok((host, port))
}

/// Format `(host, port)` back into the grammar `parse_addr` accepts, bracketing IPv6 literals.
pub fn format_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Render binary data as mixed hex/quoted-ascii for log messages (spec.md §6: "never logs
/// payload bodies beyond a hex dump helper").
pub fn printable_hex(chunk: &[u8]) -> String {
    fn flush(quote: &mut String, out: &mut String) {
        if quote.is_empty() {
            return;
        }
        if quote.chars().count() <= 3 {
            for c in quote.chars() {
                out.push_str(&format!("{:02X} ", c as u32));
            }
        } else {
            out.push('\'');
            out.push_str(quote);
            out.push_str("' ");
        }
        quote.clear();
    }

    let mut out = String::new();
    let mut quote = String::new();
    for &b in chunk {
        if (32..=126).contains(&b) && b != 39 {
            quote.push(b as char);
        } else {
            flush(&mut quote, &mut out);
            out.push_str(&format!("{:02X} ", b));
        }
    }
    flush(&mut quote, &mut out);
    out.trim_end().to_string()
}

/// One active TCP connection bridged to the jet channel, host- or peer-side.
pub struct ActiveTcpConnection {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    reader_task: JoinHandle<()>,
}

impl ActiveTcpConnection {
    fn spawn(
        log_id: String,
        stream: TcpStream,
        engine: PersistentWebsocket,
        active_slot: Arc<Mutex<Option<ActiveTcpConnection>>>,
    ) -> Self {
        let (mut read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));
        let reader_task = tokio::spawn(async move {
            let mut buf = [0u8; 16 * 1024];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        engine.jet_send(Bytes::copy_from_slice(&buf[..n])).await;
                    }
                }
            }
            debug!("B33276 {log_id} TCP connection lost");
            active_slot.lock().await.take();
            engine.send_tcp_disconnect().await;
        });
        Self { writer, reader_task }
    }

    pub async fn write(&self, data: Bytes) {
        let mut w = self.writer.lock().await;
        let _ = w.write_all(&data).await;
    }

    /// Close without notifying the peer; used when the close was already requested by the peer.
    pub fn close_silently(&self) {
        self.reader_task.abort();
        let writer = self.writer.clone();
        tokio::spawn(async move {
            let _ = writer.lock().await.shutdown().await;
        });
    }
}

/// Owns the optional TCP tunnel for one engine: a listener (host role) or an outbound
/// connector (peer role), singleton active connection, and forwarding permission.
pub struct TcpConnector {
    log_id: String,
    allow_port_forwarding: AtomicBool,
    role_is_host: AtomicBool,
    peer_destination: Mutex<Option<(String, u16)>>,
    active: Arc<Mutex<Option<ActiveTcpConnection>>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpConnector {
    pub fn new(log_id: String) -> Self {
        Self {
            log_id,
            allow_port_forwarding: AtomicBool::new(false), // denied by default, for security
            role_is_host: AtomicBool::new(false),
            peer_destination: Mutex::new(None),
            active: Arc::new(Mutex::new(None)),
            listener_task: Mutex::new(None),
        }
    }

    pub fn allow_port_forwarding(&self, allowed: bool) {
        self.allow_port_forwarding.store(allowed, Ordering::SeqCst);
    }

    /// Start listening on `host_addr:host_port`, remember where the peer should forward to, run
    /// `exec_args` to completion, then stop listening. Mirrors `exec_and_forward_tcp` (spec.md §4.6).
    pub async fn exec_and_forward_tcp(
        &self,
        engine: &PersistentWebsocket,
        exec_args: &[String],
        host_addr: &str,
        host_port: u16,
        peer_addr: &str,
        peer_port: u16,
    ) -> anyhow::Result<()> {
        self.role_is_host.store(true, Ordering::SeqCst);
        *self.peer_destination.lock().await = Some((peer_addr.to_string(), peer_port));

        let listener = TcpListener::bind((host_addr, host_port))
            .await
            .with_context(|| format!("failed to bind {host_addr}:{host_port}"))?;
        let log_id = self.log_id.clone();
        let engine_for_accept = engine.clone();
        let active = self.active.clone();
        let peer_destination = {
            let guard = self.peer_destination.lock().await;
            guard.clone().expect("just set above")
        };
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(ok) => ok,
                    Err(_) => break,
                };
                accept_one(
                    log_id.clone(),
                    stream,
                    peer,
                    engine_for_accept.clone(),
                    active.clone(),
                    peer_destination.clone(),
                )
                .await;
            }
        });
        *self.listener_task.lock().await = Some(accept_task);

        let mut cmd = Command::new(&exec_args[0]);
        cmd.args(&exec_args[1..]);
        let output = cmd.output().await.with_context(|| format!("failed to run {exec_args:?}"))?;
        if !output.stdout.is_empty() || !output.stderr.is_empty() {
            info!(
                "B19653 {} output of {:?}: {}{}",
                self.log_id,
                exec_args,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr),
            );
        }

        if let Some(task) = self.listener_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }

    /// Peer-side: dial `(addr, port)` if forwarding is allowed and we are not the host.
    pub async fn open_peer_connection(&self, engine: &PersistentWebsocket, addr: &str, port: u16) {
        if !self.allow_port_forwarding.load(Ordering::SeqCst) || self.role_is_host.load(Ordering::SeqCst) {
            return; // not permitted, or we are the host: do nothing
        }
        let stream = match TcpStream::connect((addr, port)).await {
            Ok(s) => s,
            Err(e) => {
                warn!("B99176 {} failed to connect to {addr}:{port}: {e}", self.log_id);
                return;
            }
        };
        let mut slot = self.active.lock().await;
        if slot.is_some() {
            drop(stream); // jet channel is singleton; refuse a second connection
            return;
        }
        *slot = Some(ActiveTcpConnection::spawn(
            self.log_id.clone(),
            stream,
            engine.clone(),
            self.active.clone(),
        ));
    }

    /// Forward jet-channel data to the active TCP connection, if any.
    pub async fn write(&self, data: Bytes) {
        if let Some(conn) = self.active.lock().await.as_ref() {
            conn.write(data).await;
        }
    }

    /// Close the active TCP connection (host keeps its listener open; peer just drops the
    /// outbound socket). Does not re-announce `disconnect` (spec.md §4.2).
    pub async fn close(&self) {
        if let Some(conn) = self.active.lock().await.take() {
            debug!("B54010 {} closing TCP connection", self.log_id);
            conn.close_silently();
        }
    }
}

async fn accept_one(
    log_id: String,
    stream: TcpStream,
    peer: SocketAddr,
    engine: PersistentWebsocket,
    active: Arc<Mutex<Option<ActiveTcpConnection>>>,
    peer_destination: (String, u16),
) {
    debug!("B40828 {log_id} TCP connection from {peer}");
    let mut slot = active.lock().await;
    if slot.is_some() {
        drop(stream); // at most one connection because there is one jet channel
        return;
    }
    *slot = Some(ActiveTcpConnection::spawn(log_id, stream, engine.clone(), active.clone()));
    drop(slot);
    engine.send_tcp_connect(&peer_destination.0, peer_destination.1).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_host() {
        let (h, p) = parse_addr("example.org", 0).unwrap();
        assert_eq!((h.as_str(), p), ("example.org", 0));
    }

    #[test]
    fn parse_host_port() {
        let (h, p) = parse_addr("example.org:80", 0).unwrap();
        assert_eq!((h.as_str(), p), ("example.org", 80));
    }

    #[test]
    fn parse_ipv4_with_port() {
        let (h, p) = parse_addr("192.168.100.99:8888", 0).unwrap();
        assert_eq!((h.as_str(), p), ("192.168.100.99", 8888));
    }

    #[test]
    fn parse_bracketed_ipv6() {
        let (h, p) = parse_addr("[fe80::d4a8:6435:f54c:1f4e]", 0).unwrap();
        assert_eq!((h.as_str(), p), ("fe80::d4a8:6435:f54c:1f4e", 0));
        let (h, p) = parse_addr("[fe80::d4a8:6435:f54c:1f4e]:995", 0).unwrap();
        assert_eq!((h.as_str(), p), ("fe80::d4a8:6435:f54c:1f4e", 995));
        let (h, p) = parse_addr("[::1]", 0).unwrap();
        assert_eq!((h.as_str(), p), ("::1", 0));
        let (h, p) = parse_addr("[::1]:22", 0).unwrap();
        assert_eq!((h.as_str(), p), ("::1", 22));
    }

    #[test]
    fn parse_uses_default_port() {
        let (h, p) = parse_addr("example.org", 443).unwrap();
        assert_eq!((h.as_str(), p), ("example.org", 443));
        let (h, p) = parse_addr("[::1]", 443).unwrap();
        assert_eq!((h.as_str(), p), ("::1", 443));
        let (h, p) = parse_addr("[::1]:8443", 443).unwrap();
        assert_eq!((h.as_str(), p), ("::1", 8443));
    }

    #[test]
    fn format_round_trips() {
        assert_eq!(format_addr("example.org", 80), "example.org:80");
        assert_eq!(format_addr("10.80.80.205", 1234), "10.80.80.205:1234");
        assert_eq!(
            format_addr("fe80::d4a8:6435:f54c:1f4e", 22),
            "[fe80::d4a8:6435:f54c:1f4e]:22"
        );
    }

    #[test]
    fn printable_hex_matches_reference() {
        let input: Vec<u8> = "1234\x0056789\x01\x02abcd\nefg\nhi\nhello\n\n\
                               hello\n\n\nshouldn't \\ backslash"
            .bytes()
            .chain([0xe2, 0x9c, 0x94])
            .chain(" done\n".bytes())
            .collect();
        let expected = "'1234' 00 '56789' 01 02 'abcd' 0A 65 66 67 0A 68 69 0A 'hello' 0A 0A \
                         'hello' 0A 0A 0A 'shouldn' 27 't \\ backslash' E2 9C 94 ' done' 0A";
        assert_eq!(printable_hex(&input), expected);
    }
}
