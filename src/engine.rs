//! The protocol engine itself (spec.md §3-§5): framing, journal, ack/resend scheduling, the
//! connection driver, and the glue into the jet-channel TCP connector.

use crate::config::EngineConfig;
use crate::error::PwError;
use crate::framer::{self, Classified, Signal};
use crate::journal::Journal;
use crate::socket::WsTransport;
use crate::tcp_connector::{format_addr, parse_addr, TcpConnector};
use crate::timers::Timekeeper;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

fn frame_chunk(header: [u8; 2], payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + payload.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(payload);
    buf.freeze()
}

struct EngineState {
    in_index: i64,
    in_last_ack: i64,
    in_last_resend: i64,
    in_last_resend_time: Option<Instant>,
    journal: Journal,
    ack_timer: Option<Timekeeper>,
    resend_timer: Option<Timekeeper>,
    ipi_flag: bool,
    /// Sender half of the current session's outbound channel; `None` while offline. The
    /// session's driver task owns the matching receiver and the live `WsTransport`.
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    rng: u64,
}

impl EngineState {
    fn new(seed: u64) -> Self {
        Self {
            in_index: 0,
            in_last_ack: 0,
            in_last_resend: -1,
            in_last_resend_time: None,
            journal: Journal::new(),
            ack_timer: None,
            resend_timer: None,
            ipi_flag: false,
            outbound: None,
            rng: seed | 1, // xorshift64* must never be seeded with 0
        }
    }
}

struct Inner {
    log_id: String,
    config: EngineConfig,
    state: Mutex<EngineState>,
    connect_lock: Mutex<()>,
    connect_lock_held: AtomicBool,
    tcp: TcpConnector,
}

/// A handle to one protocol engine. Cheap to clone (an `Arc` inside); clones share the same
/// journal, indices, and TCP tunnel, matching "the engine must be a value with no process-wide
/// mutable state" (spec.md §9).
#[derive(Clone)]
pub struct PersistentWebsocket(Arc<Inner>);

enum DriverExit {
    Disconnected,
    /// The application dropped the message stream; tear down cleanly instead of reconnecting
    /// forever into the void (spec.md §5, "cancellation ... propagated as a recoverable
    /// condition and results in clean teardown").
    Canceled,
    Unrecoverable(PwError),
}

impl PersistentWebsocket {
    pub fn new(log_id: impl Into<String>, config: EngineConfig) -> Self {
        let log_id = log_id.into();
        let seed = log_id.bytes().fold(0x9E3779B97F4A7C15u64, |acc, b| {
            acc.wrapping_mul(0x100000001B3).wrapping_add(b as u64)
        });
        Self(Arc::new(Inner {
            tcp: TcpConnector::new(log_id.clone()),
            log_id,
            config,
            state: Mutex::new(EngineState::new(seed)),
            connect_lock: Mutex::new(()),
            connect_lock_held: AtomicBool::new(false),
        }))
    }

    pub fn log_id(&self) -> &str {
        &self.0.log_id
    }

    /// Number of outbound chunks currently buffered awaiting acknowledgement. Exposed for
    /// monitoring and tests (spec.md §8, "journal bound").
    pub async fn pending_count(&self) -> usize {
        self.0.state.lock().await.journal.len()
    }

    /// Server-role entry point: drive one socket to completion, yielding decoded application
    /// messages. Call again with a fresh socket after a disconnect to resume the same session
    /// (spec.md §4.5); `journal`/`in_index` persist across calls on the same engine.
    pub async fn connected(
        &self,
        ws: Box<dyn WsTransport>,
    ) -> UnboundedReceiverStream<Result<Bytes, PwError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = self.clone();
        tokio::spawn(async move {
            if engine.0.connect_lock_held.swap(true, Ordering::SeqCst) {
                warn!("B73301 {} connect_lock already held; waiting", engine.0.log_id);
            }
            let _guard = engine.0.connect_lock.lock().await;
            let exit = engine.run_session(ws, tx.clone()).await;
            engine.0.connect_lock_held.store(false, Ordering::SeqCst);
            if let DriverExit::Unrecoverable(e) = exit {
                let _ = tx.send(Err(e));
            }
        });
        UnboundedReceiverStream::new(rx)
    }

    /// Client-role entry point: dial `url`, and keep reconnecting (reusing the same session
    /// state) until an unrecoverable error, across however many socket lifetimes it takes.
    pub async fn connect(&self, url: String) -> UnboundedReceiverStream<Result<Bytes, PwError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = self.clone();
        tokio::spawn(async move {
            if engine.0.connect_lock_held.swap(true, Ordering::SeqCst) {
                warn!("B73301 {} connect_lock already held; waiting", engine.0.log_id);
            }
            let _guard = engine.0.connect_lock.lock().await;
            loop {
                match crate::socket::dial(&url).await {
                    Ok(ws) => match engine.run_session(Box::new(ws), tx.clone()).await {
                        DriverExit::Unrecoverable(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                        DriverExit::Canceled => break,
                        DriverExit::Disconnected => {
                            debug!("B60441 {} socket closed, reconnecting", engine.0.log_id);
                        }
                    },
                    Err(e) => {
                        debug!("B60442 {} failed to dial {url}: {e}", engine.0.log_id);
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            engine.0.connect_lock_held.store(false, Ordering::SeqCst);
        });
        UnboundedReceiverStream::new(rx)
    }

    /// Attach `ws` and start driving it immediately, without the `connect_lock`/reconnect
    /// ceremony `connected`/`connect` wrap around this. Exposed for tests that want to exercise
    /// one socket lifetime directly (spec.md §6).
    pub async fn set_online_mode(
        &self,
        ws: Box<dyn WsTransport>,
    ) -> UnboundedReceiverStream<Result<Bytes, PwError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = self.clone();
        tokio::spawn(async move {
            let exit = engine.run_session(ws, tx.clone()).await;
            if let DriverExit::Unrecoverable(e) = exit {
                let _ = tx.send(Err(e));
            }
        });
        UnboundedReceiverStream::new(rx)
    }

    /// Drop the current socket (if any). The running driver task notices its outbound channel
    /// closed and its next `recv_bytes` fails, and tears itself down.
    pub async fn set_offline_mode(&self) {
        let mut st = self.0.state.lock().await;
        st.outbound = None;
        st.ack_timer = None;
        st.resend_timer = None;
    }

    async fn run_session(
        &self,
        mut ws: Box<dyn WsTransport>,
        tx: mpsc::UnboundedSender<Result<Bytes, PwError>>,
    ) -> DriverExit {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
        let (in_index, need_ack_timer) = {
            let mut st = self.0.state.lock().await;
            st.outbound = Some(out_tx);
            // Mirror set_online_mode()'s attach sequence: re-arm both timers for whatever
            // survived the previous socket (spec.md §4.5's Offline->Online transition).
            self.arm_resend_timer(&mut st);
            (st.in_index, st.in_index > st.in_last_ack)
        };
        if need_ack_timer {
            self.arm_ack_timer().await;
        }
        // First protocol action on a fresh socket: ask for whatever we might have missed.
        self.maybe_emit_resend(in_index).await;

        let chaos_notify = Arc::new(tokio::sync::Notify::new());
        let exit = loop {
            tokio::select! {
                biased;
                _ = chaos_notify.notified() => {
                    info!("B88201 {} chaos: closing socket", self.0.log_id);
                    break DriverExit::Disconnected;
                }
                _ = tx.closed() => {
                    info!("B88202 {} message stream dropped, canceling", self.0.log_id);
                    break DriverExit::Canceled;
                }
                maybe = out_rx.recv() => {
                    match maybe {
                        Some(chunk) => {
                            if let Err(e) = ws.send_bytes(chunk).await {
                                debug!("B60443 {} send failed: {e}", self.0.log_id);
                                break DriverExit::Disconnected;
                            }
                            self.maybe_trigger_chaos(&chaos_notify).await;
                        }
                        None => break DriverExit::Disconnected,
                    }
                }
                inbound = ws.recv_bytes() => {
                    match inbound {
                        Ok(Some(bytes)) => {
                            if let Err(e) = self.process_inbound(bytes, &tx).await {
                                break DriverExit::Unrecoverable(e);
                            }
                            self.maybe_trigger_chaos(&chaos_notify).await;
                        }
                        Ok(None) => break DriverExit::Disconnected,
                        Err(e) => {
                            debug!("B60444 {} recv failed: {e}", self.0.log_id);
                            break DriverExit::Disconnected;
                        }
                    }
                }
            }
        };
        // Flush anything already queued (e.g. a RESEND-ERROR emitted in the same inbound handler
        // that just broke the loop) before the socket goes away under it.
        while let Ok(chunk) = out_rx.try_recv() {
            let _ = ws.send_bytes(chunk).await;
        }
        self.set_offline_mode().await;
        let _ = ws.close().await;
        exit
    }

    async fn maybe_trigger_chaos(&self, notify: &Arc<tokio::sync::Notify>) {
        let chaos = self.0.config.chaos;
        if chaos == 0 {
            return;
        }
        fn next(rng: &mut u64) -> u64 {
            *rng ^= *rng << 13;
            *rng ^= *rng >> 7;
            *rng ^= *rng << 17;
            *rng
        }
        let (roll, delay_ms) = {
            let mut st = self.0.state.lock().await;
            let roll = (next(&mut st.rng) % 1000) as u16;
            // independent draw: spec.md's "small delay (0-3s)" must not be bounded by `roll`,
            // whose own range (< chaos <= 999) would otherwise cap it near 1s (Python draws
            // `random.randint(0, 3)` seconds, unrelated to the chaos-probability roll).
            let delay_ms = next(&mut st.rng) % 3000;
            (roll, delay_ms)
        };
        if roll < chaos {
            let notify = notify.clone();
            let delay = Duration::from_millis(delay_ms);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                notify.notify_one();
            });
        }
    }

    // ---- outbound: application API -------------------------------------------------------

    /// Enqueue an application message on the main channel. Suspends while the journal is full
    /// (flow control, spec.md §4.3).
    pub async fn send(&self, data: impl Into<Bytes>) {
        self.send_on_channel(data.into(), false).await;
    }

    /// Enqueue data on the jet (TCP-tunnel) channel. Same flow control as `send`.
    pub async fn jet_send(&self, data: impl Into<Bytes>) {
        self.send_on_channel(data.into(), true).await;
    }

    async fn send_on_channel(&self, data: Bytes, jet: bool) {
        let mut backoff = Duration::from_secs(1);
        loop {
            let mut st = self.0.state.lock().await;
            if st.journal.len() < self.0.config.max_send_buffer {
                let index = st.journal.next_index();
                let header = framer::encode_data(index, jet);
                let chunk = frame_chunk(header, &data);
                st.journal.push(chunk.clone());
                self.arm_resend_timer(&mut st);
                if let Some(out) = st.outbound.as_ref() {
                    let _ = out.send(chunk);
                }
                return;
            }
            drop(st);
            tokio::time::sleep(backoff).await;
            backoff = (backoff + Duration::from_secs(1)).min(Duration::from_secs(30));
        }
    }

    /// Emit a PING; any PONG reply is consumed internally by the driver loop.
    pub async fn ping(&self, data: impl Into<Bytes>) {
        let data = data.into();
        let st = self.0.state.lock().await;
        if let Some(out) = st.outbound.as_ref() {
            let _ = out.send(frame_chunk(framer::encode_signal(framer::SIG_PING), &data));
        }
    }

    async fn send_jet_command(&self, text: &str) {
        let st = self.0.state.lock().await;
        if let Some(out) = st.outbound.as_ref() {
            let chunk = frame_chunk(framer::encode_jet_cmd(0), text.as_bytes());
            let _ = out.send(chunk);
        }
    }

    pub(crate) async fn send_tcp_connect(&self, host: &str, port: u16) {
        self.send_jet_command(&format!("forward_to {}", format_addr(host, port))).await;
    }

    pub(crate) async fn send_tcp_disconnect(&self) {
        self.send_jet_command("disconnect").await;
    }

    /// Peer-side consent to open outbound TCP connections requested via `forward_to`.
    pub fn allow_port_forwarding(&self, allowed: bool) {
        self.0.tcp.allow_port_forwarding(allowed);
    }

    /// Host-side tunnel setup: listen, remember where the peer should forward to, run
    /// `exec_args` to completion, then stop listening (spec.md §4.6).
    pub async fn exec_and_forward_tcp(
        &self,
        exec_args: &[String],
        host_addr: &str,
        host_port: u16,
        peer_addr: &str,
        peer_port: u16,
    ) -> anyhow::Result<()> {
        self.0
            .tcp
            .exec_and_forward_tcp(self, exec_args, host_addr, host_port, peer_addr, peer_port)
            .await
    }

    // ---- resend timer ----------------------------------------------------------------------

    fn arm_resend_timer(&self, st: &mut EngineState) {
        if st.resend_timer.is_some() || st.journal.is_empty() {
            return;
        }
        let engine = self.clone();
        let cfg = &self.0.config;
        st.resend_timer = Some(Timekeeper::exponential(
            cfg.resend_backoff_initial,
            cfg.resend_backoff_scaling,
            cfg.resend_backoff_cap,
            move || {
                let engine = engine.clone();
                async move { engine.resend_timer_fire().await }
            },
        ));
    }

    async fn resend_timer_fire(&self) {
        let (oldest, out) = {
            let st = self.0.state.lock().await;
            (st.journal.oldest().map(|c| c.bytes.clone()), st.outbound.clone())
        };
        if let (Some(chunk), Some(out)) = (oldest, out) {
            let _ = out.send(chunk);
        }
    }

    fn disarm_resend_timer_if_empty(&self, st: &mut EngineState) {
        if st.journal.is_empty() {
            st.resend_timer = None;
        }
    }

    // ---- acknowledgement scheduling ---------------------------------------------------------

    async fn arm_ack_timer(&self) {
        let mut st = self.0.state.lock().await;
        if st.ack_timer.is_some() {
            return;
        }
        let engine = self.clone();
        st.ack_timer = Some(Timekeeper::once(self.0.config.ack_timer, move || {
            let engine = engine.clone();
            async move { engine.ack_timer_fire().await }
        }));
    }

    async fn ack_timer_fire(&self) {
        let in_index = {
            let mut st = self.0.state.lock().await;
            st.ack_timer = None;
            st.in_index
        };
        self.emit_ack(in_index).await;
    }

    async fn emit_ack(&self, index: i64) {
        let mut st = self.0.state.lock().await;
        st.ack_timer = None;
        st.in_last_ack = index;
        let payload = (index.rem_euclid(framer::MAX_LSB) as u16).to_be_bytes();
        if let Some(out) = st.outbound.as_ref() {
            let _ = out.send(frame_chunk(framer::encode_signal(framer::SIG_ACK), &payload));
        }
    }

    async fn emit_resend(&self, index: i64) {
        let st = self.0.state.lock().await;
        let payload = (index.rem_euclid(framer::MAX_LSB) as u16).to_be_bytes();
        if let Some(out) = st.outbound.as_ref() {
            let _ = out.send(frame_chunk(framer::encode_signal(framer::SIG_RESEND), &payload));
        }
    }

    /// Emit a RESEND for `expected`, throttled: suppress a duplicate for the same index within
    /// `resend_dedup_window` (spec.md §3, §8). Every call site that asks the peer to resend
    /// (the inbound-gap branch, and the attach-time "ask for whatever we missed") must go
    /// through this rather than `emit_resend` directly, mirroring the Python original's
    /// `_send_resend()` applying the same check unconditionally at every call site.
    async fn maybe_emit_resend(&self, expected: i64) {
        let mut st = self.0.state.lock().await;
        let throttled = st.in_last_resend == expected
            && st
                .in_last_resend_time
                .is_some_and(|t| t.elapsed() < self.0.config.resend_dedup_window);
        if throttled {
            return;
        }
        st.in_last_resend = expected;
        st.in_last_resend_time = Some(Instant::now());
        drop(st);
        self.emit_resend(expected).await;
    }

    async fn emit_resend_error(&self) {
        let st = self.0.state.lock().await;
        if let Some(out) = st.outbound.as_ref() {
            let _ = out.send(frame_chunk(framer::encode_signal(framer::SIG_RESEND_ERROR), &[]));
        }
    }

    // ---- inbound processing (spec.md §4.2) --------------------------------------------------

    async fn process_inbound(
        &self,
        raw: Bytes,
        tx: &mpsc::UnboundedSender<Result<Bytes, PwError>>,
    ) -> Result<(), PwError> {
        if raw.len() < 2 {
            warn!("B40601 {} chunk shorter than header, dropping", self.0.log_id);
            return Ok(());
        }
        let header = u16::from_be_bytes([raw[0], raw[1]]);
        let payload = raw.slice(2..);
        let classified = framer::classify(header);

        {
            let mut st = self.0.state.lock().await;
            if st.ipi_flag {
                drop(st);
                warn!("B40602 {} reentrant process_inbound, dropping chunk", self.0.log_id);
                tokio::time::sleep(Duration::from_millis(10)).await;
                return Ok(());
            }
            st.ipi_flag = true;
        }
        let result = self.process_inbound_inner(classified, payload, tx).await;
        self.0.state.lock().await.ipi_flag = false;
        result
    }

    async fn process_inbound_inner(
        &self,
        classified: Classified,
        payload: Bytes,
        tx: &mpsc::UnboundedSender<Result<Bytes, PwError>>,
    ) -> Result<(), PwError> {
        match classified {
            Classified::Message { i_lsb } => self.process_indexed(i_lsb, payload, false, tx).await,
            Classified::Jet { i_lsb } => self.process_indexed(i_lsb, payload, true, tx).await,
            Classified::JetCmd { .. } => {
                self.handle_jet_command(&payload).await;
                Ok(())
            }
            Classified::Signal(sig) => self.handle_signal(sig, payload).await,
        }
    }

    async fn process_indexed(
        &self,
        i_lsb: u16,
        payload: Bytes,
        is_jet: bool,
        tx: &mpsc::UnboundedSender<Result<Bytes, PwError>>,
    ) -> Result<(), PwError> {
        let mut st = self.0.state.lock().await;
        let full = framer::expand_index(i_lsb, st.in_index);
        if full == st.in_index {
            st.in_index += 1;
            let in_index = st.in_index;
            let last_ack = st.in_last_ack;
            drop(st);

            if is_jet {
                self.0.tcp.write(payload).await;
            } else {
                let _ = tx.send(Ok(payload));
            }

            if in_index - last_ack >= self.0.config.ack_every {
                self.emit_ack(in_index).await;
            } else {
                self.arm_ack_timer().await;
            }
        } else if full > st.in_index {
            let expected = st.in_index;
            drop(st);
            self.maybe_emit_resend(expected).await;
        } else {
            debug!(
                "B40603 {} duplicate chunk index {full} < in_index {}",
                self.0.log_id, st.in_index
            );
        }
        Ok(())
    }

    async fn handle_jet_command(&self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        let mut parts = text.trim().splitn(2, ' ');
        match parts.next() {
            Some("forward_to") => match parts.next().map(str::trim) {
                Some(addr) => match parse_addr(addr, 0) {
                    Ok((host, port)) => self.0.tcp.open_peer_connection(self, &host, port).await,
                    Err(e) => warn!("B60445 {} bad forward_to address {addr:?}: {e}", self.0.log_id),
                },
                None => warn!("B60446 {} forward_to with no address", self.0.log_id),
            },
            Some("disconnect") => self.0.tcp.close().await,
            Some(other) => warn!("B60447 {} unknown jet command {other:?}", self.0.log_id),
            None => {}
        }
    }

    async fn handle_signal(&self, sig: Signal, payload: Bytes) -> Result<(), PwError> {
        match sig {
            Signal::Ack | Signal::Resend => {
                if payload.len() < 2 {
                    warn!("B60448 {} ack/resend signal with no payload", self.0.log_id);
                    return Ok(());
                }
                let i_lsb = u16::from_be_bytes([payload[0], payload[1]]);
                let mut st = self.0.state.lock().await;
                let ack_index = framer::expand_index(i_lsb, st.journal.next_index());
                st.resend_timer = None; // cancel on every received ACK/RESEND (spec.md §9)

                if st.journal.prune_to(ack_index).is_err() {
                    drop(st);
                    self.emit_resend_error().await;
                    return Err(PwError::unrecoverable(
                        self.0.log_id.clone(),
                        format!("peer acked/requested impossible index {ack_index}"),
                    ));
                }

                if matches!(sig, Signal::Resend) {
                    let head = st.journal.next_index();
                    let chunks = st.journal.resend_range(ack_index, head).unwrap_or_default();
                    let out = st.outbound.clone();
                    drop(st);
                    if let Some(out) = out {
                        for chunk in chunks {
                            let _ = out.send(chunk);
                        }
                    }
                    let mut st = self.0.state.lock().await;
                    self.arm_resend_timer(&mut st);
                } else {
                    self.disarm_resend_timer_if_empty(&mut st);
                    self.arm_resend_timer(&mut st);
                }
                Ok(())
            }
            Signal::ResendError => Err(PwError::unrecoverable(
                self.0.log_id.clone(),
                "peer sent RESEND-ERROR: it cannot reconstruct the stream",
            )),
            Signal::Ping => {
                let st = self.0.state.lock().await;
                if let Some(out) = st.outbound.as_ref() {
                    let _ = out.send(frame_chunk(framer::encode_signal(framer::SIG_PONG), &payload));
                }
                Ok(())
            }
            Signal::Pong => Ok(()),
            Signal::Unknown(code) => {
                warn!("B60449 {} unknown signal header {code:#06x}", self.0.log_id);
                Ok(())
            }
        }
    }
}
