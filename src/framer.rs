//! Wire framing for the persistent-websocket protocol.
//!
//! Every chunk sent over the WebSocket begins with a big-endian 16-bit header. The top two
//! bits select the kind of chunk (signal vs. data, main channel vs. jet channel); the low 14
//! bits carry `i_lsb`, the low bits of a monotonically increasing index. See spec.md §3-4.1.

use std::time::Duration;

/// Number of distinct values `i_lsb` can take; always 16384 in production.
pub const MAX_LSB: i64 = 16384;
pub const LSB_MASK: u16 = 0x3FFF;
pub const JET_BIT: u16 = 0x4000;
pub const SIGNAL_BIT: u16 = 0x8000;
pub const JET_CMD_MASK: u16 = 0xC000;

pub const SIG_ACK: u16 = 0x8010;
pub const SIG_RESEND: u16 = 0x8011;
pub const SIG_RESEND_ERROR: u16 = 0x8012;
pub const SIG_PING: u16 = 0x8020;
pub const SIG_PONG: u16 = 0x8021;

pub const MAX_SEND_BUFFER: usize = 100;
pub const ACK_EVERY: i64 = 16;
pub const ACK_TIMER: Duration = Duration::from_secs(1);
pub const RESEND_BACKOFF_INITIAL: Duration = Duration::from_secs(2);
pub const RESEND_BACKOFF_SCALING: f64 = 2.0;
pub const RESEND_BACKOFF_CAP: Duration = Duration::from_secs(30);
pub const RESEND_DEDUP_WINDOW: Duration = Duration::from_millis(500);

const _: () = assert!(MAX_LSB > MAX_SEND_BUFFER as i64 * 3, "max_lsb must bound index divergence");

/// A decoded chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classified {
    /// Application message on the main channel.
    Message { i_lsb: u16 },
    /// Application data on the jet (TCP-tunnel) channel.
    Jet { i_lsb: u16 },
    /// A jet-channel control command (`forward_to`, `disconnect`).
    JetCmd { i_lsb: u16 },
    Signal(Signal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Ack,
    Resend,
    ResendError,
    Ping,
    Pong,
    /// A header in the signal range that doesn't match a known constant.
    Unknown(u16),
}

/// Encode the header for a data chunk (main channel if `jet` is false, jet channel otherwise).
pub fn encode_data(index: i64, jet: bool) -> [u8; 2] {
    let i_lsb = (index.rem_euclid(MAX_LSB)) as u16;
    let header = i_lsb | if jet { JET_BIT } else { 0 };
    header.to_be_bytes()
}

/// Encode the header for a jet-channel command chunk.
pub fn encode_jet_cmd(index: i64) -> [u8; 2] {
    let i_lsb = (index.rem_euclid(MAX_LSB)) as u16;
    (i_lsb | JET_CMD_MASK).to_be_bytes()
}

/// Encode a fixed signal constant as its on-the-wire header.
pub fn encode_signal(sig: u16) -> [u8; 2] {
    debug_assert!(sig & SIGNAL_BIT != 0);
    sig.to_be_bytes()
}

/// Classify a 16-bit header into the kind of chunk it announces.
pub fn classify(header: u16) -> Classified {
    if header & JET_CMD_MASK == JET_CMD_MASK {
        Classified::JetCmd {
            i_lsb: header & LSB_MASK,
        }
    } else if header & SIGNAL_BIT != 0 {
        Classified::Signal(match header {
            SIG_ACK => Signal::Ack,
            SIG_RESEND => Signal::Resend,
            SIG_RESEND_ERROR => Signal::ResendError,
            SIG_PING => Signal::Ping,
            SIG_PONG => Signal::Pong,
            other => Signal::Unknown(other),
        })
    } else if header & JET_BIT != 0 {
        Classified::Jet {
            i_lsb: header & LSB_MASK,
        }
    } else {
        Classified::Message { i_lsb: header }
    }
}

/// Reconstruct a full index from its low bits, given a nearby full index.
///
/// Finds `n` such that `n.rem_euclid(w) == xx` and `(context - n).abs() <= w / 2`. Safe here
/// because `MAX_SEND_BUFFER * 3 < MAX_LSB` bounds how far sender and receiver indices can
/// plausibly diverge (spec.md §4.1).
pub fn unmod(xx: i64, context: i64, w: i64) -> i64 {
    debug_assert!(xx >= 0 && xx < w);
    let half = w / 2;
    let splitp = (context + half).rem_euclid(w);
    xx + context + half - splitp - if xx > splitp { w } else { 0 }
}

/// Reconstruct a full index from `i_lsb`, given the current context index.
pub fn expand_index(i_lsb: u16, context: i64) -> i64 {
    unmod(i_lsb as i64, context, MAX_LSB)
}
