//! Engine tunables (spec.md §4.9). Defaults match the wire constants in [`crate::framer`]
//! exactly; overriding them changes only local flow-control/retry behavior, never wire
//! compatibility, since a peer never observes another engine's `max_send_buffer` or timer values.

use crate::framer;
use clap::Args;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Args, Deserialize)]
pub struct EngineConfig {
    /// Outbound journal capacity; `send`/`jet_send` block once it is full.
    #[arg(long, default_value_t = framer::MAX_SEND_BUFFER)]
    #[serde(default = "default_max_send_buffer")]
    pub max_send_buffer: usize,

    /// Emit an ACK immediately once this many inbound chunks are unacknowledged.
    #[arg(long, default_value_t = framer::ACK_EVERY)]
    #[serde(default = "default_ack_every")]
    pub ack_every: i64,

    /// Idle-timer ACK delay.
    #[arg(long, value_parser = parse_duration_secs, default_value = "1")]
    #[serde(default = "default_ack_timer")]
    pub ack_timer: Duration,

    #[arg(long, value_parser = parse_duration_secs, default_value = "2")]
    #[serde(default = "default_resend_backoff_initial")]
    pub resend_backoff_initial: Duration,

    #[arg(long, default_value_t = framer::RESEND_BACKOFF_SCALING)]
    #[serde(default = "default_resend_backoff_scaling")]
    pub resend_backoff_scaling: f64,

    #[arg(long, value_parser = parse_duration_secs, default_value = "30")]
    #[serde(default = "default_resend_backoff_cap")]
    pub resend_backoff_cap: Duration,

    #[arg(long, value_parser = parse_duration_millis, default_value = "500")]
    #[serde(default = "default_resend_dedup_window")]
    pub resend_dedup_window: Duration,

    /// Fault-injection probability in [0, 999]; 0 disables it. Test/debug use only.
    #[arg(long, default_value_t = 0)]
    #[serde(default)]
    pub chaos: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_send_buffer: framer::MAX_SEND_BUFFER,
            ack_every: framer::ACK_EVERY,
            ack_timer: framer::ACK_TIMER,
            resend_backoff_initial: framer::RESEND_BACKOFF_INITIAL,
            resend_backoff_scaling: framer::RESEND_BACKOFF_SCALING,
            resend_backoff_cap: framer::RESEND_BACKOFF_CAP,
            resend_dedup_window: framer::RESEND_DEDUP_WINDOW,
            chaos: 0,
        }
    }
}

impl EngineConfig {
    /// Load overrides from a YAML file, falling back to defaults for any field left unset.
    pub fn from_yaml_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

fn parse_duration_secs(s: &str) -> Result<Duration, String> {
    s.parse::<u64>().map(Duration::from_secs).map_err(|e| e.to_string())
}

fn parse_duration_millis(s: &str) -> Result<Duration, String> {
    s.parse::<u64>().map(Duration::from_millis).map_err(|e| e.to_string())
}

fn default_max_send_buffer() -> usize {
    framer::MAX_SEND_BUFFER
}
fn default_ack_every() -> i64 {
    framer::ACK_EVERY
}
fn default_ack_timer() -> Duration {
    framer::ACK_TIMER
}
fn default_resend_backoff_initial() -> Duration {
    framer::RESEND_BACKOFF_INITIAL
}
fn default_resend_backoff_scaling() -> f64 {
    framer::RESEND_BACKOFF_SCALING
}
fn default_resend_backoff_cap() -> Duration {
    framer::RESEND_BACKOFF_CAP
}
fn default_resend_dedup_window() -> Duration {
    framer::RESEND_DEDUP_WINDOW
}
