use serde::Serialize;
use std::fmt;

/// Position of a tracked connection in its lifecycle.
///
/// A connection with no entry in its remote's session map is unborn (or
/// closed); every stored session is in exactly one of these phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    SynSent,
    SynAcked,
    Established,
    /// A request went out and its response has not finished arriving.
    PshOut,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Per-connection state, keyed by local ephemeral port inside a remote.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionState {
    pub remote_address: String,
    /// Unset for connections that were already open when the capture started.
    pub syn_ts: Option<f64>,
    pub established_ts: Option<f64>,
    pub phase: Phase,
    pub datagram_out_ts: Option<f64>,
    /// Request/response rounds seen on this connection.
    pub round_trips: u64,
    pub local_sequence: u32,
    pub remote_sequence: u32,
    pub last_seen_ts: f64,
}

impl SessionState {
    /// A connection opened by a SYN we observed.
    pub fn from_syn(remote_address: &str, syn_ts: f64, local_sequence: u32) -> Self {
        Self {
            remote_address: remote_address.to_string(),
            syn_ts: Some(syn_ts),
            established_ts: None,
            phase: Phase::SynSent,
            datagram_out_ts: None,
            round_trips: 0,
            local_sequence,
            remote_sequence: 0,
            last_seen_ts: syn_ts,
        }
    }

    /// A connection first seen through an outgoing push, opened before the capture began.
    pub fn from_push(remote_address: &str, push_ts: f64, local_sequence: u32) -> Self {
        Self {
            remote_address: remote_address.to_string(),
            syn_ts: None,
            established_ts: None,
            phase: Phase::Established,
            datagram_out_ts: None,
            round_trips: 0,
            local_sequence,
            remote_sequence: 0,
            last_seen_ts: push_ts,
        }
    }

    pub fn is_untracked(&self) -> bool {
        self.syn_ts.is_none()
    }

    /// True once the handshake is over, or if it happened before we were watching.
    pub fn is_established(&self) -> bool {
        matches!(self.phase, Phase::Established | Phase::PshOut)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} - rt: {} loc_seq: {}, rem_seq: {}",
            self.remote_address, self.phase, self.round_trips, self.local_sequence, self.remote_sequence
        )
    }
}
