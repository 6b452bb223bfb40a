//! Per-remote connection tracking.
//!
//! A [RemoteTarget] owns every session opened towards one resolved remote
//! and the metrics those sessions feed. All mutation goes through
//! [RemoteTarget::handle], which runs the sequence gate and then dispatches on
//! the packet's flags.
use super::containers::{NormalizedPacket, TcpFlag};
use super::metrics::{Counter, Histogram, HistogramSummary, Meter, MeterSummary};
use super::session::{Phase, SessionState};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Pushes at least this large are treated as one segment of a longer message.
pub const FRAGMENT_THRESHOLD: u32 = 1400;

/// Outcome of feeding one packet to a remote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Dispatch {
    /// A state transition worth reporting.
    Notable,
    /// A large segment; the logical message is not complete yet.
    Fragment,
    /// Nothing to learn from this packet.
    Ignored,
    /// Flag seen in a phase that does not allow it. Counted as an error.
    ProtocolError,
    /// Ack did not match the recorded sequence; the session was dropped.
    SequenceMismatch,
    /// The remote is not whitelisted.
    Rejected,
}

impl Dispatch {
    pub fn is_notable(&self) -> bool {
        *self == Dispatch::Notable
    }
}

fn millis_between(start: f64, end: f64) -> f64 {
    (end - start) * 1000.0
}

/// Connection lifecycle and latency metrics for one remote host.
#[derive(Debug)]
pub struct RemoteTarget {
    hostname: String,
    sessions: HashMap<u16, SessionState>,
    syn_counter: Meter,
    syn_ack_counter: Meter,
    established_counter: Meter,
    resets_counter: Meter,
    fin_in_counter: Meter,
    fin_out_counter: Meter,
    outgoing_packets: Meter,
    incoming_packets: Meter,
    errors_counter: Counter,
    retransmits_counter: Counter,
    expired_counter: Counter,
    connection_time: Histogram,
    transport_time: Histogram,
    rounds_per_connection: Histogram,
    last_seen: Option<f64>,
}

impl RemoteTarget {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            sessions: HashMap::new(),
            syn_counter: Meter::new(),
            syn_ack_counter: Meter::new(),
            established_counter: Meter::new(),
            resets_counter: Meter::new(),
            fin_in_counter: Meter::new(),
            fin_out_counter: Meter::new(),
            outgoing_packets: Meter::new(),
            incoming_packets: Meter::new(),
            errors_counter: Counter::new(),
            retransmits_counter: Counter::new(),
            expired_counter: Counter::new(),
            connection_time: Histogram::new(),
            transport_time: Histogram::new(),
            rounds_per_connection: Histogram::new(),
            last_seen: None,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Runs the sequence gate, then the handler for the packet's flags.
    pub fn handle(&mut self, packet: &NormalizedPacket) -> Dispatch {
        self.last_seen = Some(packet.timestamp);
        if !self.verify_and_track_seq(packet) {
            return Dispatch::SequenceMismatch;
        }

        log::debug!("Packet action identifier {}", packet.flag);
        match packet.flag {
            TcpFlag::Syn => self.process_syn(packet),
            TcpFlag::SynAck => self.process_syn_ack(packet),
            TcpFlag::Ack => self.process_ack(packet),
            TcpFlag::Psh | TcpFlag::PshAck => self.process_psh(packet),
            TcpFlag::PshAckFin => {
                let pushed = self.process_psh(packet);
                // More segments follow a fragment, so the FIN waits for the last one.
                if pushed == Dispatch::Fragment {
                    return pushed;
                }
                let finished = self.process_fin(packet);
                if finished.is_notable() {
                    Dispatch::Notable
                } else {
                    pushed
                }
            }
            TcpFlag::FinAck | TcpFlag::Fin => self.process_fin(packet),
            TcpFlag::Rst | TcpFlag::RstAck => self.process_rst(packet),
            TcpFlag::Other(_) => Dispatch::Ignored,
        }
    }

    /// Checks the packet's ack against the sequence it acknowledges.
    ///
    /// Inbound packets acknowledge our local sequence, outbound ones the
    /// remote's. A mismatch means the capture most likely lost packets, so
    /// the session is dropped and picked up again on the next SYN. SYNs and
    /// packets without a session always pass.
    pub fn verify_and_track_seq(&mut self, packet: &NormalizedPacket) -> bool {
        if packet.flag == TcpFlag::Syn {
            return true;
        }

        let port = packet.ephemeral_port();
        let Some(state) = self.sessions.get_mut(&port) else {
            return true;
        };

        let expected = if packet.is_outgoing() {
            state.remote_sequence
        } else {
            state.local_sequence
        };

        if packet.ack == expected || packet.ack == expected.wrapping_add(1) {
            state.last_seen_ts = packet.timestamp;
            if !packet.is_ack_only() {
                if packet.is_outgoing() {
                    state.local_sequence = packet.sequence;
                } else {
                    state.remote_sequence = packet.sequence;
                }
            }
            return true;
        }

        log::debug!("SEQ verification failed for packet {packet} during state {state}");
        self.errors_counter.increment();
        self.sessions.remove(&port);
        false
    }

    fn process_syn(&mut self, packet: &NormalizedPacket) -> Dispatch {
        let port = packet.ephemeral_port();
        match self.sessions.get(&port) {
            None => {
                self.sessions.insert(
                    port,
                    SessionState::from_syn(packet.remote_address(), packet.timestamp, packet.sequence),
                );
                self.syn_counter.notify(1);
                Dispatch::Notable
            }
            Some(state) => {
                // The existing session is kept; only a FIN or RST clears it.
                if state.phase == Phase::SynSent && state.local_sequence == packet.sequence {
                    self.retransmits_counter.increment();
                }
                log::warn!("Unexpected SYN in state {state} for packet {packet}");
                self.errors_counter.increment();
                Dispatch::ProtocolError
            }
        }
    }

    fn process_syn_ack(&mut self, packet: &NormalizedPacket) -> Dispatch {
        let Some(state) = self.sessions.get_mut(&packet.ephemeral_port()) else {
            // Handshake started before the capture did.
            return Dispatch::Ignored;
        };

        if state.phase == Phase::SynSent {
            state.phase = Phase::SynAcked;
            self.syn_ack_counter.notify(1);
            Dispatch::Notable
        } else {
            log::warn!("Unexpected SYN-ACK in state {state} for packet {packet}");
            self.errors_counter.increment();
            Dispatch::ProtocolError
        }
    }

    fn process_ack(&mut self, packet: &NormalizedPacket) -> Dispatch {
        let Some(state) = self.sessions.get_mut(&packet.ephemeral_port()) else {
            return Dispatch::Ignored;
        };

        // Outside the handshake a bare ACK tells us nothing the gate did not already use.
        if state.phase != Phase::SynAcked {
            return Dispatch::Ignored;
        }

        state.phase = Phase::Established;
        state.established_ts = Some(packet.timestamp);
        if let Some(syn_ts) = state.syn_ts {
            self.connection_time.notify(millis_between(syn_ts, packet.timestamp));
        }
        self.established_counter.notify(1);
        Dispatch::Notable
    }

    fn process_psh(&mut self, packet: &NormalizedPacket) -> Dispatch {
        let port = packet.ephemeral_port();

        if packet.is_outgoing() {
            let state = self.sessions.entry(port).or_insert_with(|| {
                log::debug!("Tracking pre-existing connection on port {port}");
                SessionState::from_push(packet.remote_address(), packet.timestamp, packet.sequence)
            });

            if !state.is_established() {
                log::warn!("Unexpected outgoing push in state {state} for packet {packet}");
                self.errors_counter.increment();
                return Dispatch::ProtocolError;
            }

            state.phase = Phase::PshOut;
            state.datagram_out_ts = Some(packet.timestamp);
            if packet.length >= FRAGMENT_THRESHOLD {
                return Dispatch::Fragment;
            }

            self.outgoing_packets.notify(1);
            return Dispatch::Notable;
        }

        let Some(state) = self.sessions.get_mut(&port) else {
            log::warn!("Incoming push without a tracked request: {packet}");
            self.errors_counter.increment();
            return Dispatch::ProtocolError;
        };

        let (Phase::PshOut, Some(outgoing_ts)) = (state.phase, state.datagram_out_ts) else {
            log::warn!("Unexpected incoming push in state {state} for packet {packet}");
            self.errors_counter.increment();
            return Dispatch::ProtocolError;
        };

        if packet.length >= FRAGMENT_THRESHOLD {
            return Dispatch::Fragment;
        }

        state.round_trips += 1;
        self.transport_time.notify(millis_between(outgoing_ts, packet.timestamp));
        self.incoming_packets.notify(1);
        Dispatch::Notable
    }

    fn process_rst(&mut self, packet: &NormalizedPacket) -> Dispatch {
        if self.sessions.remove(&packet.ephemeral_port()).is_none() {
            return Dispatch::Ignored;
        }

        self.resets_counter.notify(1);
        Dispatch::Notable
    }

    /// Closes the session. Follow-up FIN exchanges on the same port are not tracked.
    fn process_fin(&mut self, packet: &NormalizedPacket) -> Dispatch {
        let Some(state) = self.sessions.remove(&packet.ephemeral_port()) else {
            return Dispatch::Ignored;
        };

        if state.round_trips > 0 {
            self.rounds_per_connection.notify(state.round_trips as f64);
        }

        if packet.is_outgoing() {
            self.fin_out_counter.notify(1);
        } else {
            self.fin_in_counter.notify(1);
        }
        Dispatch::Notable
    }

    /// Drops sessions idle for at least `idle_secs` of capture time, returning how many went.
    pub fn expire_idle_sessions(&mut self, now: f64, idle_secs: f64) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|port, state| {
            let keep = now - state.last_seen_ts < idle_secs;
            if !keep {
                log::debug!("Expiring idle session on port {port}: {state}");
            }
            keep
        });

        let expired = before - self.sessions.len();
        self.expired_counter.add(expired as u64);
        expired
    }

    pub fn session(&self, ephemeral_port: u16) -> Option<&SessionState> {
        self.sessions.get(&ephemeral_port)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn syn_count(&self) -> u64 {
        self.syn_counter.count()
    }

    pub fn syn_mean_rate(&self) -> f64 {
        self.syn_counter.mean_rate()
    }

    pub fn syn_ack_count(&self) -> u64 {
        self.syn_ack_counter.count()
    }

    pub fn established_count(&self) -> u64 {
        self.established_counter.count()
    }

    pub fn established_mean_rate(&self) -> f64 {
        self.established_counter.mean_rate()
    }

    pub fn reset_count(&self) -> u64 {
        self.resets_counter.count()
    }

    pub fn fin_in_count(&self) -> u64 {
        self.fin_in_counter.count()
    }

    pub fn fin_out_count(&self) -> u64 {
        self.fin_out_counter.count()
    }

    pub fn outgoing_count(&self) -> u64 {
        self.outgoing_packets.count()
    }

    pub fn incoming_count(&self) -> u64 {
        self.incoming_packets.count()
    }

    pub fn error_count(&self) -> u64 {
        self.errors_counter.value()
    }

    pub fn retransmit_count(&self) -> u64 {
        self.retransmits_counter.value()
    }

    pub fn expired_count(&self) -> u64 {
        self.expired_counter.value()
    }

    pub fn connection_latency_mean(&self) -> Option<f64> {
        self.connection_time.mean()
    }

    pub fn connection_latency_min(&self) -> Option<f64> {
        self.connection_time.min()
    }

    pub fn connection_latency_max(&self) -> Option<f64> {
        self.connection_time.max()
    }

    pub fn connection_latency_p95(&self) -> Option<f64> {
        self.connection_time.percentile(95.0)
    }

    pub fn transport_rtt_p95(&self) -> Option<f64> {
        self.transport_time.percentile(95.0)
    }

    pub fn transport_samples(&self) -> u64 {
        self.transport_time.count()
    }

    pub fn rounds_per_connection_p95(&self) -> Option<f64> {
        self.rounds_per_connection.percentile(95.0)
    }

    /// Owned copy of every figure, safe to hand to an observer.
    pub fn snapshot(&self) -> RemoteSnapshot {
        let mut snapshot = RemoteSnapshot {
            hostname: self.hostname.clone(),
            syn: (&self.syn_counter).into(),
            syn_ack: (&self.syn_ack_counter).into(),
            established: (&self.established_counter).into(),
            resets: (&self.resets_counter).into(),
            fin_in: (&self.fin_in_counter).into(),
            fin_out: (&self.fin_out_counter).into(),
            packets_out: (&self.outgoing_packets).into(),
            packets_in: (&self.incoming_packets).into(),
            errors: self.errors_counter.value(),
            retransmits: self.retransmits_counter.value(),
            expired_sessions: self.expired_counter.value(),
            connection_latency: self.connection_time.summary(),
            transport_latency: self.transport_time.summary(),
            rounds_per_connection: self.rounds_per_connection.summary(),
            active_sessions: self.sessions.len(),
            last_seen: self.last_seen,
            ratios: SynRatios::default(),
        };
        snapshot.ratios = SynRatios {
            syn_ack: snapshot.percent_of_syn(snapshot.syn_ack.count),
            established: snapshot.percent_of_syn(snapshot.established.count),
            resets: snapshot.percent_of_syn(snapshot.resets.count),
            fin_in: snapshot.percent_of_syn(snapshot.fin_in.count),
            fin_out: snapshot.percent_of_syn(snapshot.fin_out.count),
        };
        snapshot
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.snapshot(), f)
    }
}

/// Immutable point-in-time view of a [RemoteTarget].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RemoteSnapshot {
    pub hostname: String,
    pub syn: MeterSummary,
    pub syn_ack: MeterSummary,
    pub established: MeterSummary,
    pub resets: MeterSummary,
    pub fin_in: MeterSummary,
    pub fin_out: MeterSummary,
    pub packets_out: MeterSummary,
    pub packets_in: MeterSummary,
    pub errors: u64,
    pub retransmits: u64,
    pub expired_sessions: u64,
    pub connection_latency: HistogramSummary,
    pub transport_latency: HistogramSummary,
    pub rounds_per_connection: HistogramSummary,
    pub active_sessions: usize,
    /// Capture time of the last packet handled.
    pub last_seen: Option<f64>,
    pub ratios: SynRatios,
}

/// Outcomes as a percentage of observed SYNs, all 0 when no SYN was seen.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SynRatios {
    pub syn_ack: f64,
    pub established: f64,
    pub resets: f64,
    pub fin_in: f64,
    pub fin_out: f64,
}

/// Connection totals across remotes.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Totals {
    pub syn_count: u64,
    pub syn_rate: f64,
    pub established_count: u64,
    pub established_rate: f64,
    pub reset_count: u64,
}

impl Totals {
    pub fn from_snapshots(remotes: &[RemoteSnapshot]) -> Self {
        remotes.iter().fold(Self::default(), |mut totals, remote| {
            totals.syn_count += remote.syn.count;
            totals.syn_rate += remote.syn.mean_rate;
            totals.established_count += remote.established.count;
            totals.established_rate += remote.established.mean_rate;
            totals.reset_count += remote.resets.count;
            totals
        })
    }
}

impl RemoteSnapshot {
    /// `count` as a percentage of observed SYNs, 0 when no SYN was seen.
    pub fn percent_of_syn(&self, count: u64) -> f64 {
        if self.syn.count == 0 {
            return 0.0;
        }
        count as f64 / self.syn.count as f64 * 100.0
    }
}

impl fmt::Display for RemoteSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Host: {} attempts: {}, established: {}, resets: {}, success: {:.2}% | rate: {:.2}/s, \
             mean_time: {:.2}ms, 95th_time: {:.2}ms, min: {:.2}ms, max: {:.2}ms",
            self.hostname,
            self.syn.count,
            self.established.count,
            self.resets.count,
            self.percent_of_syn(self.established.count),
            self.established.mean_rate,
            self.connection_latency.mean.unwrap_or(0.0),
            self.connection_latency.p95.unwrap_or(0.0),
            self.connection_latency.min.unwrap_or(0.0),
            self.connection_latency.max.unwrap_or(0.0),
        )
    }
}
