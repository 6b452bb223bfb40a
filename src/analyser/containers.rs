use serde::Serialize;
use std::fmt;

/// TCP flag combinations as printed by tcpdump, e.g. `[S.]` or `[FP.]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum TcpFlag {
    Syn,
    SynAck,
    Ack,
    Rst,
    RstAck,
    Psh,
    PshAck,
    PshAckFin,
    FinAck,
    Fin,
    /// Any combination we do not dispatch on. Kept verbatim for logging.
    Other(String),
}

impl TcpFlag {
    /// Maps an undecorated tcpdump flag token (`S.`, `P.`, ...) to a [TcpFlag].
    pub fn from_token(token: &str) -> Self {
        match token {
            "S" => TcpFlag::Syn,
            "S." => TcpFlag::SynAck,
            "." => TcpFlag::Ack,
            "R" => TcpFlag::Rst,
            "R." => TcpFlag::RstAck,
            "P" => TcpFlag::Psh,
            "P." => TcpFlag::PshAck,
            "FP." => TcpFlag::PshAckFin,
            "F." => TcpFlag::FinAck,
            "F" => TcpFlag::Fin,
            other => TcpFlag::Other(other.to_string()),
        }
    }

    pub fn as_token(&self) -> &str {
        match self {
            TcpFlag::Syn => "S",
            TcpFlag::SynAck => "S.",
            TcpFlag::Ack => ".",
            TcpFlag::Rst => "R",
            TcpFlag::RstAck => "R.",
            TcpFlag::Psh => "P",
            TcpFlag::PshAck => "P.",
            TcpFlag::PshAckFin => "FP.",
            TcpFlag::FinAck => "F.",
            TcpFlag::Fin => "F",
            TcpFlag::Other(token) => token,
        }
    }
}

impl fmt::Display for TcpFlag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self.as_token())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// An `address.port` pair as printed by tcpdump with `-nn`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// One decoded capture record.
///
/// Direction is resolved once at parse time against the ephemeral port floor,
/// so every accessor below is a plain field lookup.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NormalizedPacket {
    /// Capture time in seconds since the epoch.
    pub timestamp: f64,
    pub src: Endpoint,
    pub dst: Endpoint,
    pub flag: TcpFlag,
    pub sequence: u32,
    pub ack: u32,
    pub length: u32,
    pub ts_val: Option<u32>,
    pub direction: Direction,
}

impl NormalizedPacket {
    pub fn is_outgoing(&self) -> bool {
        self.direction == Direction::Outgoing
    }

    pub fn remote(&self) -> &Endpoint {
        match self.direction {
            Direction::Outgoing => &self.dst,
            Direction::Incoming => &self.src,
        }
    }

    pub fn local(&self) -> &Endpoint {
        match self.direction {
            Direction::Outgoing => &self.src,
            Direction::Incoming => &self.dst,
        }
    }

    pub fn remote_address(&self) -> &str {
        &self.remote().address
    }

    pub fn remote_port(&self) -> u16 {
        self.remote().port
    }

    /// The local port, which keys the session inside a remote.
    pub fn ephemeral_port(&self) -> u16 {
        self.local().port
    }

    /// Pure ACKs carry no sequence of their own.
    pub fn is_ack_only(&self) -> bool {
        self.flag == TcpFlag::Ack && self.length == 0
    }
}

impl fmt::Display for NormalizedPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:.6} {} {} > {} {} (ephemeral: {}, remote: {}, ack: {}, seq: {}) (len: {})",
            self.timestamp,
            if self.is_outgoing() { "out" } else { "in" },
            self.src,
            self.dst,
            self.flag,
            self.ephemeral_port(),
            self.remote(),
            self.ack,
            self.sequence,
            self.length,
        )
    }
}
