//! Contains utilities and helper functions that turn tcpdump text records into
//! [NormalizedPacket]s.
//!
//! The expected record shape is what `tcpdump -nn -tt -S` prints, e.g.:
//!
//! ```text
//! 1434567890.130000 IP 192.168.1.10.51234 > 93.184.216.34.80: Flags [P.], seq 1001:1101, ack 5001, win 229, options [nop,nop,TS val 105 ecr 200], length 100: HTTP: GET / HTTP/1.1
//! ```
use super::containers::{Direction, Endpoint, NormalizedPacket, TcpFlag};
use lazy_static::lazy_static;
use std::{fs, path::Path};
use thiserror::Error;

const TIMESTAMP_IDX: usize = 0;
const PROTOCOL_IDX: usize = 1;
const SRC_IDX: usize = 2;
const DST_IDX: usize = 4;
const FLAGS_MARKER_IDX: usize = 5;
const FLAGS_IDX: usize = 6;

const MIN_RECORD_FIELDS: usize = 9;

/// Where Linux publishes the local port range used for outbound connections.
pub const LOCAL_PORT_RANGE_PATH: &str = "/proc/sys/net/ipv4/ip_local_port_range";

/// Used when the local port range cannot be read.
pub const DEFAULT_EPHEMERAL_PORT_FLOOR: u16 = 32768;

lazy_static! {
    /// Lowest port the OS hands out for outbound connections, read once per process.
    pub static ref EPHEMERAL_PORT_FLOOR: u16 = {
        let floor = read_ephemeral_port_floor(Path::new(LOCAL_PORT_RANGE_PATH))
            .unwrap_or(DEFAULT_EPHEMERAL_PORT_FLOOR);
        log::debug!("Ephemeral port floor is {floor}");
        floor
    };
}

#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("record has too few fields to be a tcpdump IP line")]
    Truncated,
    #[error("invalid capture timestamp '{0}'")]
    Timestamp(String),
    #[error("invalid endpoint '{0}', expected address.port")]
    Endpoint(String),
    #[error("invalid {field} value '{value}'")]
    Number { field: &'static str, value: String },
}

/// Reads the first value of a `low<TAB>high` port range file.
pub fn read_ephemeral_port_floor(path: &Path) -> Option<u16> {
    let contents = fs::read_to_string(path).ok()?;
    contents.split_whitespace().next()?.parse().ok()
}

/// Checks whether a line looks like a tcpdump TCP/IP record.
///
/// Anything else (ARP, IP6, truncated lines) is skipped by the caller.
pub fn is_valid_record(line: &str) -> bool {
    let parts: Vec<&str> = line.split_whitespace().collect();
    parts.len() >= MIN_RECORD_FIELDS
        && parts[PROTOCOL_IDX] == "IP"
        && parts[FLAGS_MARKER_IDX] == "Flags"
}

/// Parses a record using the process-wide [EPHEMERAL_PORT_FLOOR].
pub fn parse(line: &str) -> Result<NormalizedPacket, ParseError> {
    parse_with_floor(line, *EPHEMERAL_PORT_FLOOR)
}

/// Parses a record that passed [is_valid_record], resolving direction against `port_floor`.
pub fn parse_with_floor(line: &str, port_floor: u16) -> Result<NormalizedPacket, ParseError> {
    let line = line.trim_end();
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < MIN_RECORD_FIELDS {
        return Err(ParseError::Truncated);
    }

    let timestamp = parts[TIMESTAMP_IDX]
        .parse::<f64>()
        .map_err(|_| ParseError::Timestamp(parts[TIMESTAMP_IDX].to_string()))?;
    let src = split_endpoint(parts[SRC_IDX])?;
    let dst = split_endpoint(parts[DST_IDX])?;
    let flag = TcpFlag::from_token(parts[FLAGS_IDX].trim_matches(|c| c == '[' || c == ']' || c == ','));
    let direction = resolve_direction(src.port, dst.port, port_floor);

    Ok(NormalizedPacket {
        timestamp,
        src,
        dst,
        flag,
        sequence: extract_sequence(line)?,
        ack: extract_number(line, " ack ", "ack")?.unwrap_or(0),
        length: extract_number(line, "length ", "length")?.unwrap_or(0),
        // Informational only; a mangled option does not cost the record.
        ts_val: extract_number(line, "TS val ", "TS val").ok().flatten(),
        direction,
    })
}

/// Outgoing unless only the destination sits in the ephemeral range.
///
/// When both or neither port is below the floor the source is taken as local.
pub fn resolve_direction(src_port: u16, dst_port: u16, port_floor: u16) -> Direction {
    if src_port < port_floor && dst_port >= port_floor {
        Direction::Incoming
    } else {
        Direction::Outgoing
    }
}

/// Splits `10.0.0.1.80:` on its last dot, dropping trailing punctuation from the port.
fn split_endpoint(field: &str) -> Result<Endpoint, ParseError> {
    let (address, port) = field
        .rsplit_once('.')
        .ok_or_else(|| ParseError::Endpoint(field.to_string()))?;
    let port = port
        .trim_end_matches(|c: char| !c.is_ascii_digit())
        .parse::<u16>()
        .map_err(|_| ParseError::Endpoint(field.to_string()))?;

    Ok(Endpoint {
        address: address.to_string(),
        port,
    })
}

/// Text following `marker` up to the first terminator or whitespace.
fn value_after<'a>(line: &'a str, marker: &str, terminators: &[char]) -> Option<&'a str> {
    let start = line.find(marker)? + marker.len();
    let rest = &line[start..];
    let end = rest
        .find(|c: char| c.is_whitespace() || terminators.contains(&c))
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

fn extract_number(line: &str, marker: &str, field: &'static str) -> Result<Option<u32>, ParseError> {
    match value_after(line, marker, &[',', ':', ']']) {
        Some(value) => value.parse::<u32>().map(Some).map_err(|_| ParseError::Number {
            field,
            value: value.to_string(),
        }),
        None => Ok(None),
    }
}

/// `seq 1001:1101,` yields the end of the range, `seq 1000,` the value itself.
fn extract_sequence(line: &str) -> Result<u32, ParseError> {
    let Some(value) = value_after(line, " seq ", &[',']) else {
        return Ok(0);
    };
    let end = value.rsplit(':').next().unwrap_or(value);
    end.parse::<u32>().map_err(|_| ParseError::Number {
        field: "seq",
        value: value.to_string(),
    })
}
