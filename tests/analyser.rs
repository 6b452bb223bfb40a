use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use trtop::analyser::core::Analyser;
use trtop::analyser::remote::{Dispatch, RemoteSnapshot, RemoteTarget};
use trtop::analyser::resolver::{AddressResolver, ResolveError, Resolver};
use trtop::analyser::utils::parse_with_floor;
use trtop::analyser::whitelist::{AllowAll, StaticWhitelist};
use trtop::capture::feed_lines;
use trtop::capture::tcpdump::{CaptureSource, TcpdumpCollector};

const FLOOR: u16 = 32768;
const WEB_SERVER: &str = "93.184.216.34";

/// Names the web server "test", everything else by address.
struct TestResolver;

impl Resolver for TestResolver {
    fn resolve(&mut self, address: &str, _port: u16) -> Result<String, ResolveError> {
        if address == WEB_SERVER {
            Ok("test".to_string())
        } else {
            Ok(address.to_string())
        }
    }
}

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

fn web_analyser() -> Analyser {
    Analyser::new(Box::new(StaticWhitelist::new([WEB_SERVER])), Box::new(TestResolver))
}

fn replay(analyser: &mut Analyser, name: &str) {
    let file = File::open(fixture(name)).unwrap();
    let running = AtomicBool::new(true);
    feed_lines(BufReader::new(file), analyser, &running, FLOOR).unwrap();
}

/// syn, syn-ack, established, resets, fin-in, fin-out, out, in, errors, retransmits
fn counts(remote: &RemoteSnapshot) -> [u64; 10] {
    [
        remote.syn.count,
        remote.syn_ack.count,
        remote.established.count,
        remote.resets.count,
        remote.fin_in.count,
        remote.fin_out.count,
        remote.packets_out.count,
        remote.packets_in.count,
        remote.errors,
        remote.retransmits,
    ]
}

#[test]
fn healthy_remote() {
    let mut analyser = web_analyser();
    replay(&mut analyser, "healthy_remote.dump");

    assert_eq!(analyser.remotes().count(), 1);
    assert!(analyser.remote("10.9.9.9").is_none());

    let remote = analyser.remote("test").unwrap();
    assert_eq!(counts(&remote.snapshot()), [1, 1, 1, 0, 1, 0, 2, 2, 0, 0]);
    assert_eq!(remote.transport_samples(), 2);
    assert_eq!(remote.active_sessions(), 0);

    let latency = remote.connection_latency_mean().unwrap();
    assert!((latency - 21.0).abs() < 1e-3, "connection latency {latency}");
    assert_eq!(remote.rounds_per_connection_p95(), Some(2.0));
}

#[test]
fn healthy_pre_connected_remote() {
    let mut analyser = web_analyser();
    replay(&mut analyser, "healthy_pre_connected_remote.dump");

    let remote = analyser.remote("test").unwrap();
    assert_eq!(counts(&remote.snapshot()), [0, 0, 0, 0, 1, 0, 2, 2, 0, 0]);
    assert_eq!(remote.connection_latency_mean(), None);
    assert_eq!(remote.transport_samples(), 2);
}

#[test]
fn decoded_file_through_collector() {
    let mut analyser = web_analyser();
    let mut collector = TcpdumpCollector::new(CaptureSource::Decoded(fixture("healthy_remote.dump")));

    let stats = collector.start(&mut analyser).unwrap();
    assert_eq!(stats.lines, 14);
    assert_eq!(stats.skipped, 1);
    assert!(!collector.control().is_running());
    assert_eq!(analyser.remote("test").unwrap().established_count(), 1);
}

#[test]
fn stopped_collector_reads_nothing() {
    let mut analyser = web_analyser();
    let mut collector = TcpdumpCollector::new(CaptureSource::Decoded(fixture("healthy_remote.dump")));
    collector.control().stop();

    let stats = collector.start(&mut analyser).unwrap();
    assert_eq!(stats.lines, 0);
    assert_eq!(analyser.remotes().count(), 0);
}

#[test]
fn replay_is_deterministic() {
    let mut first = web_analyser();
    let mut second = web_analyser();
    replay(&mut first, "healthy_remote.dump");
    replay(&mut second, "healthy_remote.dump");

    let (first, second) = (first.remote("test").unwrap(), second.remote("test").unwrap());
    assert_eq!(counts(&first.snapshot()), counts(&second.snapshot()));
    assert_eq!(first.snapshot().connection_latency, second.snapshot().connection_latency);
    assert_eq!(first.snapshot().transport_latency, second.snapshot().transport_latency);
}

#[test]
fn single_round_trip_is_measured_once() {
    let mut remote = RemoteTarget::new("test");
    let lines = [
        "10.000 IP 10.0.0.2.40000 > 10.0.0.1.80: Flags [S], seq 100, win 1, length 0",
        "10.001 IP 10.0.0.1.80 > 10.0.0.2.40000: Flags [S.], seq 900, ack 101, win 1, length 0",
        "10.002 IP 10.0.0.2.40000 > 10.0.0.1.80: Flags [.], ack 901, win 1, length 0",
        "10.010 IP 10.0.0.2.40000 > 10.0.0.1.80: Flags [P.], seq 101:151, ack 901, win 1, length 50",
    ];
    for line in lines {
        remote.handle(&parse_with_floor(line, FLOOR).unwrap());
    }
    assert_eq!(remote.transport_samples(), 0);

    let response = "10.035 IP 10.0.0.1.80 > 10.0.0.2.40000: Flags [P.], seq 901:1001, ack 151, win 1, length 100";
    assert_eq!(remote.handle(&parse_with_floor(response, FLOOR).unwrap()), Dispatch::Notable);

    assert_eq!(remote.transport_samples(), 1);
    assert_eq!(remote.session(40000).unwrap().round_trips, 1);
    let rtt = remote.transport_rtt_p95().unwrap();
    assert!((rtt - 25.0).abs() < 1e-3, "rtt {rtt}");
}

/// Loopback traffic to a local web server on 8080.
///
/// 184 connections: 13 refused with a reset, 171 completing the handshake.
/// Established connections do five request/response rounds, the first 16 a
/// sixth. The first 24 end with the server's last response carrying FIN and
/// connections 24 to 61 leave one request unanswered.
fn loopback_capture() -> String {
    const CONNECTIONS: u32 = 184;
    const REFUSED: u32 = 13;

    let mut lines = Vec::new();
    let mut clock = 1_500_000_000.0_f64;
    let mut tick = || {
        clock += 0.0005;
        format!("{clock:.6}")
    };

    for i in 0..CONNECTIONS {
        let client = format!("127.0.0.1.{}", 40000 + i);
        let server = "127.0.0.1.8080";
        let isn = 1_000_000 + i * 10_000;
        let server_isn = 3_000_000 + i * 10_000;

        lines.push(format!(
            "{} IP {client} > {server}: Flags [S], seq {isn}, win 43690, options [mss 65495,sackOK,TS val {i} ecr 0,nop,wscale 7], length 0",
            tick()
        ));

        if i >= CONNECTIONS - REFUSED {
            lines.push(format!(
                "{} IP {server} > {client}: Flags [R.], seq 0, ack {}, win 0, length 0",
                tick(),
                isn + 1
            ));
            continue;
        }

        lines.push(format!(
            "{} IP {server} > {client}: Flags [S.], seq {server_isn}, ack {}, win 43690, length 0",
            tick(),
            isn + 1
        ));
        lines.push(format!("{} IP {client} > {server}: Flags [.], ack {}, win 342, length 0", tick(), server_isn + 1));

        let rounds = if i < 16 { 6 } else { 5 };
        let (mut local, mut remote) = (isn + 1, server_isn + 1);
        for round in 0..rounds {
            lines.push(format!(
                "{} IP {client} > {server}: Flags [P.], seq {local}:{}, ack {remote}, win 342, length 100: HTTP: GET / HTTP/1.1",
                tick(),
                local + 100
            ));
            local += 100;

            lines.push(format!("{} IP {server} > {client}: Flags [.], ack {local}, win 350, length 0", tick()));

            let flags = if i < 24 && round == rounds - 1 { "FP." } else { "P." };
            lines.push(format!(
                "{} IP {server} > {client}: Flags [{flags}], seq {remote}:{}, ack {local}, win 350, length 200: HTTP: HTTP/1.1 200 OK",
                tick(),
                remote + 200
            ));
            remote += 200;

            lines.push(format!("{} IP {client} > {server}: Flags [.], ack {remote}, win 342, length 0", tick()));
        }

        if (24..62).contains(&i) {
            lines.push(format!(
                "{} IP {client} > {server}: Flags [P.], seq {local}:{}, ack {remote}, win 342, length 100: HTTP: GET / HTTP/1.1",
                tick(),
                local + 100
            ));
        }
    }

    lines.join("\n")
}

#[test]
fn loopback_capture_at_scale() {
    let mut analyser = Analyser::new(Box::new(AllowAll), Box::new(AddressResolver));
    let running = AtomicBool::new(true);
    let stats = feed_lines(Cursor::new(loopback_capture()), &mut analyser, &running, FLOOR).unwrap();
    assert_eq!(stats.skipped, 0);

    let remote = analyser.remote("127.0.0.1").unwrap();
    assert_eq!(counts(&remote.snapshot()), [184, 171, 171, 13, 24, 0, 909, 871, 0, 0]);
    assert_eq!(remote.transport_samples(), 871);
    // Every handshaked connection is still open except those the server closed.
    assert_eq!(remote.active_sessions(), 171 - 24);
}
