use crate::analyser::core::Observer;
use crate::analyser::metrics::HistogramSummary;
use crate::analyser::remote::{RemoteSnapshot, Totals};
use ansi_term::Colour;
use chrono::{Local, TimeZone};
use serde::Serialize;
use std::fmt::Write as _;
use std::{fs, io, path::Path};

/// Prints a line per notable remote event.
#[derive(Debug, Default)]
pub struct ConsoleReporter {
    quiet: bool,
    events: u64,
}

impl ConsoleReporter {
    pub fn new(quiet: bool) -> Self {
        Self { quiet, events: 0 }
    }

    pub fn events(&self) -> u64 {
        self.events
    }
}

impl Observer for ConsoleReporter {
    fn handle_remote_event(&mut self, remote: &RemoteSnapshot) {
        self.events += 1;
        if self.quiet {
            return;
        }
        println!("{}", event_line(remote));
    }
}

fn event_line(remote: &RemoteSnapshot) -> String {
    let success = remote.percent_of_syn(remote.established.count);
    let success = if remote.syn.count == 0 || success >= 99.0 {
        Colour::Green.paint(format!("{success:.2}%"))
    } else if success >= 90.0 {
        Colour::Yellow.paint(format!("{success:.2}%"))
    } else {
        Colour::Red.paint(format!("{success:.2}%"))
    };

    let seen = remote.last_seen.map_or("-".to_string(), format_capture_time);
    format!(
        "{} {} syn {} est {} rst {} ok {} | conn p95 {} | rtt p95 {} | err {}",
        Colour::Blue.paint(seen),
        Colour::Fixed(226).paint(&remote.hostname),
        remote.syn.count,
        remote.established.count,
        remote.resets.count,
        success,
        millis(remote.connection_latency.p95),
        millis(remote.transport_latency.p95),
        remote.errors,
    )
}

fn millis(value: Option<f64>) -> String {
    match value {
        Some(ms) => format!("{ms:.2}ms"),
        None => "-".to_string(),
    }
}

fn histogram_line(summary: &HistogramSummary) -> String {
    format!(
        "n {} | mean {} | p95 {} | min {} | max {}",
        summary.count,
        millis(summary.mean),
        millis(summary.p95),
        millis(summary.min),
        millis(summary.max),
    )
}

/// Capture-clock seconds as local wall time.
pub fn format_capture_time(timestamp: f64) -> String {
    let secs = timestamp.trunc() as i64;
    let nanos = (timestamp.fract() * 1e9) as u32;
    match Local.timestamp_opt(secs, nanos).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => format!("{timestamp:.6}"),
    }
}

/// Summary table without colour, as written to the report file.
pub fn render_summary(remotes: &[RemoteSnapshot]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\u{250F}\u{2501}\u{2501}\u{2501}\u{2501} Results");
    if remotes.is_empty() {
        let _ = writeln!(out, "\u{2503}");
        let _ = writeln!(out, "\u{2503} No outgoing connections observed");
        return out;
    }

    for remote in remotes {
        let _ = writeln!(out, "\u{2503}");
        let _ = writeln!(out, "\u{2503} Remote {}", remote.hostname);
        let _ = writeln!(
            out,
            "\u{2503} Connections      : syn {} | syn-ack {} ({:.2}%) | established {} ({:.2}%) | reset {} ({:.2}%)",
            remote.syn.count,
            remote.syn_ack.count,
            remote.ratios.syn_ack,
            remote.established.count,
            remote.ratios.established,
            remote.resets.count,
            remote.ratios.resets,
        );
        let _ = writeln!(
            out,
            "\u{2503} Rates            : syn {:.2}/s | established {:.2}/s (1m {:.2}/s)",
            remote.syn.mean_rate, remote.established.mean_rate, remote.established.one_minute_rate,
        );
        let _ = writeln!(
            out,
            "\u{2503} Packets          : out {} | in {} | fin-in {} ({:.2}%) | fin-out {} ({:.2}%)",
            remote.packets_out.count,
            remote.packets_in.count,
            remote.fin_in.count,
            remote.ratios.fin_in,
            remote.fin_out.count,
            remote.ratios.fin_out,
        );
        let _ = writeln!(out, "\u{2503} Connect latency  : {}", histogram_line(&remote.connection_latency));
        let _ = writeln!(out, "\u{2503} Transport RTT    : {}", histogram_line(&remote.transport_latency));
        let _ = writeln!(
            out,
            "\u{2503} Rounds/conn p95  : {}",
            remote
                .rounds_per_connection
                .p95
                .map_or("-".to_string(), |rounds| format!("{rounds:.0}")),
        );
        let _ = writeln!(
            out,
            "\u{2503} Anomalies        : errors {} | retransmits {} | expired {} | open {}",
            remote.errors, remote.retransmits, remote.expired_sessions, remote.active_sessions,
        );
    }

    let totals = Totals::from_snapshots(remotes);
    let _ = writeln!(out, "\u{2503}");
    let _ = writeln!(
        out,
        "\u{2503} Totals           : syn {} ({:.2}/s) | established {} ({:.2}/s) | reset {}",
        totals.syn_count, totals.syn_rate, totals.established_count, totals.established_rate, totals.reset_count,
    );
    out
}

pub fn print_results(remotes: &[RemoteSnapshot]) {
    let summary = render_summary(remotes);
    for line in summary.lines() {
        match line.strip_prefix("\u{2503} Remote ") {
            Some(hostname) => println!("\u{2503} Remote {}", Colour::Red.paint(hostname)),
            None => println!("{line}"),
        }
    }
}

#[derive(Serialize)]
struct Report<'a> {
    remotes: &'a [RemoteSnapshot],
    totals: Totals,
}

pub fn data_as_json(remotes: &[RemoteSnapshot]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&Report {
        remotes,
        totals: Totals::from_snapshots(remotes),
    })
}

pub fn data_to_file(data: String, path: &Path) -> io::Result<()> {
    fs::write(path, data)?;
    log::info!("Report written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::remote::RemoteTarget;
    use crate::analyser::utils::parse_with_floor;

    fn healthy_remote() -> RemoteSnapshot {
        let mut remote = RemoteTarget::new("test");
        for line in [
            "100.000 IP 10.0.0.2.40000 > 10.0.0.1.80: Flags [S], seq 1000, win 1, length 0",
            "100.010 IP 10.0.0.1.80 > 10.0.0.2.40000: Flags [S.], seq 5000, ack 1001, win 1, length 0",
            "100.020 IP 10.0.0.2.40000 > 10.0.0.1.80: Flags [.], ack 5001, win 1, length 0",
        ] {
            remote.handle(&parse_with_floor(line, 32768).unwrap());
        }
        remote.snapshot()
    }

    #[test]
    fn summary_lists_each_remote() {
        let summary = render_summary(&[healthy_remote()]);
        assert!(summary.starts_with("\u{250F}\u{2501}\u{2501}\u{2501}\u{2501} Results"));
        assert!(summary.contains("\u{2503} Remote test"));
        assert!(summary.contains("syn 1 | syn-ack 1 (100.00%) | established 1 (100.00%) | reset 0 (0.00%)"));
        assert!(summary.contains("fin-in 0 (0.00%) | fin-out 0 (0.00%)"));
        assert!(summary.contains("errors 0 | retransmits 0"));
    }

    #[test]
    fn empty_summary_says_so() {
        assert!(render_summary(&[]).contains("No outgoing connections observed"));
    }

    #[test]
    fn json_report_carries_counts() {
        let json = data_as_json(&[healthy_remote(), healthy_remote()]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let remote = &value["remotes"][0];
        assert_eq!(remote["hostname"], "test");
        assert_eq!(remote["established"]["count"], 1);
        assert_eq!(remote["errors"], 0);
        assert_eq!(remote["ratios"]["syn_ack"], 100.0);
        assert_eq!(remote["ratios"]["established"], 100.0);
        assert_eq!(remote["ratios"]["resets"], 0.0);
        assert_eq!(remote["ratios"]["fin_in"], 0.0);
        assert_eq!(remote["ratios"]["fin_out"], 0.0);
        assert_eq!(value["totals"]["syn_count"], 2);
        assert_eq!(value["totals"]["established_count"], 2);
        assert_eq!(value["totals"]["reset_count"], 0);
    }

    #[test]
    fn summary_ends_with_totals() {
        let summary = render_summary(&[healthy_remote(), healthy_remote()]);
        let last = summary.lines().last().unwrap();
        assert!(last.starts_with("\u{2503} Totals"));
        assert!(last.contains("syn 2 ("));
        assert!(last.contains("established 2 ("));
        assert!(last.ends_with("reset 0"));
    }

    #[test]
    fn reporter_counts_events_when_quiet() {
        let mut reporter = ConsoleReporter::new(true);
        reporter.handle_remote_event(&healthy_remote());
        assert_eq!(reporter.events(), 1);
    }

    #[test]
    fn missing_latency_renders_as_dash() {
        assert_eq!(millis(None), "-");
        assert_eq!(millis(Some(1.5)), "1.50ms");
    }

    #[test]
    fn event_line_names_the_remote() {
        let line = event_line(&healthy_remote());
        assert!(line.contains("test"));
        assert!(line.contains("syn 1 est 1 rst 0"));
    }

    #[test]
    fn capture_time_keeps_milliseconds() {
        assert!(format_capture_time(1434567890.25).ends_with(".250"));
    }
}
