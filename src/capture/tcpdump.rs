//! Drives `tcpdump` (or a pre-decoded text file) as the packet source.
use super::{feed_lines, CollectorError, FeedStats};
use crate::analyser::core::Analyser;
use crate::analyser::utils::EPHEMERAL_PORT_FLOOR;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

pub const DEFAULT_TCPDUMP: &str = "/usr/sbin/tcpdump";

/// Where capture records come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureSource {
    /// A pcap file, decoded by `tcpdump -r`.
    Offline(PathBuf),
    /// A live interface with an optional BPF filter.
    Live { interface: String, filter: Option<String> },
    /// Text already produced by `tcpdump -nn -tt -S`.
    Decoded(PathBuf),
}

impl CaptureSource {
    /// tcpdump arguments: numeric hosts and ports, epoch timestamps, absolute
    /// sequence numbers, packet-buffered output.
    pub fn tcpdump_args(&self) -> Option<Vec<String>> {
        let mut args: Vec<String> = ["-nn", "-tt", "-S", "-U"].iter().map(|a| a.to_string()).collect();
        match self {
            CaptureSource::Offline(path) => {
                args.push("-r".into());
                args.push(path.display().to_string());
            }
            CaptureSource::Live { interface, filter } => {
                args.push("-l".into());
                args.push("-i".into());
                args.push(interface.clone());
                if let Some(filter) = filter {
                    args.extend(filter.split_whitespace().map(str::to_string));
                }
            }
            CaptureSource::Decoded(_) => return None,
        }
        Some(args)
    }
}

/// Cancellation shared between the collecting thread and whoever stops it.
#[derive(Debug)]
pub struct CaptureControl {
    running: AtomicBool,
    stopped: AtomicBool,
    process_group: Mutex<Option<Pid>>,
}

impl Default for CaptureControl {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            process_group: Mutex::new(None),
        }
    }
}

impl CaptureControl {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops collection and terminates the reader's process group.
    ///
    /// Only the first call has an effect. A reader that already exited is fine.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("Collector stopping...");
        self.running.store(false, Ordering::SeqCst);
        self.terminate_reader();
        log::debug!("Collector stopped!");
    }

    fn terminate_reader(&self) {
        let pgid = match self.process_group.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(pgid) = pgid else {
            return;
        };

        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => log::warn!("Failed to terminate capture reader group {pgid}: {e}"),
        }
    }

    fn set_process_group(&self, pgid: Option<Pid>) {
        match self.process_group.lock() {
            Ok(mut guard) => *guard = pgid,
            Err(poisoned) => *poisoned.into_inner() = pgid,
        }
    }
}

/// Collects records from a [CaptureSource] into an [Analyser].
pub struct TcpdumpCollector {
    source: CaptureSource,
    tcpdump: PathBuf,
    control: Arc<CaptureControl>,
}

impl TcpdumpCollector {
    pub fn new(source: CaptureSource) -> Self {
        Self {
            source,
            tcpdump: PathBuf::from(DEFAULT_TCPDUMP),
            control: Arc::new(CaptureControl::default()),
        }
    }

    pub fn with_tcpdump(mut self, tcpdump: impl Into<PathBuf>) -> Self {
        self.tcpdump = tcpdump.into();
        self
    }

    /// Handle for stopping the collector from another thread.
    pub fn control(&self) -> Arc<CaptureControl> {
        Arc::clone(&self.control)
    }

    /// Runs the capture on the calling thread until input ends or [CaptureControl::stop] is called.
    pub fn start(&mut self, analyser: &mut Analyser) -> Result<FeedStats, CollectorError> {
        log::info!("Collector started on {:?}", self.source);
        if !self.control.is_running() {
            return Ok(FeedStats::default());
        }

        let Some(args) = self.source.tcpdump_args() else {
            let CaptureSource::Decoded(path) = &self.source else {
                return Err(CollectorError::NoOutput);
            };
            let file = File::open(path)?;
            let result = feed_lines(BufReader::new(file), analyser, &self.control.running, *EPHEMERAL_PORT_FLOOR);
            self.control.stop();
            return result;
        };

        let command = format!("{} {}", self.tcpdump.display(), args.join(" "));
        let mut child = Command::new(&self.tcpdump)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|source| CollectorError::Spawn {
                command: command.clone(),
                source,
            })?;
        log::info!("Reading from `{command}`");

        self.control.set_process_group(Some(Pid::from_raw(child.id() as i32)));
        // A stop that raced the spawn saw no process group to signal.
        if !self.control.is_running() {
            self.control.terminate_reader();
        }

        let diagnostics = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                BufReader::new(stderr)
                    .lines()
                    .map_while(Result::ok)
                    .collect::<Vec<String>>()
            })
        });

        let result = match child.stdout.take() {
            Some(stdout) => feed_lines(BufReader::new(stdout), analyser, &self.control.running, *EPHEMERAL_PORT_FLOOR),
            None => Err(CollectorError::NoOutput),
        };
        let stop_requested = !self.control.is_running();

        // After a clean EOF the reader is already exiting; otherwise it has to be told.
        if result.is_err() {
            self.control.stop();
        }
        let status = child.wait()?;
        self.control.stop();
        let diagnostics = diagnostics
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        let stats = result?;
        if !status.success() && !stop_requested {
            for line in &diagnostics {
                log::warn!("tcpdump: {line}");
            }
            return Err(CollectorError::ReaderFailed { command, status });
        }

        for line in &diagnostics {
            log::debug!("tcpdump: {line}");
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::resolver::AddressResolver;
    use crate::analyser::whitelist::AllowAll;

    #[test]
    fn offline_arguments() {
        let source = CaptureSource::Offline(PathBuf::from("/tmp/capture.pcap"));
        assert_eq!(
            source.tcpdump_args().unwrap(),
            vec!["-nn", "-tt", "-S", "-U", "-r", "/tmp/capture.pcap"]
        );
    }

    #[test]
    fn live_arguments_carry_filter() {
        let source = CaptureSource::Live {
            interface: "eth0".into(),
            filter: Some("tcp and port 80".into()),
        };
        assert_eq!(
            source.tcpdump_args().unwrap(),
            vec!["-nn", "-tt", "-S", "-U", "-l", "-i", "eth0", "tcp", "and", "port", "80"]
        );
    }

    #[test]
    fn decoded_source_needs_no_tcpdump() {
        assert_eq!(CaptureSource::Decoded(PathBuf::from("x.txt")).tcpdump_args(), None);
    }

    #[test]
    fn stop_is_idempotent_without_reader() {
        let control = CaptureControl::default();
        assert!(control.is_running());
        control.stop();
        control.stop();
        assert!(!control.is_running());
    }

    fn analyser() -> Analyser {
        Analyser::new(Box::new(AllowAll), Box::new(AddressResolver))
    }

    #[test]
    fn failing_reader_is_an_error() {
        let mut collector = TcpdumpCollector::new(CaptureSource::Offline(PathBuf::from("/nonexistent.pcap")))
            .with_tcpdump("false");

        match collector.start(&mut analyser()) {
            Err(CollectorError::ReaderFailed { status, .. }) => assert!(!status.success()),
            other => panic!("expected reader failure, got {other:?}"),
        }
    }

    #[test]
    fn clean_reader_exit_is_success() {
        let mut collector = TcpdumpCollector::new(CaptureSource::Offline(PathBuf::from("/nonexistent.pcap")))
            .with_tcpdump("true");

        assert_eq!(collector.start(&mut analyser()).unwrap(), FeedStats::default());
    }

    #[test]
    fn missing_reader_binary_fails_to_spawn() {
        let mut collector = TcpdumpCollector::new(CaptureSource::Offline(PathBuf::from("/nonexistent.pcap")))
            .with_tcpdump("/nonexistent/tcpdump");

        assert!(matches!(collector.start(&mut analyser()), Err(CollectorError::Spawn { .. })));
    }

    #[test]
    fn stop_tolerates_exited_reader() {
        let mut child = Command::new("true").process_group(0).spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        child.wait().unwrap();

        let control = CaptureControl::default();
        control.set_process_group(Some(pid));
        control.stop();
        assert!(!control.is_running());
    }
}
