use anyhow::Context;
use clap::{ArgAction, ArgGroup, Parser};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use trtop::analyser::core::Analyser;
use trtop::analyser::remote::RemoteSnapshot;
use trtop::analyser::resolver::{AddressResolver, Resolver, ReverseDnsResolver};
use trtop::analyser::whitelist::{AllowAll, StaticWhitelist, Whitelist};
use trtop::capture::tcpdump::{CaptureControl, CaptureSource, TcpdumpCollector, DEFAULT_TCPDUMP};
use trtop::ui::output::{self, ConsoleReporter};

/// trtop is a top-like view of outgoing TCP connections per remote host
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("source").required(true).args(["input", "decoded", "interface"])))]
struct Args {
    /// pcap file to analyze
    #[arg(short = 'i', long, value_parser)]
    input: Option<PathBuf>,

    /// Text file already decoded with `tcpdump -nn -tt -S`
    #[arg(short = 'd', long, value_parser)]
    decoded: Option<PathBuf>,

    /// Capture live from this interface
    #[arg(long, value_parser)]
    interface: Option<String>,

    /// BPF filter for live capture
    #[arg(short = 'b', long, default_value = "tcp", value_parser)]
    bpf_filter: String,

    /// Report file prefix, default is the current unix time
    #[arg(short = 'o', long, value_parser)]
    out: Option<String>,

    /// Only track these remote addresses
    #[arg(short = 'w', long, value_delimiter = ',', value_parser)]
    whitelist: Vec<String>,

    /// File of remote addresses to track, one per line
    #[arg(long, value_parser)]
    whitelist_file: Option<PathBuf>,

    /// Group remotes by reverse DNS name
    #[arg(short = 'r', long, action = ArgAction::SetTrue)]
    resolve: bool,

    /// Forget sessions idle for this many seconds of capture time
    #[arg(long, value_parser)]
    session_idle_secs: Option<f64>,

    /// Stop after this many seconds
    #[arg(long, value_parser)]
    duration: Option<u64>,

    /// tcpdump binary
    #[arg(long, default_value = DEFAULT_TCPDUMP, value_parser)]
    tcpdump: PathBuf,

    /// Display output as formatted JSON
    #[arg(short = 'j', long, action = ArgAction::SetTrue)]
    json: bool,

    /// No per-event output
    #[arg(short = 'q', long, action = ArgAction::SetTrue)]
    quiet: bool,
}

impl Args {
    fn source(&self) -> Option<CaptureSource> {
        if let Some(path) = &self.input {
            return Some(CaptureSource::Offline(path.clone()));
        }
        if let Some(path) = &self.decoded {
            return Some(CaptureSource::Decoded(path.clone()));
        }
        self.interface.as_ref().map(|interface| CaptureSource::Live {
            interface: interface.clone(),
            filter: Some(self.bpf_filter.clone()).filter(|f| !f.trim().is_empty()),
        })
    }

    fn whitelist(&self) -> anyhow::Result<Box<dyn Whitelist>> {
        if self.whitelist.is_empty() && self.whitelist_file.is_none() {
            return Ok(Box::new(AllowAll));
        }

        let mut whitelist = match &self.whitelist_file {
            Some(path) => StaticWhitelist::from_file(path)
                .with_context(|| format!("failed to read whitelist {}", path.display()))?,
            None => StaticWhitelist::default(),
        };
        whitelist.extend(self.whitelist.iter().map(|a| a.trim()).filter(|a| !a.is_empty()));
        log::info!("Tracking {} whitelisted remotes", whitelist.len());
        Ok(Box::new(whitelist))
    }

    fn resolver(&self) -> Box<dyn Resolver> {
        if self.resolve {
            Box::new(ReverseDnsResolver::new())
        } else {
            Box::new(AddressResolver)
        }
    }
}

fn stop_on_signals(control: Arc<CaptureControl>) -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("failed to register signal handlers")?;
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            log::info!("Received signal {signal}, stopping");
            control.stop();
        }
    });
    Ok(())
}

fn stop_after(control: Arc<CaptureControl>, secs: u64) {
    thread::spawn(move || {
        thread::sleep(Duration::from_secs(secs));
        log::info!("Capture duration of {secs}s reached");
        control.stop();
    });
}

fn report(snapshots: &[RemoteSnapshot], json: bool, prefix: &str) -> anyhow::Result<()> {
    if json {
        let json = output::data_as_json(snapshots)?;
        println!("{json}");
        output::data_to_file(json, Path::new(&format!("{prefix}.json")))?;
    } else {
        output::print_results(snapshots);
        output::data_to_file(output::render_summary(snapshots), Path::new(&format!("{prefix}.trtop")))?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    simple_logger::init_with_env()?;

    let args = Args::parse();
    let prefix = args
        .out
        .clone()
        .unwrap_or_else(|| chrono::Utc::now().timestamp().to_string());
    let source = args.source().context("no capture source given")?;

    let mut analyser = Analyser::new(args.whitelist()?, args.resolver());
    if let Some(idle_secs) = args.session_idle_secs {
        analyser = analyser.with_session_expiry(idle_secs);
    }
    analyser.set_observer(Box::new(ConsoleReporter::new(args.quiet)));

    let mut collector = TcpdumpCollector::new(source).with_tcpdump(&args.tcpdump);
    stop_on_signals(collector.control())?;
    if let Some(secs) = args.duration {
        stop_after(collector.control(), secs);
    }

    let result = collector.start(&mut analyser);
    report(&analyser.snapshots(), args.json, &prefix)?;

    let stats = result.context("capture aborted")?;
    log::info!(
        "Read {} lines, analysed {}, skipped {}",
        stats.lines,
        stats.analysed,
        stats.skipped
    );
    Ok(())
}
