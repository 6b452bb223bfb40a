//! Feeds decoded capture text into an [Analyser].
//!
//! [feed_lines] is the collection loop shared by every source: it validates,
//! parses and analyses one record at a time and checks a liveness flag
//! between records so a capture can be stopped from another thread.
pub mod tcpdump;

use crate::analyser::core::{Analyser, AnalyserError};
use crate::analyser::utils::{self, ParseError};
use std::io::{self, BufRead};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("failed to start capture reader '{command}'")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("capture reader produced no output stream")]
    NoOutput,
    #[error("capture reader '{command}' exited with {status}")]
    ReaderFailed { command: String, status: ExitStatus },
    #[error("failed reading capture input")]
    Read(#[from] io::Error),
    #[error("failed to process record '{line}'")]
    Processing {
        line: String,
        #[source]
        source: AnalyserError,
    },
}

/// Line tallies for one collection run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub lines: u64,
    pub analysed: u64,
    pub skipped: u64,
}

/// Reads records from `reader` until it is exhausted or `running` is cleared.
///
/// Direction is resolved against `port_floor`, normally [utils::EPHEMERAL_PORT_FLOOR].
///
/// Lines that are not TCP records are skipped. So are records that look right
/// but fail to parse, with a warning. A processing failure stops collection;
/// everything analysed before it stays in the analyser.
pub fn feed_lines<R: BufRead>(
    reader: R,
    analyser: &mut Analyser,
    running: &AtomicBool,
    port_floor: u16,
) -> Result<FeedStats, CollectorError> {
    let mut stats = FeedStats::default();

    for line in reader.lines() {
        if !running.load(Ordering::SeqCst) {
            log::info!("Collection interrupted after {} lines", stats.lines);
            break;
        }

        let line = line?;
        stats.lines += 1;

        if !utils::is_valid_record(&line) {
            stats.skipped += 1;
            continue;
        }

        let packet = match utils::parse_with_floor(&line, port_floor) {
            Ok(packet) => packet,
            Err(e) => {
                warn_unparsable(&line, &e);
                stats.skipped += 1;
                continue;
            }
        };

        if let Err(source) = analyser.analyse(&packet) {
            log::error!("Failed to process record '{line}': {source}");
            return Err(CollectorError::Processing { line, source });
        }
        stats.analysed += 1;
    }

    log::debug!("Collection finished: {stats:?}");
    Ok(stats)
}

fn warn_unparsable(line: &str, e: &ParseError) {
    log::warn!("Skipping unparsable record ({e}): {line}");
}
