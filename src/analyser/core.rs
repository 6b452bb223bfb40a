//! Routes normalized packets to the remote they belong to.
//!
//! The [Analyser] is single-threaded: `analyse` takes `&mut self`, so packets
//! are applied strictly one at a time in capture order. Observers never see
//! live state. On every notable transition they receive a freshly built
//! [RemoteSnapshot], an owned copy that stays valid however long they keep it.
use super::containers::NormalizedPacket;
use super::remote::{Dispatch, RemoteSnapshot, RemoteTarget};
use super::resolver::{ResolveError, Resolver};
use super::whitelist::Whitelist;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use thiserror::Error;

/// Receives a copy of a remote's metrics after each notable transition.
pub trait Observer {
    fn handle_remote_event(&mut self, remote: &RemoteSnapshot);
}

#[derive(Error, Debug)]
pub enum AnalyserError {
    #[error("failed to resolve remote {address}:{port}")]
    Resolve {
        address: String,
        port: u16,
        #[source]
        source: ResolveError,
    },
}

/// Outgoing TCP analysis.
///
/// Only connections initiated by this host are tracked: those opened by a
/// SYN seen during the capture, and those first seen through an outgoing push.
pub struct Analyser {
    tracked_remotes: HashMap<String, RemoteTarget>,
    whitelist: Box<dyn Whitelist>,
    resolver: Box<dyn Resolver>,
    observer: Option<Box<dyn Observer>>,
    session_idle_secs: Option<f64>,
    last_sweep_ts: Option<f64>,
}

impl Analyser {
    pub fn new(whitelist: Box<dyn Whitelist>, resolver: Box<dyn Resolver>) -> Self {
        Self {
            tracked_remotes: HashMap::new(),
            whitelist,
            resolver,
            observer: None,
            session_idle_secs: None,
            last_sweep_ts: None,
        }
    }

    /// Drops sessions that go quiet for `idle_secs` of capture time.
    pub fn with_session_expiry(mut self, idle_secs: f64) -> Self {
        self.session_idle_secs = Some(idle_secs);
        self
    }

    pub fn set_observer(&mut self, observer: Box<dyn Observer>) {
        log::debug!("Observer attached");
        self.observer = Some(observer);
    }

    pub fn analyse(&mut self, packet: &NormalizedPacket) -> Result<Dispatch, AnalyserError> {
        log::debug!("Analysing {packet}");

        let hostname = match self.resolver.resolve(packet.remote_address(), packet.remote_port()) {
            Ok(hostname) => hostname,
            Err(source) => {
                log::error!("Exception during packet {packet}: {source}");
                return Err(AnalyserError::Resolve {
                    address: packet.remote_address().to_string(),
                    port: packet.remote_port(),
                    source,
                });
            }
        };
        log::debug!("Packet remote resolved to {hostname}");

        let remote = match self.tracked_remotes.entry(hostname) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                // Rejections are not remembered; the next packet asks again.
                if !self.whitelist.allow(packet.remote_address(), packet.remote_port()) {
                    return Ok(Dispatch::Rejected);
                }
                log::info!("Tracking new remote {}", entry.key());
                let remote = RemoteTarget::new(entry.key().clone());
                entry.insert(remote)
            }
        };
        let dispatch = remote.handle(packet);
        log::debug!("Dispatch for {}: {dispatch:?}", remote.hostname());

        if dispatch.is_notable() {
            if let Some(observer) = self.observer.as_mut() {
                observer.handle_remote_event(&remote.snapshot());
            }
        }

        self.sweep_idle_sessions(packet.timestamp);
        Ok(dispatch)
    }

    fn sweep_idle_sessions(&mut self, now: f64) {
        let Some(idle_secs) = self.session_idle_secs else {
            return;
        };

        match self.last_sweep_ts {
            Some(last) if now - last < idle_secs => {}
            Some(_) => {
                let expired: usize = self
                    .tracked_remotes
                    .values_mut()
                    .map(|remote| remote.expire_idle_sessions(now, idle_secs))
                    .sum();
                if expired > 0 {
                    log::info!("Expired {expired} idle sessions");
                }
                self.last_sweep_ts = Some(now);
            }
            None => self.last_sweep_ts = Some(now),
        }
    }

    pub fn remote(&self, hostname: &str) -> Option<&RemoteTarget> {
        self.tracked_remotes.get(hostname)
    }

    pub fn remotes(&self) -> impl Iterator<Item = &RemoteTarget> {
        self.tracked_remotes.values()
    }

    /// Snapshots of every tracked remote, busiest (by established rate) first.
    pub fn snapshots(&self) -> Vec<RemoteSnapshot> {
        let mut snapshots: Vec<RemoteSnapshot> = self.remotes().map(RemoteTarget::snapshot).collect();
        snapshots.sort_by(|a, b| {
            b.established
                .mean_rate
                .total_cmp(&a.established.mean_rate)
                .then_with(|| a.hostname.cmp(&b.hostname))
        });
        snapshots
    }
}
