//! trtop: per-remote outgoing TCP connection metrics reconstructed from tcpdump output.
pub mod analyser;
pub mod capture;
pub mod ui;
