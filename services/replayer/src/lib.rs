//! Traffic replayer service library crate.
//!
//! Reads a capture file, paces it through the `replay-flow` gate and sends
//! every captured request to a target endpoint, connection by connection.
pub mod capture;
pub mod config;
pub mod driver;
pub mod tcp_sink;
pub mod time_shift;
