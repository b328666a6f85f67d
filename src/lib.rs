//! ringframe: a TCP server engine on io_uring
//!
//! - `protocols::frame`: length-prefixed frame parser and chunked
//!   transaction reassembly (platform independent)
//! - `runtime`: buffer pool, completion queue, connection state machine and
//!   accept listener (completion queue and above are Linux only)
//! - `config`: CLI and TOML configuration for the server binary

pub mod config;
pub mod protocols;
pub mod runtime;
