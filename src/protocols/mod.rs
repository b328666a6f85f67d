//! Protocol implementations.
//!
//! - `frame`: length-prefixed, chunk-addressable frames with transaction
//!   reassembly and an echo handler for the runtime
pub mod frame;
