//! Chat Line Protocol
//! 
//! Newline-delimited UTF-8 frames exchanged between the relay and its clients.

pub mod codec;
pub mod constants;
pub mod types;

pub use constants::*;
pub use types::*;
