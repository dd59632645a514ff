//! Data link layers
//!
//! Only the secure WebSocket datalink (BACnet/SC) is provided by this crate.

pub mod bsc;
