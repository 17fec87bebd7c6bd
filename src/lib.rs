//! Station-side PASN (Pre-Association Security Negotiation)
//!
//! Runs the three-frame PASN handshake with a peer before association,
//! keeps the resulting PTKSAs in a bounded, expiring cache, and schedules
//! single and batched exchanges for secure ranging.

pub mod config;
pub mod host;
pub mod ieee80211;
pub mod pasn;
pub mod ptksa;
pub mod sim;
pub mod station;
pub mod time;
