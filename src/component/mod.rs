//! Process-wide components reconfigured by each apply pass.
//!
//! # Responsibilities
//! - ca.rs: extra trust anchors
//! - auth.rs: local inbound authentication
//! - sniffer.rs: protocol sniffing settings
//! - dialer.rs: outbound dialer settings
//! - ntp.rs: clock offset service
//! - profile.rs: persisted selections and fake-IP state

pub mod auth;
pub mod ca;
pub mod dialer;
pub mod ntp;
pub mod profile;
pub mod sniffer;
