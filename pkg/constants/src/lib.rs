//! Centralized constants for the k3rs proxy.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod iptables;
pub mod network;
pub mod paths;
