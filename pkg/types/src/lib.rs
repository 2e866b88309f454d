//! Resource types shared by the proxy crates.

pub mod config;
pub mod endpoint;
pub mod meta;
pub mod pod;
pub mod service;
