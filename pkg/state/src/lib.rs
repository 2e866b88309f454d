pub mod client;
pub mod watch;

pub use client::{FieldSelector, HttpStore, ResourceStore};
pub use watch::{Change, ChangeFeed, EventType};
