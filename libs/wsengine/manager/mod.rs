//! # wsengine manager
//!
//! Tracking of open sessions and fan-out of open/close notifications.

pub mod registry;

pub use registry::SessionRegistry;
