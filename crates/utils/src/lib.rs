//! Shared helpers for the tuned-agent workspace: logging setup and build version.

pub mod logging;
pub mod version;
