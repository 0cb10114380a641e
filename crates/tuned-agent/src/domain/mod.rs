//! Decision logic and the daemon process lifecycle, independent of any event source.

pub mod labels;
pub mod process;
pub mod resync;
pub mod state;
