pub mod core;
pub mod event_loop;
pub mod reconcile;
pub mod retry;

pub use self::core::dump_node_labels;
pub use self::core::Application;
