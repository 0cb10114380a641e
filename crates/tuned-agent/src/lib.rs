pub mod app;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export main modules
pub use domain::labels;
pub use domain::process;
pub use infrastructure::control_socket;
pub use infrastructure::k8s;
