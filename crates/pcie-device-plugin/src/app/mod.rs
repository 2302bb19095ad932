//! Application module
//!
//! Process wiring: building the components from the daemon arguments,
//! the startup sequence, background tasks and shutdown.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

// Re-export main types
pub use builder::ApplicationBuilder;
pub use core::Application;
pub use services::ApplicationServices;
