pub mod app;
pub mod config;
pub mod domain;
pub mod logging;
pub mod platform;

// Re-export main modules
pub use platform::health;
pub use platform::k8s;
pub use platform::sysfs;
