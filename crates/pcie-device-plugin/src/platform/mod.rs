pub mod health;
pub mod k8s;
pub mod sysfs;
