//! Device model, snapshot ownership and allocation decisions.
//!
//! Nothing in here touches the filesystem or the network.

pub mod allocation;
pub mod device;
pub mod snapshot;
