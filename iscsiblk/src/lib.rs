//! Lifecycle of iSCSI-backed block devices on a single host.
//!
//! A volume is exported by the tgt userspace target on this host and
//! imported back through the open-iscsi initiator of the host namespace,
//! which yields a local block device such as `/dev/sdc`. [`Manager`] drives
//! both sides under a host-wide lock.

mod config;
mod device;
mod error;
mod exec;
mod initiator;
mod lock;
mod manager;
mod net;
mod retry;
mod tgt;

#[cfg(test)]
mod mock;

pub use config::Config;
pub use device::*;
pub use error::*;
pub use exec::*;
pub use initiator::{Initiator, Iscsiadm};
pub use lock::*;
pub use manager::Manager;
pub use net::*;
pub use retry::*;
pub use tgt::{TargetAdmin, Tgtadm};
