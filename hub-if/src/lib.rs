#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod err;
pub mod port;

pub use err::{PortError, Result};
pub use port::{DeviceSpeed, PortFeature, PortRequest, PortStatus, PortStatusChange};
