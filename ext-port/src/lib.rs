#![cfg_attr(not(test), no_std)]

//! Downstream-port driver for external USB 2.0 hubs.
//!
//! Tracks each port's electrical state (power, connection, reset,
//! enable) through the asynchronous hub port-control protocol and
//! surfaces connect/reset-complete/disconnect events to the device
//! enumeration layer. One hub class request is in flight at a time;
//! completions re-enter through [`PortDriver::complete`].

extern crate alloc;

mod driver;
mod machine;
mod port;
mod queue;

pub use hub_if::{DeviceSpeed, PortError, PortFeature, PortRequest, PortStatus, Result};

pub use driver::{
    DriverConfig, HubParent, PortDriver, PortEvent, PortEventHandler, PortEventKind, PortId,
    RequestToken,
};
pub use port::{DeviceState, PortConfig, PortState};
