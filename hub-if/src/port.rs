//! Hub port status and feature definitions.
//!
//! Per USB 2.0 specification chapter 11 (hub class requests).

use num_enum::{IntoPrimitive, TryFromPrimitive};

// wPortStatus bits, USB 2.0 Table 11-21
pub const PORT_STAT_CONNECTION: u16 = 0x0001;
pub const PORT_STAT_ENABLE: u16 = 0x0002;
pub const PORT_STAT_SUSPEND: u16 = 0x0004;
pub const PORT_STAT_OVER_CURRENT: u16 = 0x0008;
pub const PORT_STAT_RESET: u16 = 0x0010;
pub const PORT_STAT_POWER: u16 = 0x0100;
pub const PORT_STAT_LOW_SPEED: u16 = 0x0200;
pub const PORT_STAT_HIGH_SPEED: u16 = 0x0400;

// wPortChange bits, USB 2.0 Table 11-22
pub const PORT_CHANGE_CONNECTION: u16 = 0x0001;
pub const PORT_CHANGE_ENABLE: u16 = 0x0002;
pub const PORT_CHANGE_SUSPEND: u16 = 0x0004;
pub const PORT_CHANGE_OVER_CURRENT: u16 = 0x0008;
pub const PORT_CHANGE_RESET: u16 = 0x0010;

/// Port status, parsed from the wPortStatus/wPortChange pair returned
/// by GetPortStatus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStatus {
    /// Current connect status
    pub connected: bool,

    /// Port enabled
    pub enabled: bool,

    /// Port suspended
    pub suspended: bool,

    /// Over-current condition
    pub over_current: bool,

    /// Reset signaling in progress
    pub resetting: bool,

    /// Port power on
    pub powered: bool,

    /// Low-speed device attached
    pub low_speed: bool,

    /// High-speed device attached
    pub high_speed: bool,

    /// Change flags
    pub change: PortStatusChange,
}

/// Port status change flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStatusChange {
    /// Connect status changed
    pub connection_changed: bool,

    /// Port disabled by the hub (error condition, USB 2.0 11.8.1)
    pub enabled_changed: bool,

    /// Suspend state changed
    pub suspend_changed: bool,

    /// Over-current condition changed
    pub over_current_changed: bool,

    /// Reset signaling complete
    pub reset_complete: bool,
}

impl PortStatus {
    /// Parse the raw status/change words of a GetPortStatus reply.
    pub fn from_raw(status: u16, change: u16) -> Self {
        Self {
            connected: status & PORT_STAT_CONNECTION != 0,
            enabled: status & PORT_STAT_ENABLE != 0,
            suspended: status & PORT_STAT_SUSPEND != 0,
            over_current: status & PORT_STAT_OVER_CURRENT != 0,
            resetting: status & PORT_STAT_RESET != 0,
            powered: status & PORT_STAT_POWER != 0,
            low_speed: status & PORT_STAT_LOW_SPEED != 0,
            high_speed: status & PORT_STAT_HIGH_SPEED != 0,
            change: PortStatusChange {
                connection_changed: change & PORT_CHANGE_CONNECTION != 0,
                enabled_changed: change & PORT_CHANGE_ENABLE != 0,
                suspend_changed: change & PORT_CHANGE_SUSPEND != 0,
                over_current_changed: change & PORT_CHANGE_OVER_CURRENT != 0,
                reset_complete: change & PORT_CHANGE_RESET != 0,
            },
        }
    }

    /// Device speed derived from the low-/high-speed status bits.
    ///
    /// Only meaningful while a device is connected.
    pub fn speed(&self) -> DeviceSpeed {
        if self.low_speed {
            DeviceSpeed::Low
        } else if self.high_speed {
            DeviceSpeed::High
        } else {
            DeviceSpeed::Full
        }
    }

    pub fn has_changes(&self) -> bool {
        let c = &self.change;
        c.connection_changed
            || c.enabled_changed
            || c.suspend_changed
            || c.over_current_changed
            || c.reset_complete
    }
}

/// USB device speed on a USB 2.0 hub port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceSpeed {
    Low = 0,
    Full = 1,
    High = 2,
}

/// Port feature selector, USB 2.0 Table 11-17.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum PortFeature {
    Connection = 0,
    Enable = 1,
    Suspend = 2,
    OverCurrent = 3,
    Reset = 4,
    Power = 8,
    LowSpeed = 9,
    CConnection = 16,
    CEnable = 17,
    CSuspend = 18,
    COverCurrent = 19,
    CReset = 20,
    Test = 21,
    Indicator = 22,
}

/// Hub class request targeting one downstream port.
///
/// Submission only puts the control transfer on the wire; the answer
/// comes back through the driver's completion entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRequest {
    GetStatus,
    SetFeature(PortFeature),
    ClearFeature(PortFeature),
}
