//! Per-port persistent state.

use core::time::Duration;

use bitflags::bitflags;
use hub_if::PortStatus;

/// Port state machine states.
///
/// A subset of the USB 2.0 port states (figure 11-10); Suspended and
/// Testing are never entered by this driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    NotConfigured,
    PoweredOff,
    Disconnected,
    Disabled,
    Resetting,
    Enabled,
}

/// Whether a child device object currently exists for the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    NotPresent,
    Present,
}

bitflags! {
    /// Port lifecycle flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct PortFlags: u8 {
        /// A hub class request for this port is in flight.
        const STATUS_LOCK = 1 << 0;
        /// Cached status is no longer trustworthy.
        const STATUS_OUTDATED = 1 << 1;
        /// Parent hub has been removed.
        const GONE = 1 << 2;
        /// The enumeration layer owns a device on this port.
        const ENUM_DEVICE = 1 << 3;
        /// Device removal pending, recycle required before reuse.
        const WAITING_RECYCLE = 1 << 4;
        /// Port may be freed once drained.
        const WAITING_FREE = 1 << 5;
    }
}

bitflags! {
    /// Outstanding requested actions, drained by `process()` in a
    /// fixed priority order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct ActionFlags: u8 {
        const HANDLE = 1 << 0;
        const DISABLE = 1 << 1;
        const RECYCLE = 1 << 2;
        const RESET = 1 << 3;
        const GET_STATUS = 1 << 4;
    }
}

/// Configuration for one downstream port, fixed at creation.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Port number on the parent hub, 1-based.
    pub port_num: u8,

    /// Bus address of the parent hub device, cached for diagnostics.
    pub parent_dev_addr: u8,

    /// Delay between SetPortFeature(POWER) submission and the port
    /// status becoming trustworthy. `Duration::ZERO` means the hub
    /// has no port power switching and pacing is skipped.
    pub power_on_delay: Duration,
}

impl PortConfig {
    /// Derive the power-on delay from the hub descriptor's
    /// bPwrOn2PwrGood field (2 ms units).
    pub fn power_on_delay_from_power_good(units: u8) -> Duration {
        Duration::from_millis(units as u64 * 2)
    }
}

/// One tracked downstream port.
pub(crate) struct Port {
    pub port_num: u8,
    pub parent_dev_addr: u8,
    pub state: PortState,
    pub dev_state: DeviceState,
    pub flags: PortFlags,
    pub actions: ActionFlags,
    pub status: PortStatus,
    pub reset_attempts: u8,
    pub power_on_delay: Duration,
}

impl Port {
    pub fn new(config: &PortConfig) -> Self {
        Self {
            port_num: config.port_num,
            parent_dev_addr: config.parent_dev_addr,
            state: PortState::NotConfigured,
            dev_state: DeviceState::NotPresent,
            flags: PortFlags::STATUS_OUTDATED,
            actions: ActionFlags::empty(),
            status: PortStatus::default(),
            reset_attempts: 0,
            power_on_delay: config.power_on_delay,
        }
    }

    pub fn is_status_locked(&self) -> bool {
        self.flags.contains(PortFlags::STATUS_LOCK)
    }

    pub fn is_status_outdated(&self) -> bool {
        self.flags.contains(PortFlags::STATUS_OUTDATED)
    }

    pub fn is_gone(&self) -> bool {
        self.flags.contains(PortFlags::GONE)
    }

    pub fn has_enumerated_device(&self) -> bool {
        self.flags.contains(PortFlags::ENUM_DEVICE)
    }

    pub fn is_waiting_recycle(&self) -> bool {
        self.flags.contains(PortFlags::WAITING_RECYCLE)
    }

    pub fn is_waiting_free(&self) -> bool {
        self.flags.contains(PortFlags::WAITING_FREE)
    }
}
