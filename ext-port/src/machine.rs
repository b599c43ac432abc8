//! Pure port state-transition logic.
//!
//! `evaluate` maps one observation of a port (state, cached status,
//! device presence) to the next state plus a list of side effects for
//! the driver to interpret. Keeping it free of driver state makes the
//! transition table testable without a live hub.

use alloc::vec::Vec;

use hub_if::{PortFeature, PortRequest};
use log::{debug, error, warn};

use crate::driver::PortEventKind;
use crate::port::{DeviceState, PortState};

/// Immutable snapshot of everything a transition may depend on.
pub(crate) struct View<'a> {
    pub port_num: u8,
    pub state: PortState,
    pub status: &'a hub_if::PortStatus,
    pub dev_state: DeviceState,
    pub status_outdated: bool,
    pub reset_attempts: u8,
    pub max_reset_attempts: u8,
    pub waiting_recycle: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    /// Issue a hub class request through the gateway.
    Submit(PortRequest),
    /// Deliver an event to the enumeration layer.
    Emit(PortEventKind),
    AttachDevice,
    DetachDevice,
    MarkRecycle,
    ClearRecycle,
    ClearResetAttempts,
    CountResetAttempt,
    /// Run another handling pass with the same status.
    Reevaluate,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Transition {
    pub next: PortState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(state: PortState) -> Self {
        Self {
            next: state,
            effects: Vec::new(),
        }
    }

    fn request(next: PortState, request: PortRequest) -> Self {
        Self {
            next,
            effects: alloc::vec![Effect::Submit(request)],
        }
    }
}

pub(crate) fn evaluate(v: &View) -> Transition {
    // First handling pass: learn the real port status before anything
    // else. The cached status is still meaningless here.
    if v.state == PortState::NotConfigured {
        return Transition::request(PortState::PoweredOff, PortRequest::GetStatus);
    }

    // A stale cache must be refreshed before the tables below may run.
    if v.status_outdated {
        return Transition::request(v.state, PortRequest::GetStatus);
    }

    // Change bits take priority over the state table and are
    // acknowledged one at a time; each ClearFeature completion comes
    // back with a fresh status and triggers the next pass.
    if v.status.change.connection_changed {
        return connection_changed(v);
    }
    if v.status.change.enabled_changed {
        // The hub disabled the port on its own (USB 2.0 11.8.1).
        warn!("Port {}: disabled by hub", v.port_num);
        return Transition::request(v.state, PortRequest::ClearFeature(PortFeature::CEnable));
    }
    if v.status.change.reset_complete {
        let next = if v.status.connected {
            PortState::Enabled
        } else {
            v.state
        };
        return Transition::request(next, PortRequest::ClearFeature(PortFeature::CReset));
    }
    if v.status.change.over_current_changed {
        warn!("Port {}: over-current condition changed", v.port_num);
        return Transition::request(v.state, PortRequest::ClearFeature(PortFeature::COverCurrent));
    }

    // Reset signaling still in progress: poll until the hub finishes.
    if v.state == PortState::Resetting && v.status.resetting {
        return Transition::request(PortState::Resetting, PortRequest::GetStatus);
    }

    let mut effects = Vec::new();
    let next = match v.state {
        // Handled above.
        PortState::NotConfigured => v.state,

        PortState::PoweredOff => {
            if v.status.powered {
                // Already powered (ganged or no power switching).
                effects.push(Effect::Reevaluate);
            } else {
                effects.push(Effect::Submit(PortRequest::SetFeature(PortFeature::Power)));
            }
            PortState::Disconnected
        }

        PortState::Disconnected => {
            if v.status.connected {
                if v.reset_attempts < v.max_reset_attempts {
                    effects.push(Effect::CountResetAttempt);
                    effects.push(Effect::Submit(PortRequest::SetFeature(PortFeature::Reset)));
                    PortState::Resetting
                } else {
                    // Parked until an external recycle or a new
                    // connection cycle clears the counter.
                    error!(
                        "Port {}: reset attempts exhausted ({}), port parked",
                        v.port_num, v.reset_attempts
                    );
                    PortState::Disconnected
                }
            } else {
                PortState::Disconnected
            }
        }

        PortState::Disabled => {
            if v.status.connected
                && v.dev_state == DeviceState::NotPresent
                && v.waiting_recycle
            {
                effects.push(Effect::ClearRecycle);
            }
            PortState::Disabled
        }

        PortState::Resetting => match (v.status.connected, v.dev_state) {
            (false, DeviceState::NotPresent) => PortState::Disconnected,
            (false, DeviceState::Present) => {
                error!(
                    "Port {}: connection lost while resetting an attached device",
                    v.port_num
                );
                effects.push(Effect::Emit(PortEventKind::Disconnected));
                effects.push(Effect::DetachDevice);
                effects.push(Effect::MarkRecycle);
                PortState::Disconnected
            }
            (true, DeviceState::NotPresent) => {
                if v.reset_attempts < v.max_reset_attempts {
                    effects.push(Effect::CountResetAttempt);
                    effects.push(Effect::Submit(PortRequest::SetFeature(PortFeature::Reset)));
                    PortState::Resetting
                } else {
                    error!(
                        "Port {}: reset attempts exhausted ({}), port parked",
                        v.port_num, v.reset_attempts
                    );
                    PortState::Disconnected
                }
            }
            (true, DeviceState::Present) => {
                if v.status.enabled {
                    effects.push(Effect::Emit(PortEventKind::ResetCompleted));
                    PortState::Enabled
                } else {
                    PortState::Resetting
                }
            }
        },

        PortState::Enabled => {
            if v.status.enabled {
                if !v.status.connected {
                    // Enabled with no connection should not happen per
                    // USB 2.0; debounce handling is a known gap.
                    warn!("Port {}: enabled but no connection", v.port_num);
                    PortState::Enabled
                } else if v.dev_state == DeviceState::NotPresent {
                    effects.push(Effect::AttachDevice);
                    effects.push(Effect::Emit(PortEventKind::Connected));
                    PortState::Enabled
                } else {
                    effects.push(Effect::ClearResetAttempts);
                    effects.push(Effect::Emit(PortEventKind::ResetCompleted));
                    PortState::Enabled
                }
            } else if v.dev_state == DeviceState::Present {
                effects.push(Effect::Emit(PortEventKind::Disconnected));
                effects.push(Effect::DetachDevice);
                effects.push(Effect::MarkRecycle);
                PortState::Disconnected
            } else {
                error!("Port {}: disabled with no attached device", v.port_num);
                PortState::Disconnected
            }
        }
    };

    Transition { next, effects }
}

fn connection_changed(v: &View) -> Transition {
    let mut effects = Vec::new();

    let next = if v.status.connected {
        debug!("Port {}: connection detected", v.port_num);
        match v.state {
            PortState::PoweredOff | PortState::Disconnected | PortState::Disabled => {
                // New connection: the retry budget starts over.
                effects.push(Effect::ClearResetAttempts);
                PortState::Resetting
            }
            PortState::Resetting => PortState::Resetting,
            PortState::Enabled if v.dev_state == DeviceState::Present => {
                // Quick unplug and re-plug: the connection bit is back
                // but the attached device is not the one we enumerated.
                warn!("Port {}: device replaced while enabled", v.port_num);
                effects.push(Effect::Emit(PortEventKind::Disconnected));
                effects.push(Effect::DetachDevice);
                effects.push(Effect::MarkRecycle);
                effects.push(Effect::ClearResetAttempts);
                PortState::Disconnected
            }
            other => {
                warn!(
                    "Port {}: unexpected connection change while {:?}",
                    v.port_num, other
                );
                other
            }
        }
    } else {
        debug!("Port {}: connection lost", v.port_num);
        if v.dev_state == DeviceState::Present {
            effects.push(Effect::Emit(PortEventKind::Disconnected));
            effects.push(Effect::DetachDevice);
            effects.push(Effect::MarkRecycle);
        }
        PortState::Disconnected
    };

    effects.push(Effect::Submit(PortRequest::ClearFeature(
        PortFeature::CConnection,
    )));
    Transition { next, effects }
}
