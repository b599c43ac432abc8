//! Port driver façade.
//!
//! Owns the tracked ports and the pending-work queue, dispatches the
//! accumulated per-port actions, and coordinates the one-request-at-a-
//! time protocol with the parent hub. Single-threaded cooperative
//! model: every operation takes `&mut self`, callers serialize access.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::time::Duration;

use hub_if::{DeviceSpeed, PortError, PortFeature, PortRequest, PortStatus, Result};
use log::{debug, error, info, trace, warn};

use crate::machine::{self, Effect, View};
use crate::port::{ActionFlags, DeviceState, Port, PortConfig, PortFlags, PortState};
use crate::queue::PendingQueue;

/// Handle to one tracked port.
pub type PortId = u32;

/// Recovery time after submitting SetPortFeature(RESET), before the
/// port status is worth reading again.
const RESET_RECOVERY_DELAY: Duration = Duration::from_millis(50);

/// Event delivered to the enumeration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEventKind {
    Connected,
    ResetCompleted,
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
pub struct PortEvent {
    pub port: PortId,
    /// Port number on the parent hub, 1-based.
    pub port_num: u8,
    /// Bus address of the parent hub device.
    pub parent_dev_addr: u8,
    pub kind: PortEventKind,
}

/// The parent hub side of the driver: submits hub class requests and
/// decides when `process()` actually runs.
pub trait HubParent {
    /// Put one class request on the wire. Returns once the transfer is
    /// issued; the answer re-enters through [`PortDriver::complete`]
    /// carrying the same token.
    fn submit(&mut self, token: RequestToken, port_num: u8, request: PortRequest) -> Result;

    /// Block the driver context. Used for power-on and reset-recovery
    /// pacing only.
    fn delay(&mut self, duration: Duration);

    /// The driver queued work; call [`PortDriver::process`] soon. The
    /// callee gets no driver reference, so it cannot re-enter.
    fn process_request(&mut self);

    /// All ports drained. The hub may re-enable its interrupt-driven
    /// status notifications.
    fn process_completed(&mut self);
}

pub trait PortEventHandler {
    fn handle(&mut self, event: &PortEvent);
}

/// Matches a completion to the request it answers. Stale tokens are
/// rejected with `InvalidState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestToken(u32);

#[derive(Debug, Clone, Copy)]
struct Inflight {
    token: RequestToken,
    port: PortId,
    request: PortRequest,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Reset tries per connection before the port is parked.
    pub max_reset_attempts: u8,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_reset_attempts: 1,
        }
    }
}

pub struct PortDriver {
    ports: BTreeMap<PortId, Port>,
    next_port_id: PortId,
    pending: PendingQueue,
    inflight: Option<Inflight>,
    /// True once the drain notification fired; cleared when work is
    /// queued again. Keeps `process_completed()` edge-triggered.
    idle: bool,
    next_serial: u32,
    max_reset_attempts: u8,
    parent: Box<dyn HubParent>,
    events: Box<dyn PortEventHandler>,
}

impl PortDriver {
    pub fn install(
        config: DriverConfig,
        parent: Box<dyn HubParent>,
        events: Box<dyn PortEventHandler>,
    ) -> Self {
        Self {
            ports: BTreeMap::new(),
            next_port_id: 1,
            pending: PendingQueue::new(),
            inflight: None,
            idle: true,
            next_serial: 0,
            max_reset_attempts: config.max_reset_attempts,
            parent,
            events,
        }
    }

    /// Tear the driver down. Fails, handing the driver back, while
    /// pending work or an in-flight request remains.
    pub fn uninstall(self) -> core::result::Result<(), Self> {
        if self.pending.is_empty() && self.inflight.is_none() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Start tracking a new downstream port and queue its first
    /// handling pass.
    pub fn new_port(&mut self, config: PortConfig) -> Result<PortId> {
        if config.port_num == 0 {
            return Err(PortError::InvalidArg);
        }
        let id = self.next_port_id;
        self.next_port_id += 1;
        self.ports.insert(id, Port::new(&config));
        debug!(
            "Port {}: tracking as id {}, power-on delay {:?}",
            config.port_num, id, config.power_on_delay
        );
        self.set_actions(id, ActionFlags::HANDLE);
        Ok(id)
    }

    /// Queue a reset of an enabled, connected port.
    pub fn reset(&mut self, id: PortId) -> Result {
        let port = self.ports.get(&id).ok_or(PortError::InvalidArg)?;
        if port.is_gone() {
            return Err(PortError::NotAllowed);
        }
        if port.state != PortState::Enabled || !port.status.connected {
            return Err(PortError::InvalidState);
        }
        self.set_actions(id, ActionFlags::RESET);
        Ok(())
    }

    /// Queue recycling: return the port to a known-idle state after
    /// the upper layers dropped its device.
    pub fn recycle(&mut self, id: PortId) -> Result {
        self.ports.get(&id).ok_or(PortError::InvalidArg)?;
        self.set_actions(id, ActionFlags::RECYCLE);
        Ok(())
    }

    /// The enumeration layer finished enumerating the port's device.
    pub fn active(&mut self, id: PortId) -> Result {
        let port = self.ports.get_mut(&id).ok_or(PortError::InvalidArg)?;
        port.flags.insert(PortFlags::ENUM_DEVICE);
        self.try_complete(id)
    }

    /// Queue disabling of an enabled port.
    pub fn disable(&mut self, id: PortId) -> Result {
        let port = self.ports.get(&id).ok_or(PortError::InvalidArg)?;
        if port.state != PortState::Enabled {
            return Err(PortError::InvalidState);
        }
        self.set_actions(id, ActionFlags::DISABLE);
        Ok(())
    }

    /// The parent hub is gone. Stops future scheduling of the port.
    ///
    /// Returns `Err(NotFinished)` while a device is still present: a
    /// DISCONNECTED event is delivered and the caller must run the
    /// recycle sequence before [`Self::remove_port`].
    pub fn gone(&mut self, id: PortId) -> Result {
        let port = self.ports.get_mut(&id).ok_or(PortError::InvalidArg)?;
        port.flags.insert(PortFlags::GONE | PortFlags::WAITING_FREE);
        if port.dev_state == DeviceState::Present {
            port.dev_state = DeviceState::NotPresent;
            port.flags.remove(PortFlags::ENUM_DEVICE);
            port.flags.insert(PortFlags::WAITING_RECYCLE);
            self.emit(id, PortEventKind::Disconnected)?;
            Err(PortError::NotFinished)
        } else {
            port.actions = ActionFlags::empty();
            self.pending.remove(id);
            Ok(())
        }
    }

    /// Stop tracking a drained port.
    ///
    /// [`Self::gone`] must have run first, and the port must have no
    /// device, no queued work and no request in flight; otherwise
    /// `InvalidState`.
    pub fn remove_port(&mut self, id: PortId) -> Result {
        let port = self.ports.get(&id).ok_or(PortError::InvalidArg)?;
        if !port.is_waiting_free()
            || port.dev_state == DeviceState::Present
            || port.is_status_locked()
            || port.is_waiting_recycle()
            || self.pending.contains(id)
        {
            return Err(PortError::InvalidState);
        }
        self.ports.remove(&id);
        debug!("Port id {id}: removed");
        Ok(())
    }

    /// Device speed, derived from the cached status. Requires a
    /// connected port.
    pub fn speed(&self, id: PortId) -> Result<DeviceSpeed> {
        let port = self.ports.get(&id).ok_or(PortError::InvalidArg)?;
        if port.is_status_outdated() || !port.status.connected {
            return Err(PortError::InvalidState);
        }
        Ok(port.status.speed())
    }

    /// Queue a forced status refresh.
    pub fn request_status(&mut self, id: PortId) -> Result {
        let port = self.ports.get_mut(&id).ok_or(PortError::InvalidArg)?;
        port.flags.insert(PortFlags::STATUS_OUTDATED);
        self.set_actions(id, ActionFlags::GET_STATUS);
        Ok(())
    }

    /// Ask for a handling pass; refreshes the status first when the
    /// cache is stale.
    pub fn req_process(&mut self, id: PortId) -> Result {
        let port = self.ports.get(&id).ok_or(PortError::InvalidArg)?;
        let action = if port.is_status_outdated() {
            ActionFlags::GET_STATUS
        } else {
            ActionFlags::HANDLE
        };
        self.set_actions(id, action);
        Ok(())
    }

    /// Completion entry point: answers the request identified by
    /// `token` with a fresh port status.
    pub fn complete(&mut self, token: RequestToken, status: PortStatus) -> Result {
        let Some(inflight) = self.inflight else {
            warn!("Completion with no request in flight");
            return Err(PortError::InvalidState);
        };
        if inflight.token != token {
            warn!("Stale completion token {:?}", token);
            return Err(PortError::InvalidState);
        }
        self.inflight = None;

        let id = inflight.port;
        let port = self.ports.get_mut(&id).ok_or(PortError::InvalidArg)?;
        trace!(
            "Port {}: {:?} completed, status {:?}",
            port.port_num, inflight.request, status
        );
        port.status = status;
        port.flags
            .remove(PortFlags::STATUS_LOCK | PortFlags::STATUS_OUTDATED);

        if port.is_gone() {
            // No further scheduling for a vanished hub; recycling, if
            // required, is queued by the owner.
            return self.try_complete(id);
        }
        self.set_actions(id, ActionFlags::HANDLE);
        Ok(())
    }

    /// The request identified by `token` could not be carried out. The
    /// port's cache is marked stale and the port is parked; recovery
    /// is the owner's call.
    pub fn complete_failed(&mut self, token: RequestToken) -> Result {
        let Some(inflight) = self.inflight else {
            warn!("Failure completion with no request in flight");
            return Err(PortError::InvalidState);
        };
        if inflight.token != token {
            warn!("Stale failure completion token {:?}", token);
            return Err(PortError::InvalidState);
        }
        self.inflight = None;

        let id = inflight.port;
        let port = self.ports.get_mut(&id).ok_or(PortError::InvalidArg)?;
        error!(
            "Port {}: {:?} failed, port parked",
            port.port_num, inflight.request
        );
        port.flags.remove(PortFlags::STATUS_LOCK);
        port.flags.insert(PortFlags::STATUS_OUTDATED);
        self.try_complete(id)
    }

    /// Drain one pending port, applying its accumulated actions in
    /// priority order until they run out or a request goes in flight.
    ///
    /// No-op while a request is outstanding or the queue is empty.
    pub fn process(&mut self) -> Result {
        if self.inflight.is_some() {
            return Ok(());
        }
        let Some(id) = self.pending.pop() else {
            return Ok(());
        };

        loop {
            let port = self.ports.get_mut(&id).ok_or(PortError::InvalidArg)?;
            if port.is_gone() {
                // Only recycling is meaningful once the hub vanished.
                port.actions &= ActionFlags::RECYCLE;
            }
            if port.is_status_locked() || port.actions.is_empty() {
                break;
            }
            let actions = port.actions;
            if actions.contains(ActionFlags::HANDLE) {
                port.actions.remove(ActionFlags::HANDLE);
                self.handle(id)?;
            } else if actions.contains(ActionFlags::DISABLE) {
                port.actions.remove(ActionFlags::DISABLE);
                self.handle_disable(id)?;
            } else if actions.contains(ActionFlags::RECYCLE) {
                port.actions.remove(ActionFlags::RECYCLE);
                self.handle_recycle(id)?;
            } else if actions.contains(ActionFlags::GET_STATUS) {
                // GET_STATUS and RESET are mutually exclusive within a
                // pass; a queued reset waits for the fresh status.
                port.actions.remove(ActionFlags::GET_STATUS);
                self.submit(id, PortRequest::GetStatus)?;
            } else if actions.contains(ActionFlags::RESET) {
                port.actions.remove(ActionFlags::RESET);
                self.handle_reset(id)?;
            }
        }

        self.try_complete(id)
    }

    /// True while a hub class request is outstanding.
    pub fn request_in_flight(&self) -> bool {
        self.inflight.is_some()
    }

    pub fn port_num(&self, id: PortId) -> Result<u8> {
        Ok(self.ports.get(&id).ok_or(PortError::InvalidArg)?.port_num)
    }

    pub fn port_state(&self, id: PortId) -> Result<PortState> {
        Ok(self.ports.get(&id).ok_or(PortError::InvalidArg)?.state)
    }

    pub fn device_state(&self, id: PortId) -> Result<DeviceState> {
        Ok(self.ports.get(&id).ok_or(PortError::InvalidArg)?.dev_state)
    }

    pub fn port_status(&self, id: PortId) -> Result<PortStatus> {
        let port = self.ports.get(&id).ok_or(PortError::InvalidArg)?;
        if port.is_status_outdated() {
            return Err(PortError::InvalidState);
        }
        Ok(port.status)
    }

    // ---------------- internals ----------------

    /// Accumulate actions and make sure the port is scheduled. Fires
    /// the parent's process request only on a fresh enqueue.
    fn set_actions(&mut self, id: PortId, actions: ActionFlags) {
        if let Some(port) = self.ports.get_mut(&id) {
            port.actions.insert(actions);
        }
        if self.pending.push(id) {
            self.idle = false;
            self.parent.process_request();
        }
    }

    /// One handling pass: evaluate the transition table and interpret
    /// its effects.
    fn handle(&mut self, id: PortId) -> Result {
        let (transition, old_state) = {
            let port = self.ports.get(&id).ok_or(PortError::InvalidArg)?;
            let status = port.status;
            let view = View {
                port_num: port.port_num,
                state: port.state,
                status: &status,
                dev_state: port.dev_state,
                status_outdated: port.is_status_outdated(),
                reset_attempts: port.reset_attempts,
                max_reset_attempts: self.max_reset_attempts,
                waiting_recycle: port.is_waiting_recycle(),
            };
            (machine::evaluate(&view), port.state)
        };

        if transition.next != old_state {
            let port = self.ports.get_mut(&id).ok_or(PortError::InvalidArg)?;
            debug!(
                "Port {}: {:?} -> {:?}",
                port.port_num, old_state, transition.next
            );
            port.state = transition.next;
        }

        for effect in transition.effects {
            self.apply(id, effect)?;
        }
        Ok(())
    }

    fn apply(&mut self, id: PortId, effect: Effect) -> Result {
        match effect {
            Effect::Submit(request) => return self.submit(id, request),
            Effect::Emit(kind) => return self.emit(id, kind),
            _ => {}
        }
        let port = self.ports.get_mut(&id).ok_or(PortError::InvalidArg)?;
        match effect {
            Effect::AttachDevice => port.dev_state = DeviceState::Present,
            Effect::DetachDevice => {
                port.dev_state = DeviceState::NotPresent;
                port.flags.remove(PortFlags::ENUM_DEVICE);
            }
            Effect::MarkRecycle => port.flags.insert(PortFlags::WAITING_RECYCLE),
            Effect::ClearRecycle => port.flags.remove(PortFlags::WAITING_RECYCLE),
            Effect::ClearResetAttempts => port.reset_attempts = 0,
            Effect::CountResetAttempt => port.reset_attempts += 1,
            Effect::Reevaluate => port.actions.insert(ActionFlags::HANDLE),
            Effect::Submit(_) | Effect::Emit(_) => {}
        }
        Ok(())
    }

    fn handle_disable(&mut self, id: PortId) -> Result {
        // The device goes away first so the enumeration layer drops it
        // before the port electrically disables.
        let had_device = {
            let port = self.ports.get(&id).ok_or(PortError::InvalidArg)?;
            port.dev_state == DeviceState::Present
        };
        if had_device {
            self.emit(id, PortEventKind::Disconnected)?;
            let port = self.ports.get_mut(&id).ok_or(PortError::InvalidArg)?;
            port.dev_state = DeviceState::NotPresent;
            port.flags.remove(PortFlags::ENUM_DEVICE);
            port.flags.insert(PortFlags::WAITING_RECYCLE);
        }
        let port = self.ports.get_mut(&id).ok_or(PortError::InvalidArg)?;
        port.state = PortState::Disabled;
        self.submit(id, PortRequest::ClearFeature(PortFeature::Enable))
    }

    fn handle_recycle(&mut self, id: PortId) -> Result {
        let port = self.ports.get_mut(&id).ok_or(PortError::InvalidArg)?;
        port.flags.remove(PortFlags::WAITING_RECYCLE);
        if port.is_gone() {
            // Last step before the owner frees the port.
            port.flags.insert(PortFlags::WAITING_FREE);
            port.actions = ActionFlags::empty();
            self.pending.remove(id);
            debug!("Port id {id}: recycled after hub removal");
        } else {
            port.reset_attempts = 0;
            port.flags.insert(PortFlags::STATUS_OUTDATED);
            port.actions.insert(ActionFlags::GET_STATUS);
            debug!("Port {}: recycled", port.port_num);
        }
        Ok(())
    }

    fn handle_reset(&mut self, id: PortId) -> Result {
        let port = self.ports.get_mut(&id).ok_or(PortError::InvalidArg)?;
        port.state = PortState::Resetting;
        self.submit(id, PortRequest::SetFeature(PortFeature::Reset))
    }

    /// Submit one class request. Exactly one may be outstanding across
    /// all ports; the completion clears the way for the next.
    fn submit(&mut self, id: PortId, request: PortRequest) -> Result {
        if self.inflight.is_some() {
            error!("Request submitted while another is in flight");
            return Err(PortError::InvalidState);
        }
        let token = RequestToken(self.next_serial);
        self.next_serial = self.next_serial.wrapping_add(1);

        let (port_num, power_on_delay) = {
            let port = self.ports.get_mut(&id).ok_or(PortError::InvalidArg)?;
            port.flags.insert(PortFlags::STATUS_LOCK);
            (port.port_num, port.power_on_delay)
        };
        self.inflight = Some(Inflight {
            token,
            port: id,
            request,
        });

        trace!("Port {port_num}: submit {request:?}");
        if let Err(e) = self.parent.submit(token, port_num, request) {
            error!("Port {port_num}: submit {request:?} failed: {e}");
            self.inflight = None;
            if let Some(port) = self.ports.get_mut(&id) {
                port.flags.remove(PortFlags::STATUS_LOCK);
                port.flags.insert(PortFlags::STATUS_OUTDATED);
            }
            return Err(PortError::Gateway);
        }

        // Pacing: power-on and reset-recovery times are the two
        // blocking waits of this driver.
        match request {
            PortRequest::SetFeature(PortFeature::Power) if !power_on_delay.is_zero() => {
                self.parent.delay(power_on_delay);
            }
            PortRequest::SetFeature(PortFeature::Reset) => {
                self.parent.delay(RESET_RECOVERY_DELAY);
            }
            _ => {}
        }
        Ok(())
    }

    fn emit(&mut self, id: PortId, kind: PortEventKind) -> Result {
        let port = self.ports.get(&id).ok_or(PortError::InvalidArg)?;
        let event = PortEvent {
            port: id,
            port_num: port.port_num,
            parent_dev_addr: port.parent_dev_addr,
            kind,
        };
        info!("Port {}: {:?}", port.port_num, kind);
        self.events.handle(&event);
        Ok(())
    }

    /// Report "all ports handled" once nothing is queued, locked or
    /// waiting for recycle anymore. Fires at most once per drain; a
    /// call on an already idle driver stays silent.
    fn try_complete(&mut self, id: PortId) -> Result {
        let port = self.ports.get(&id).ok_or(PortError::InvalidArg)?;
        if port.is_status_locked()
            || port.is_waiting_recycle()
            || !port.actions.is_empty()
            || self.pending.contains(id)
        {
            return Ok(());
        }
        if self.pending.is_empty() && self.inflight.is_none() && !self.idle {
            self.idle = true;
            debug!("All ports handled");
            self.parent.process_completed();
        }
        Ok(())
    }
}
