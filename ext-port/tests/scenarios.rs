//! End-to-end driver scenarios against a recording mock hub.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use ext_port::{
    DeviceSpeed, DeviceState, DriverConfig, HubParent, PortConfig, PortDriver, PortError,
    PortEvent, PortEventHandler, PortEventKind, PortFeature, PortId, PortRequest, PortState,
    PortStatus, RequestToken, Result,
};
use hub_if::port::{
    PORT_CHANGE_CONNECTION, PORT_CHANGE_RESET, PORT_STAT_CONNECTION, PORT_STAT_ENABLE,
    PORT_STAT_HIGH_SPEED, PORT_STAT_LOW_SPEED, PORT_STAT_POWER,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Submit(u8, PortRequest),
    Delay(Duration),
    ProcessRequest,
    ProcessCompleted,
    Event(u8, PortEventKind),
}

#[derive(Default)]
struct Log {
    ops: Vec<Op>,
    last_token: Option<RequestToken>,
}

struct MockHub(Rc<RefCell<Log>>);

impl HubParent for MockHub {
    fn submit(&mut self, token: RequestToken, port_num: u8, request: PortRequest) -> Result {
        let mut log = self.0.borrow_mut();
        log.ops.push(Op::Submit(port_num, request));
        log.last_token = Some(token);
        Ok(())
    }

    fn delay(&mut self, duration: Duration) {
        self.0.borrow_mut().ops.push(Op::Delay(duration));
    }

    fn process_request(&mut self) {
        self.0.borrow_mut().ops.push(Op::ProcessRequest);
    }

    fn process_completed(&mut self) {
        self.0.borrow_mut().ops.push(Op::ProcessCompleted);
    }
}

struct MockEvents(Rc<RefCell<Log>>);

impl PortEventHandler for MockEvents {
    fn handle(&mut self, event: &PortEvent) {
        self.0
            .borrow_mut()
            .ops
            .push(Op::Event(event.port_num, event.kind));
    }
}

struct Harness {
    driver: PortDriver,
    log: Rc<RefCell<Log>>,
}

impl Harness {
    fn new() -> Self {
        let log = Rc::new(RefCell::new(Log::default()));
        let driver = PortDriver::install(
            DriverConfig::default(),
            Box::new(MockHub(log.clone())),
            Box::new(MockEvents(log.clone())),
        );
        Self { driver, log }
    }

    fn config() -> PortConfig {
        PortConfig {
            port_num: 1,
            parent_dev_addr: 2,
            power_on_delay: Duration::from_millis(100),
        }
    }

    fn token(&self) -> RequestToken {
        self.log.borrow().last_token.expect("no request submitted")
    }

    /// Answer the outstanding request with a raw status and run the
    /// queue.
    fn complete_raw(&mut self, status: u16, change: u16) {
        let token = self.token();
        self.driver
            .complete(token, PortStatus::from_raw(status, change))
            .unwrap();
        self.driver.process().unwrap();
    }

    fn submits(&self) -> Vec<PortRequest> {
        self.log
            .borrow()
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Submit(_, r) => Some(*r),
                _ => None,
            })
            .collect()
    }

    fn events(&self) -> Vec<PortEventKind> {
        self.log
            .borrow()
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Event(_, kind) => Some(*kind),
                _ => None,
            })
            .collect()
    }

    fn count(&self, op: &Op) -> usize {
        self.log.borrow().ops.iter().filter(|o| *o == op).count()
    }

    fn position(&self, op: &Op) -> Option<usize> {
        self.log.borrow().ops.iter().position(|o| o == op)
    }

    /// Take a fresh port through power-on, connect, reset and enable;
    /// ends drained with a Connected event delivered.
    fn enabled_port(&mut self, speed_bit: u16) -> PortId {
        let id = self.driver.new_port(Self::config()).unwrap();
        self.driver.process().unwrap(); // GetStatus
        self.complete_raw(
            PORT_STAT_POWER | PORT_STAT_CONNECTION,
            PORT_CHANGE_CONNECTION,
        ); // ClearFeature(CConnection)
        self.complete_raw(PORT_STAT_POWER | PORT_STAT_CONNECTION, 0); // SetFeature(Reset)
        self.complete_raw(
            PORT_STAT_POWER | PORT_STAT_CONNECTION | PORT_STAT_ENABLE,
            PORT_CHANGE_RESET,
        ); // ClearFeature(CReset)
        self.complete_raw(
            PORT_STAT_POWER | PORT_STAT_CONNECTION | PORT_STAT_ENABLE | speed_bit,
            0,
        );
        assert_eq!(self.driver.device_state(id), Ok(DeviceState::Present));
        id
    }
}

#[test]
fn scenario_new_port_reads_status_once() {
    let mut h = Harness::new();
    let id = h.driver.new_port(Harness::config()).unwrap();

    // Exactly one "please call process" for the fresh enqueue.
    assert_eq!(h.count(&Op::ProcessRequest), 1);
    assert!(h.submits().is_empty());

    h.driver.process().unwrap();
    assert_eq!(h.submits(), vec![PortRequest::GetStatus]);
    assert_eq!(h.driver.port_state(id), Ok(PortState::PoweredOff));
    assert!(h.driver.request_in_flight());
    assert_eq!(h.count(&Op::ProcessCompleted), 0);
}

#[test]
fn scenario_power_on_pacing_then_idle() {
    let mut h = Harness::new();
    let id = h.driver.new_port(Harness::config()).unwrap();
    h.driver.process().unwrap();

    // Port is unpowered: SetFeature(POWER) with the configured pacing.
    h.complete_raw(0, 0);
    assert_eq!(
        h.submits(),
        vec![
            PortRequest::GetStatus,
            PortRequest::SetFeature(PortFeature::Power),
        ]
    );
    assert_eq!(h.count(&Op::Delay(Duration::from_millis(100))), 1);
    assert_eq!(h.driver.port_state(id), Ok(PortState::Disconnected));

    // Powered, nothing attached: queue drains and the hub is told.
    h.complete_raw(PORT_STAT_POWER, 0);
    assert_eq!(h.submits().len(), 2);
    assert!(!h.driver.request_in_flight());
    assert_eq!(h.count(&Op::ProcessCompleted), 1);
}

#[test]
fn scenario_connect_reset_enable() {
    let mut h = Harness::new();
    let id = h.enabled_port(PORT_STAT_HIGH_SPEED);

    assert_eq!(
        h.submits(),
        vec![
            PortRequest::GetStatus,
            PortRequest::ClearFeature(PortFeature::CConnection),
            PortRequest::SetFeature(PortFeature::Reset),
            PortRequest::ClearFeature(PortFeature::CReset),
        ]
    );
    // Reset recovery pacing happened.
    assert_eq!(h.count(&Op::Delay(Duration::from_millis(50))), 1);
    assert_eq!(h.events(), vec![PortEventKind::Connected]);
    assert_eq!(h.driver.port_state(id), Ok(PortState::Enabled));
    assert_eq!(h.driver.speed(id), Ok(DeviceSpeed::High));
    assert_eq!(h.count(&Op::ProcessCompleted), 1);
}

#[test]
fn speed_follows_status_bits() {
    let mut h = Harness::new();
    let id = h.enabled_port(PORT_STAT_LOW_SPEED);
    assert_eq!(h.driver.speed(id), Ok(DeviceSpeed::Low));

    let mut h = Harness::new();
    let id = h.enabled_port(0);
    assert_eq!(h.driver.speed(id), Ok(DeviceSpeed::Full));
}

#[test]
fn scenario_disable_emits_disconnect_first() {
    let mut h = Harness::new();
    let id = h.enabled_port(PORT_STAT_HIGH_SPEED);
    h.driver.active(id).unwrap();

    h.driver.disable(id).unwrap();
    h.driver.process().unwrap();

    // DISCONNECTED reaches the client before the port is electrically
    // disabled.
    let event = h.position(&Op::Event(1, PortEventKind::Disconnected)).unwrap();
    let clear = h
        .position(&Op::Submit(1, PortRequest::ClearFeature(PortFeature::Enable)))
        .unwrap();
    assert!(event < clear);
    assert_eq!(h.driver.device_state(id), Ok(DeviceState::NotPresent));

    let submits_before = h.submits().len();
    h.complete_raw(PORT_STAT_POWER | PORT_STAT_CONNECTION, 0);
    assert_eq!(h.submits().len(), submits_before);
    assert_eq!(h.driver.port_state(id), Ok(PortState::Disabled));
    assert_eq!(h.count(&Op::ProcessCompleted), 2);
}

#[test]
fn scenario_reset_attempts_exhaust() {
    let mut h = Harness::new();
    let id = h.driver.new_port(Harness::config()).unwrap();
    h.driver.process().unwrap();
    h.complete_raw(
        PORT_STAT_POWER | PORT_STAT_CONNECTION,
        PORT_CHANGE_CONNECTION,
    );
    // First (and only, with the default budget) reset try.
    h.complete_raw(PORT_STAT_POWER | PORT_STAT_CONNECTION, 0);
    // Reset never completed: the port parks instead of retrying.
    h.complete_raw(PORT_STAT_POWER | PORT_STAT_CONNECTION, 0);
    assert_eq!(h.driver.port_state(id), Ok(PortState::Disconnected));

    let resets = |h: &Harness| {
        h.submits()
            .iter()
            .filter(|r| **r == PortRequest::SetFeature(PortFeature::Reset))
            .count()
    };
    assert_eq!(resets(&h), 1);

    // A forced refresh still produces no reset, and no crash.
    h.driver.request_status(id).unwrap();
    h.driver.process().unwrap();
    h.complete_raw(PORT_STAT_POWER | PORT_STAT_CONNECTION, 0);
    assert_eq!(resets(&h), 1);

    // Explicit reset is rejected: the port is not enabled.
    assert_eq!(h.driver.reset(id), Err(PortError::InvalidState));
}

#[test]
fn round_trip_to_removal() {
    let mut h = Harness::new();
    let id = h.enabled_port(PORT_STAT_HIGH_SPEED);
    h.driver.active(id).unwrap();

    // Unplug.
    h.driver.request_status(id).unwrap();
    h.driver.process().unwrap();
    h.complete_raw(PORT_STAT_POWER, PORT_CHANGE_CONNECTION);
    assert_eq!(
        h.events(),
        vec![PortEventKind::Connected, PortEventKind::Disconnected]
    );
    assert_eq!(h.driver.device_state(id), Ok(DeviceState::NotPresent));

    // Recycle pending: the drain notification is withheld.
    let completed = h.count(&Op::ProcessCompleted);
    h.complete_raw(PORT_STAT_POWER, 0);
    assert_eq!(h.driver.port_state(id), Ok(PortState::Disconnected));
    assert_eq!(h.count(&Op::ProcessCompleted), completed);

    h.driver.recycle(id).unwrap();
    h.driver.process().unwrap();
    h.complete_raw(PORT_STAT_POWER, 0);
    assert_eq!(h.count(&Op::ProcessCompleted), completed + 1);

    assert_eq!(h.driver.gone(id), Ok(()));
    assert_eq!(h.driver.remove_port(id), Ok(()));
    assert_eq!(h.driver.port_state(id), Err(PortError::InvalidArg));
}

#[test]
fn gone_with_device_requires_recycle() {
    let mut h = Harness::new();
    let id = h.enabled_port(PORT_STAT_HIGH_SPEED);
    h.driver.active(id).unwrap();

    assert_eq!(h.driver.gone(id), Err(PortError::NotFinished));
    assert_eq!(
        h.events(),
        vec![PortEventKind::Connected, PortEventKind::Disconnected]
    );
    assert_eq!(h.driver.device_state(id), Ok(DeviceState::NotPresent));

    // Freeing is refused until the recycle ran.
    assert_eq!(h.driver.remove_port(id), Err(PortError::InvalidState));

    h.driver.recycle(id).unwrap();
    h.driver.process().unwrap();
    assert_eq!(h.driver.remove_port(id), Ok(()));
}

#[test]
fn removal_requires_gone_first() {
    let mut h = Harness::new();
    let id = h.driver.new_port(Harness::config()).unwrap();
    h.driver.process().unwrap();
    h.complete_raw(PORT_STAT_POWER, 0); // drained, nothing attached

    // Even a fully drained port stays tracked until the parent hub is
    // reported gone.
    assert_eq!(h.driver.remove_port(id), Err(PortError::InvalidState));
    assert_eq!(h.driver.gone(id), Ok(()));
    assert_eq!(h.driver.remove_port(id), Ok(()));
}

#[test]
fn drain_notification_is_edge_triggered() {
    let mut h = Harness::new();
    let id = h.enabled_port(PORT_STAT_HIGH_SPEED);
    assert_eq!(h.count(&Op::ProcessCompleted), 1);

    // The driver is already drained; marking the device enumerated
    // must not re-notify the hub.
    h.driver.active(id).unwrap();
    h.driver.active(id).unwrap();
    assert_eq!(h.count(&Op::ProcessCompleted), 1);

    // The next drain notifies again.
    h.driver.req_process(id).unwrap();
    h.driver.process().unwrap();
    assert_eq!(h.count(&Op::ProcessCompleted), 2);
}

#[test]
fn req_process_is_idempotent() {
    let mut h = Harness::new();
    let id = h.driver.new_port(Harness::config()).unwrap();
    h.driver.process().unwrap();
    h.complete_raw(PORT_STAT_POWER, 0); // drained, status fresh

    let requests = h.count(&Op::ProcessRequest);
    h.driver.req_process(id).unwrap();
    h.driver.req_process(id).unwrap();
    h.driver.req_process(id).unwrap();
    assert_eq!(h.count(&Op::ProcessRequest), requests + 1);

    // One handling pass, no status re-read: the cache is trusted.
    let submits = h.submits().len();
    h.driver.process().unwrap();
    assert_eq!(h.submits().len(), submits);
    assert!(!h.driver.request_in_flight());
}

#[test]
fn stale_completions_are_rejected() {
    let mut h = Harness::new();
    h.driver.new_port(Harness::config()).unwrap();
    h.driver.process().unwrap();

    let token = h.token();
    h.driver
        .complete(token, PortStatus::from_raw(PORT_STAT_POWER, 0))
        .unwrap();
    assert_eq!(
        h.driver.complete(token, PortStatus::default()),
        Err(PortError::InvalidState)
    );
}

#[test]
fn invalid_handles_and_states() {
    let mut h = Harness::new();
    assert_eq!(
        h.driver.new_port(PortConfig {
            port_num: 0,
            parent_dev_addr: 2,
            power_on_delay: Duration::ZERO,
        }),
        Err(PortError::InvalidArg)
    );
    assert_eq!(h.driver.reset(99), Err(PortError::InvalidArg));
    assert_eq!(h.driver.recycle(99), Err(PortError::InvalidArg));
    assert_eq!(h.driver.gone(99), Err(PortError::InvalidArg));
    assert_eq!(h.driver.speed(99), Err(PortError::InvalidArg));

    let id = h.driver.new_port(Harness::config()).unwrap();
    // Not enabled yet.
    assert_eq!(h.driver.disable(id), Err(PortError::InvalidState));
    assert_eq!(h.driver.reset(id), Err(PortError::InvalidState));
    assert_eq!(h.driver.speed(id), Err(PortError::InvalidState));
}

#[test]
fn uninstall_refused_while_work_pending() {
    let mut h = Harness::new();
    h.driver.new_port(Harness::config()).unwrap();

    let driver = match h.driver.uninstall() {
        Err(driver) => driver,
        Ok(()) => panic!("uninstall must fail with queued work"),
    };
    h.driver = driver;

    h.driver.process().unwrap();
    h.complete_raw(PORT_STAT_POWER, 0);
    assert!(h.driver.uninstall().is_ok());
}

#[test]
fn explicit_reset_of_enumerated_device() {
    let mut h = Harness::new();
    let id = h.enabled_port(PORT_STAT_HIGH_SPEED);
    h.driver.active(id).unwrap();

    h.driver.reset(id).unwrap();
    h.driver.process().unwrap();
    assert_eq!(h.driver.port_state(id), Ok(PortState::Resetting));
    // Device object survives an explicit reset.
    assert_eq!(h.driver.device_state(id), Ok(DeviceState::Present));

    h.complete_raw(
        PORT_STAT_POWER | PORT_STAT_CONNECTION | PORT_STAT_ENABLE,
        PORT_CHANGE_RESET,
    );
    h.complete_raw(
        PORT_STAT_POWER | PORT_STAT_CONNECTION | PORT_STAT_ENABLE | PORT_STAT_HIGH_SPEED,
        0,
    );
    assert_eq!(h.driver.port_state(id), Ok(PortState::Enabled));
    assert_eq!(
        h.events(),
        vec![PortEventKind::Connected, PortEventKind::ResetCompleted]
    );
}
