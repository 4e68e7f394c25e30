//! Full-cycle behavior of the heating engine against a scripted board.

use std::cell::RefCell;
use std::rc::Rc;

use solderpen::board::{Adc, Clock, Heater};
use solderpen::control::{Heating, HeatingElementStatus, PenSensorStatus, HEATING_POWER_MAX_MW};

const CORE_FREQ: u32 = 8_000_000;
const TICKS_PER_MS: u32 = CORE_FREQ / 1000;

struct TestClock;

impl Clock for TestClock {
    const CORE_FREQ: u32 = CORE_FREQ;
}

/// Which channel set the last ADC burst sampled.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
enum BurstMode {
    #[default]
    None,
    Heat,
    Idle,
}

/// Scripted board state shared between the mock heater and mock ADC.
#[derive(Default)]
struct BoardState {
    heater_on: bool,
    heater_on_calls: u32,
    heater_off_calls: u32,
    mode: BurstMode,
    heat_bursts: u32,
    idle_bursts: u32,
    /// `measure_is_done` polls swallowed before a burst reports completion.
    burst_latency: u32,
    latency_left: u32,
    heat_supply_mv: i32,
    idle_supply_mv: i32,
    cpu_mv: i32,
    heat_current_ma: i32,
    idle_current_ma: i32,
    cpu_mc: i32,
    pen_mc: i32,
    sensor_ok: bool,
    /// Set if a heat burst was armed with the gate open.
    heat_burst_while_off: bool,
    /// Set if an idle burst was armed with the gate closed.
    idle_burst_while_on: bool,
}

#[derive(Clone)]
struct Handle(Rc<RefCell<BoardState>>);

struct MockHeater(Handle);

impl Heater for MockHeater {
    fn on(&mut self) {
        let mut state = self.0 .0.borrow_mut();
        state.heater_on = true;
        state.heater_on_calls += 1;
    }

    fn off(&mut self) {
        let mut state = self.0 .0.borrow_mut();
        state.heater_on = false;
        state.heater_off_calls += 1;
    }
}

struct MockAdc(Handle);

impl Adc for MockAdc {
    fn measure_heat_start(&mut self) {
        let mut state = self.0 .0.borrow_mut();
        state.mode = BurstMode::Heat;
        state.heat_bursts += 1;
        state.latency_left = state.burst_latency;
        if !state.heater_on {
            state.heat_burst_while_off = true;
        }
    }

    fn measure_idle_start(&mut self) {
        let mut state = self.0 .0.borrow_mut();
        state.mode = BurstMode::Idle;
        state.idle_bursts += 1;
        state.latency_left = state.burst_latency;
        if state.heater_on {
            state.idle_burst_while_on = true;
        }
    }

    fn measure_is_done(&self) -> bool {
        let mut state = self.0 .0.borrow_mut();
        if state.latency_left > 0 {
            state.latency_left -= 1;
            return false;
        }
        true
    }

    fn supply_voltage_mv(&self) -> i32 {
        let state = self.0 .0.borrow();
        match state.mode {
            BurstMode::Heat => state.heat_supply_mv,
            _ => state.idle_supply_mv,
        }
    }

    fn cpu_voltage_mv(&self) -> i32 {
        self.0 .0.borrow().cpu_mv
    }

    fn pen_current_ma(&self) -> i32 {
        let state = self.0 .0.borrow();
        match state.mode {
            BurstMode::Heat => state.heat_current_ma,
            _ => state.idle_current_ma,
        }
    }

    fn cpu_temperature_mc(&self) -> i32 {
        self.0 .0.borrow().cpu_mc
    }

    fn pen_temperature_mc(&self) -> i32 {
        self.0 .0.borrow().pen_mc
    }

    fn pen_sensor_ok(&self) -> bool {
        self.0 .0.borrow().sensor_ok
    }
}

type Pen = Heating<TestClock, MockHeater, MockAdc>;

/// A pen with a nominal 2 Ω element on a slightly sagging 5 V supply.
fn healthy_board() -> BoardState {
    BoardState {
        heat_supply_mv: 4_900,
        idle_supply_mv: 5_000,
        cpu_mv: 3_300,
        heat_current_ma: 2_500,
        idle_current_ma: 0,
        cpu_mc: 20_000,
        pen_mc: 5_000,
        sensor_ok: true,
        ..Default::default()
    }
}

fn new_pen(state: BoardState) -> (Pen, Handle) {
    let handle = Handle(Rc::new(RefCell::new(state)));
    let pen = Heating::new(MockHeater(handle.clone()), MockAdc(handle.clone()));
    (pen, handle)
}

/// Run one full period with a fixed tick step; returns the number of
/// `process` calls that reported a running period.
fn run_period(pen: &mut Pen, delta_ticks: u32) -> u32 {
    pen.start();
    let mut calls = 0;
    while pen.process(delta_ticks) {
        calls += 1;
        assert!(calls < 10_000, "period did not terminate");
    }
    calls
}

#[test]
fn stopped_engine_reports_false_until_restarted() {
    let (mut pen, _board) = new_pen(healthy_board());
    assert!(!pen.process(TICKS_PER_MS));
    assert!(!pen.process(TICKS_PER_MS));
    assert_eq!(pen.power_mw(), 0);
    assert_eq!(pen.requested_power_mw(), 0);
}

#[test]
fn cold_start_saturates_and_classifies_nominal_element() {
    let (mut pen, board) = new_pen(healthy_board());
    pen.preset_mut().select(0);

    // First period runs open loop: the sensor has not been proven yet.
    run_period(&mut pen, TICKS_PER_MS);
    assert_eq!(pen.pen_sensor_status(), PenSensorStatus::Ok);
    assert_eq!(pen.real_pen_temperature_mc(), 25_000);
    assert_eq!(board.0.borrow().heater_on_calls, 0);

    // Cold tip far below the 300 °C setpoint: the request rails at the clamp.
    pen.start();
    assert_eq!(pen.requested_power_mw(), HEATING_POWER_MAX_MW);
    while pen.process(TICKS_PER_MS) {}

    let state = board.0.borrow();
    assert!(!state.heater_on);
    assert_eq!(state.heater_on_calls, 1);
    assert_eq!(state.heater_off_calls, 1);
    assert!(!state.heat_burst_while_off);
    assert!(!state.idle_burst_while_on);
    drop(state);

    // 4.9 V over 2.5 A reads as a nominal element.
    assert_eq!(pen.pen_resistance_mo(), 1_960);
    assert_eq!(pen.heating_element_status(), HeatingElementStatus::Ok);
    assert_eq!(pen.supply_voltage_mv_drop(), 4_900 - 5_000);
    // 12.25 W delivered over most of the 150 ms period
    assert!((10_000..=12_500).contains(&pen.power_mw()));
    assert!(!pen.preset().is_standby());
}

#[test]
fn heat_phase_stops_at_the_energy_budget() {
    let (mut pen, board) = new_pen(healthy_board());
    pen.preset_mut().select(0);
    run_period(&mut pen, TICKS_PER_MS);

    // Bring the tip close to the setpoint so the next requests are modest.
    board.0.borrow_mut().pen_mc = 275_000;
    run_period(&mut pen, TICKS_PER_MS); // rails while measuring the hot tip
    assert_eq!(pen.real_pen_temperature_mc(), 295_000);

    // Derivative kick suppresses this request below the heating threshold;
    // the heater must stay off for the whole period.
    let on_calls = board.0.borrow().heater_on_calls;
    run_period(&mut pen, TICKS_PER_MS);
    assert_eq!(pen.requested_power_mw(), 0);
    assert_eq!(board.0.borrow().heater_on_calls, on_calls);

    // Now a small positive request: 12.25 W delivery hits the integrated
    // budget within a few samples, long before the period runs out.
    let bursts_before = board.0.borrow().heat_bursts;
    run_period(&mut pen, TICKS_PER_MS);
    assert!(pen.requested_power_mw() > 0);
    let heat_samples = board.0.borrow().heat_bursts - bursts_before;
    assert!(heat_samples < 10, "expected an early budget stop");
    // overshoot is bounded by one sub-interval increment (81 mW here)
    assert!(pen.power_mw() > 0);
    assert!(pen.power_mw() <= pen.requested_power_mw() + 82);
    assert_eq!(pen.heating_element_status(), HeatingElementStatus::Ok);
}

#[test]
fn overcurrent_cuts_the_heat_phase_after_one_sample() {
    let (mut pen, board) = new_pen(healthy_board());
    pen.preset_mut().select(0);
    run_period(&mut pen, TICKS_PER_MS);

    board.0.borrow_mut().heat_current_ma = 7_000;
    let bursts_before = board.0.borrow().heat_bursts;
    run_period(&mut pen, TICKS_PER_MS);

    assert_eq!(board.0.borrow().heat_bursts, bursts_before + 1);
    assert_eq!(pen.pen_resistance_mo(), 4_900 * 1000 / 7_000);
    assert_eq!(
        pen.heating_element_status(),
        HeatingElementStatus::LowResistance
    );
    // low resistance alone does not force standby
    assert!(!pen.preset().is_standby());
}

#[test]
fn shorted_element_forces_standby() {
    let (mut pen, board) = new_pen(healthy_board());
    pen.preset_mut().select(0);
    run_period(&mut pen, TICKS_PER_MS);

    board.0.borrow_mut().heat_current_ma = 12_000;
    run_period(&mut pen, TICKS_PER_MS);

    assert_eq!(pen.pen_resistance_mo(), 4_900 * 1000 / 12_000);
    assert_eq!(pen.heating_element_status(), HeatingElementStatus::Shorted);
    assert!(pen.preset().is_standby());
}

#[test]
fn high_resistance_is_reported_without_standby() {
    let (mut pen, board) = new_pen(healthy_board());
    pen.preset_mut().select(0);
    run_period(&mut pen, TICKS_PER_MS);

    board.0.borrow_mut().heat_current_ma = 100;
    run_period(&mut pen, TICKS_PER_MS);

    assert_eq!(pen.pen_resistance_mo(), 49_000);
    assert_eq!(
        pen.heating_element_status(),
        HeatingElementStatus::HighResistance
    );
    assert!(!pen.preset().is_standby());
}

#[test]
fn open_element_reads_the_sentinel_and_forces_standby() {
    let (mut pen, board) = new_pen(healthy_board());
    pen.preset_mut().select(0);
    run_period(&mut pen, TICKS_PER_MS);

    // 5 mA is inside the noise floor; no resistance can be derived.
    board.0.borrow_mut().heat_current_ma = 5;
    run_period(&mut pen, TICKS_PER_MS);

    assert_eq!(pen.pen_resistance_mo(), 1_000_000_000);
    assert_eq!(pen.heating_element_status(), HeatingElementStatus::Broken);
    assert!(pen.preset().is_standby());
}

#[test]
fn broken_sensor_forces_standby_and_open_loop() {
    let (mut pen, board) = new_pen(healthy_board());
    pen.preset_mut().select(0);
    run_period(&mut pen, TICKS_PER_MS);

    board.0.borrow_mut().sensor_ok = false;
    run_period(&mut pen, TICKS_PER_MS);
    assert_eq!(pen.pen_sensor_status(), PenSensorStatus::Broken);
    // the resistance reading from this period is meaningless
    assert_eq!(pen.heating_element_status(), HeatingElementStatus::Unknown);
    assert!(pen.preset().is_standby());

    // The next period runs open loop: zero request, no heater pulse, but
    // idle measurements continue so the pen can recover.
    let on_calls = board.0.borrow().heater_on_calls;
    let idle_bursts = board.0.borrow().idle_bursts;
    pen.start();
    assert_eq!(pen.requested_power_mw(), 0);
    while pen.process(TICKS_PER_MS) {}
    assert_eq!(board.0.borrow().heater_on_calls, on_calls);
    assert!(board.0.borrow().idle_bursts > idle_bursts);
}

#[test]
fn steady_power_enters_standby_after_thirty_seconds() {
    let (mut pen, _board) = new_pen(healthy_board());
    pen.preset_mut().select(0);
    run_period(&mut pen, TICKS_PER_MS);

    // The tip never warms up, so the request stays railed and perfectly
    // steady; after 30 s of steadiness the stop phase must pull the plug.
    let mut last_energy_mwh = 0;
    let mut periods = 0;
    while !pen.preset().is_standby() {
        run_period(&mut pen, TICKS_PER_MS);
        assert!(pen.energy_mwh() >= last_energy_mwh);
        last_energy_mwh = pen.energy_mwh();
        periods += 1;
        assert!(periods < 400, "standby gate never fired");
    }

    assert!(pen.steady_ms() > 30_000);
    assert_eq!(pen.preset().temperature(), 0);
}

#[test]
fn waits_for_adc_completion_between_samples() {
    let mut state = healthy_board();
    state.burst_latency = 2; // every burst completes on the third poll
    let (mut pen, board) = new_pen(state);
    pen.preset_mut().select(0);

    run_period(&mut pen, TICKS_PER_MS);
    run_period(&mut pen, TICKS_PER_MS);

    assert_eq!(pen.real_pen_temperature_mc(), 25_000);
    assert_eq!(pen.heating_element_status(), HeatingElementStatus::Ok);
    assert_eq!(pen.pen_resistance_mo(), 1_960);
    let state = board.0.borrow();
    assert!(!state.heat_burst_while_off);
    assert!(!state.idle_burst_while_on);
}

#[test]
fn scheduling_drift_accumulates_into_the_next_period() {
    let (mut pen, _board) = new_pen(healthy_board());
    pen.preset_mut().select(0);

    // A tick step that does not divide the period: the remainder must carry
    // over instead of stretching every period to a full extra step.
    let mut total_calls = 0;
    for _ in 0..10 {
        total_calls += run_period(&mut pen, 7_777);
    }
    let ideal = 10 * 1_200_000 / 7_777;
    assert!((i64::from(total_calls) - ideal as i64).abs() < 15);
    assert_eq!(pen.uptime_ticks() % 7_777, 0);
}
