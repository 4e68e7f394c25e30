//! Drives the pen's heating element through a time-multiplexed
//! heat/measure cycle.
//!
//! Heater current swamps the microvolt thermocouple signal, so power
//! delivery and measurement are mutually exclusive. Each period runs
//! START → HEATING → STABILIZE → IDLE → STOP: START commits the PID power
//! request, HEATING integrates delivered energy with the gate closed until
//! the period's energy budget, the overcurrent limit or the period timeout
//! trips, STABILIZE lets transients settle with the gate open, IDLE samples
//! the thermocouple and die temperature, and STOP evaluates the
//! auto-standby gate.

pub mod pid;

use core::marker::PhantomData;

use crate::board::{Adc, Clock, Heater};
use crate::preset::Preset;
use self::pid::Pid;

/// Length of one full heat/measure period in ms.
pub const PERIOD_TIME_MS: i64 = 150;

/// Shortest permissible period in ms.
pub const PERIOD_TIME_MIN_MS: i64 = 50;

/// Steady requested power for longer than this enters standby, in ms.
pub const STANDBY_TIME_MS: i64 = 30_000;

/// Hard clamp on the requested heater power in mW.
pub const HEATING_POWER_MAX_MW: i32 = 40 * 1000;

/// Proportional gain of the tip temperature loop, milli-units.
pub const PID_K_PROPORTIONAL: i32 = 700;

/// Integral gain of the tip temperature loop, milli-units.
pub const PID_K_INTEGRAL: i32 = 200;

/// Derivative gain of the tip temperature loop, milli-units.
pub const PID_K_DERIVATE: i32 = 100;

/// Minimum idle sampling window left in every period, in ms.
const IDLE_MIN_TIME_MS: i64 = 8;

/// Settling time between heater-off and idle sampling, in ms.
const STABILIZE_TIME_MS: i64 = 2;

/// Requested powers below this skip the heat phase entirely, in mW.
const HEATING_MIN_POWER_MW: i32 = 100;

/// Overcurrent cutoff for the element, in mA.
const PEN_MAX_CURRENT_MA: i32 = 6_000;

/// Element resistances below this classify as shorted, in mΩ.
const PEN_RESISTANCE_SHORTED_MO: i32 = 500;

/// Lower bound of the nominal element resistance band, in mΩ.
const PEN_RESISTANCE_MIN_MO: i32 = 1_500;

/// Upper bound of the nominal element resistance band, in mΩ.
const PEN_RESISTANCE_MAX_MO: i32 = 2_500;

/// Element resistances above this classify as broken, in mΩ.
const PEN_RESISTANCE_BROKEN_MO: i32 = 100_000;

/// Resistance sentinel reported while the element current is in the noise.
const PEN_RESISTANCE_OPEN_MO: i32 = 1_000_000_000;

/// The period must leave room for the stabilize and idle windows.
const _: () = assert!(PERIOD_TIME_MS >= PERIOD_TIME_MIN_MS);

/// Health of the heating element, classified from its measured resistance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HeatingElementStatus {
    /// No completed heat phase has classified the element yet.
    Unknown,
    /// Resistance inside the nominal band.
    Ok,
    /// Resistance below the short threshold.
    Shorted,
    /// Resistance below the nominal band.
    LowResistance,
    /// Resistance above the nominal band.
    HighResistance,
    /// Resistance above the open-circuit threshold.
    Broken,
}

/// Health of the pen's temperature sensor path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PenSensorStatus {
    /// No completed idle phase has checked the sensor yet.
    Unknown,
    /// The sensor path reads back sane values.
    Ok,
    /// The ADC sanity bit reports an open sensor path.
    Broken,
    /// Reserved; no detection algorithm produces this yet.
    Shorted,
}

/// Phases of one heating/measurement period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum State {
    /// Period ended; the caller must re-arm with [`Heating::start`].
    Stop,
    /// Reset accumulators and choose between heating and idling.
    Start,
    /// Gate closed, energy integration running.
    Heating,
    /// Gate open, waiting for transients to settle.
    Stabilize,
    /// Gate open, sampling the idle channels.
    Idle,
}

/// The time-multiplexed heating and measurement cycle engine.
///
/// The caller commits a period with [`Heating::start`] and then steps the
/// machine with [`Heating::process`], passing the ticks elapsed since the
/// previous call, until it returns `false`. The engine owns the heater gate
/// and the ADC bank for the whole period.
pub struct Heating<K, H, A> {
    /// The heater gate.
    heater: H,
    /// The measurement channel bank.
    adc: A,
    /// The user's setpoint record.
    preset: Preset,
    /// The tip temperature loop.
    pid: Pid,
    /// Current phase.
    state: State,
    /// Total ticks fed to [`Heating::process`] over the engine's lifetime.
    uptime_ticks: u64,
    /// Delivered energy this period, µW·ticks.
    power_uwpt: i64,
    /// This period's integrated energy budget, µW·ticks.
    requested_power_uwpt: i64,
    /// Lifetime delivered energy, µW·ticks.
    energy_uwt: i64,
    /// Ticks since the requested power last moved outside the steady band.
    steady_ticks: i64,
    /// Ticks in one full period.
    period_ticks: i64,
    /// Ticks left in the running period; drives the phase timeouts.
    remaining_ticks: i64,
    /// Ticks accumulated in the current sub-phase window.
    measure_ticks: i64,
    /// Samples accumulated in the current averaging window.
    measurements_count: i32,
    /// This period's PID-ordered power in mW.
    requested_power_mw: i32,
    /// CPU rail voltage averaged over the heat phase, mV.
    cpu_voltage_mv_heat: i32,
    /// CPU rail voltage averaged over the idle phase, mV.
    cpu_voltage_mv_idle: i32,
    /// Supply voltage averaged over the heat phase, mV.
    supply_voltage_mv_heat: i32,
    /// Supply voltage averaged over the idle phase, mV.
    supply_voltage_mv_idle: i32,
    /// Supply sag between idle and heat phases, mV.
    supply_voltage_mv_drop: i32,
    /// Element current averaged over the heat phase, mA.
    pen_current_ma_heat: i32,
    /// Element current averaged over the idle phase, mA.
    pen_current_ma_idle: i32,
    /// Element resistance derived from the heat phase, mΩ.
    pen_resistance_mo: i32,
    /// Thermocouple temperature difference averaged over the idle phase, m°C.
    pen_temperature_mc: i32,
    /// Die temperature averaged over the idle phase, m°C.
    cpu_temperature_mc: i32,
    /// Long running average of the requested power, for the steady detector.
    average_requested_power: i32,
    /// Short running average of the requested power, for the steady detector.
    average_requested_power_short: i32,
    /// Element health from the last completed heat phase.
    heating_element_status: HeatingElementStatus,
    /// Sensor health from the last completed idle phase.
    pen_sensor_status: PenSensorStatus,
    /// Binds the engine to its tick source.
    _clock: PhantomData<K>,
}

impl<K: Clock, H: Heater, A: Adc> Heating<K, H, A> {
    /// Create an engine owning the given heater gate and ADC bank.
    ///
    /// The engine starts in STOP with the preset record in standby; nothing
    /// happens until the first [`Heating::start`].
    pub fn new(heater: H, adc: A) -> Self {
        Self {
            heater,
            adc,
            preset: Preset::default(),
            pid: Pid::new(
                PID_K_PROPORTIONAL,
                PID_K_INTEGRAL,
                PID_K_DERIVATE,
                (1000 / PERIOD_TIME_MS) as i32,
                HEATING_POWER_MAX_MW,
            ),
            state: State::Stop,
            uptime_ticks: 0,
            power_uwpt: 0,
            requested_power_uwpt: 0,
            energy_uwt: 0,
            steady_ticks: 0,
            period_ticks: 0,
            remaining_ticks: 0,
            measure_ticks: 0,
            measurements_count: 0,
            requested_power_mw: 0,
            cpu_voltage_mv_heat: 0,
            cpu_voltage_mv_idle: 0,
            supply_voltage_mv_heat: 0,
            supply_voltage_mv_idle: 0,
            supply_voltage_mv_drop: 0,
            pen_current_ma_heat: 0,
            pen_current_ma_idle: 0,
            pen_resistance_mo: 0,
            pen_temperature_mc: 0,
            cpu_temperature_mc: 0,
            average_requested_power: 0,
            average_requested_power_short: 0,
            heating_element_status: HeatingElementStatus::Unknown,
            pen_sensor_status: PenSensorStatus::Unknown,
            _clock: PhantomData,
        }
    }

    /// The user's setpoint record.
    pub fn preset(&self) -> &Preset {
        &self.preset
    }

    /// Mutable access to the setpoint record, for the UI layer.
    pub fn preset_mut(&mut self) -> &mut Preset {
        &mut self.preset
    }

    /// Commit a new period.
    ///
    /// Runs one PID step against the preset's effective setpoint (zero power
    /// with a reset controller when the sensor is not healthy) and re-arms
    /// the period budget. Scheduling drift accumulates in the remaining-tick
    /// counter instead of being discarded.
    pub fn start(&mut self) {
        let power_mw = if self.pen_sensor_status == PenSensorStatus::Ok {
            self.pid
                .process(self.real_pen_temperature_mc(), self.preset.temperature())
        } else {
            self.pid.reset();
            0
        };
        self.period_ticks = Self::ms_to_ticks(PERIOD_TIME_MS);
        self.remaining_ticks += self.period_ticks;
        self.requested_power_mw = power_mw;
        self.requested_power_uwpt = i64::from(power_mw) * self.period_ticks * 1000;
        self.state = State::Start;
        trace!("period start, {} mW requested", power_mw);
    }

    /// Advance the state machine by `delta_ticks`.
    ///
    /// Returns `true` while a period is running and `false` once it reached
    /// STOP; the caller must then call [`Heating::start`] before another
    /// period runs. Calls are cheap and may be no-ops while an ADC burst is
    /// still in flight.
    pub fn process(&mut self, delta_ticks: u32) -> bool {
        self.uptime_ticks += u64::from(delta_ticks);
        self.remaining_ticks -= i64::from(delta_ticks);
        self.steady_ticks += i64::from(delta_ticks);
        match self.state {
            State::Stop => {
                self.phase_stop();
                return false;
            }
            State::Start => self.phase_start(),
            State::Heating => self.phase_heating(delta_ticks),
            State::Stabilize => self.phase_stabilize(delta_ticks),
            State::Idle => self.phase_idle(),
        }
        true
    }

    /// Delivered power over the current period so far, in mW.
    pub fn power_mw(&self) -> i32 {
        if self.period_ticks == 0 {
            return 0;
        }
        (self.power_uwpt / self.period_ticks / 1000) as i32
    }

    /// This period's requested power in mW.
    pub fn requested_power_mw(&self) -> i32 {
        self.requested_power_mw
    }

    /// Measured element resistance in mΩ.
    pub fn pen_resistance_mo(&self) -> i32 {
        self.pen_resistance_mo
    }

    /// Total delivered energy in mWh.
    pub fn energy_mwh(&self) -> i32 {
        (self.energy_uwt / i64::from(K::CORE_FREQ) / 1000 / 3600) as i32
    }

    /// How long the requested power has been steady, in ms.
    pub fn steady_ms(&self) -> i64 {
        self.steady_ticks / (i64::from(K::CORE_FREQ) / 1000)
    }

    /// Total ticks fed to the engine.
    pub fn uptime_ticks(&self) -> u64 {
        self.uptime_ticks
    }

    /// CPU rail voltage averaged over the heat phase, in mV.
    pub fn cpu_voltage_mv_heat(&self) -> i32 {
        self.cpu_voltage_mv_heat
    }

    /// CPU rail voltage averaged over the idle phase, in mV.
    pub fn cpu_voltage_mv_idle(&self) -> i32 {
        self.cpu_voltage_mv_idle
    }

    /// Supply voltage averaged over the heat phase, in mV.
    pub fn supply_voltage_mv_heat(&self) -> i32 {
        self.supply_voltage_mv_heat
    }

    /// Supply voltage averaged over the idle phase, in mV.
    pub fn supply_voltage_mv_idle(&self) -> i32 {
        self.supply_voltage_mv_idle
    }

    /// Element current averaged over the heat phase, in mA.
    pub fn pen_current_ma_heat(&self) -> i32 {
        self.pen_current_ma_heat
    }

    /// Element current averaged over the idle phase, in mA.
    pub fn pen_current_ma_idle(&self) -> i32 {
        self.pen_current_ma_idle
    }

    /// Supply sag between the idle and heat phases, in mV.
    pub fn supply_voltage_mv_drop(&self) -> i32 {
        self.supply_voltage_mv_drop
    }

    /// Die temperature in m°C, the thermocouple's cold junction.
    pub fn cpu_temperature_mc(&self) -> i32 {
        self.cpu_temperature_mc
    }

    /// Thermocouple temperature difference across the pen, in m°C.
    pub fn pen_temperature_mc(&self) -> i32 {
        self.pen_temperature_mc
    }

    /// Cold-junction compensated tip temperature in m°C.
    pub fn real_pen_temperature_mc(&self) -> i32 {
        self.cpu_temperature_mc + self.pen_temperature_mc
    }

    /// Element health from the last completed heat phase.
    pub fn heating_element_status(&self) -> HeatingElementStatus {
        self.heating_element_status
    }

    /// Sensor health from the last completed idle phase.
    pub fn pen_sensor_status(&self) -> PenSensorStatus {
        self.pen_sensor_status
    }

    /// Ticks in the given number of milliseconds.
    fn ms_to_ticks(time_ms: i64) -> i64 {
        time_ms * i64::from(K::CORE_FREQ) / 1000
    }

    /// STOP: enter standby when the pen is faulted or has been steady for
    /// too long.
    fn phase_stop(&mut self) {
        let faulted = self.pen_sensor_status != PenSensorStatus::Ok
            || self.heating_element_status == HeatingElementStatus::Shorted
            || self.heating_element_status == HeatingElementStatus::Broken;
        if faulted || self.steady_ms() > STANDBY_TIME_MS {
            self.preset.set_standby();
        }
    }

    /// START: reset the heat-side accumulators, update the steady detector
    /// and begin the heat phase, or skip straight to idle sampling when the
    /// requested power is in the noise.
    fn phase_start(&mut self) {
        self.measure_ticks = 0;
        self.measurements_count = 0;
        self.cpu_voltage_mv_heat = 0;
        self.supply_voltage_mv_heat = 0;
        self.pen_current_ma_heat = 0;
        self.pen_current_ma_idle = 0;
        self.power_uwpt = 0;

        // Weighted running averages of the requested power; their difference
        // acts as the derivative the auto-standby detector watches. Both
        // filters are biased by the integer pre-scaling.
        // TODO: replace with an unbiased fixed-point EMA once the standby
        // timing can be re-tuned against real usage.
        self.average_requested_power_short =
            (2 * self.average_requested_power_short + self.requested_power_mw) / 3;
        self.average_requested_power =
            (9 * self.average_requested_power + self.requested_power_mw) / 10;
        let derivate =
            self.average_requested_power_short - self.average_requested_power;
        if derivate > 150 || derivate < -200 {
            self.steady_ticks = 0;
        }

        if self.requested_power_mw < HEATING_MIN_POWER_MW {
            self.adc.measure_idle_start();
            self.requested_power_mw = 0;
            self.requested_power_uwpt = 0;
            self.steady_ticks = 0;
            self.state = State::Idle;
            return;
        }

        self.heater.on();
        self.adc.measure_heat_start();
        self.heating_element_status = HeatingElementStatus::Unknown;
        self.pen_sensor_status = PenSensorStatus::Unknown;
        self.state = State::Heating;
    }

    /// HEATING: accumulate heat-phase samples and integrate delivered
    /// energy until the stop predicate trips, then derive the element
    /// health.
    fn phase_heating(&mut self, delta_ticks: u32) {
        self.measure_ticks += i64::from(delta_ticks);
        if !self.adc.measure_is_done() {
            return;
        }
        self.measurements_count += 1;
        self.cpu_voltage_mv_heat += self.adc.cpu_voltage_mv();
        self.supply_voltage_mv_heat += self.adc.supply_voltage_mv();
        self.pen_current_ma_heat += self.adc.pen_current_ma();
        self.power_uwpt += i64::from(self.adc.supply_voltage_mv())
            * i64::from(self.adc.pen_current_ma())
            * self.measure_ticks;
        self.measure_ticks = 0;

        let overcurrent =
            self.pen_current_ma_heat / self.measurements_count > PEN_MAX_CURRENT_MA;
        if overcurrent {
            warn!(
                "element overcurrent at {} mA, cutting heat phase",
                self.pen_current_ma_heat / self.measurements_count
            );
        }
        let budget_reached = self.power_uwpt > self.requested_power_uwpt;
        let period_ending = self.remaining_ticks
            < Self::ms_to_ticks(STABILIZE_TIME_MS + IDLE_MIN_TIME_MS);
        if !(overcurrent || budget_reached || period_ending) {
            self.adc.measure_heat_start();
            return;
        }

        self.heater.off();
        self.energy_uwt += self.power_uwpt;
        self.cpu_voltage_mv_heat /= self.measurements_count;
        self.supply_voltage_mv_heat /= self.measurements_count;
        self.pen_current_ma_heat /= self.measurements_count;
        // Compensate with the idle current offset; the absolute value keeps
        // a reversed current sensor usable.
        self.pen_current_ma_heat =
            (self.pen_current_ma_heat - self.pen_current_ma_idle).abs();
        self.pen_resistance_mo = if self.pen_current_ma_heat > 10 {
            self.supply_voltage_mv_heat * 1000 / self.pen_current_ma_heat
        } else {
            PEN_RESISTANCE_OPEN_MO
        };
        self.supply_voltage_mv_drop =
            self.supply_voltage_mv_heat - self.supply_voltage_mv_idle;
        self.heating_element_status = if self.pen_resistance_mo < PEN_RESISTANCE_SHORTED_MO {
            HeatingElementStatus::Shorted
        } else if self.pen_resistance_mo < PEN_RESISTANCE_MIN_MO {
            HeatingElementStatus::LowResistance
        } else if self.pen_resistance_mo > PEN_RESISTANCE_BROKEN_MO {
            HeatingElementStatus::Broken
        } else if self.pen_resistance_mo > PEN_RESISTANCE_MAX_MO {
            HeatingElementStatus::HighResistance
        } else {
            HeatingElementStatus::Ok
        };
        if self.heating_element_status != HeatingElementStatus::Ok {
            debug!(
                "element classified {} at {} mΩ",
                self.heating_element_status, self.pen_resistance_mo
            );
        }
        self.state = State::Stabilize;
    }

    /// STABILIZE: wait with the gate open for the current sense amplifier
    /// and supply rails to settle, then arm the idle burst.
    fn phase_stabilize(&mut self, delta_ticks: u32) {
        self.measure_ticks += i64::from(delta_ticks);
        if self.measure_ticks < Self::ms_to_ticks(STABILIZE_TIME_MS) {
            return;
        }
        self.adc.measure_idle_start();
        self.measure_ticks = 0;
        self.measurements_count = 0;
        self.cpu_voltage_mv_idle = 0;
        self.supply_voltage_mv_idle = 0;
        self.cpu_temperature_mc = 0;
        self.pen_temperature_mc = 0;
        self.state = State::Idle;
    }

    /// IDLE: accumulate idle-phase samples until the period runs out, then
    /// average them and derive the sensor health.
    fn phase_idle(&mut self) {
        if !self.adc.measure_is_done() {
            return;
        }
        self.cpu_voltage_mv_idle += self.adc.cpu_voltage_mv();
        self.supply_voltage_mv_idle += self.adc.supply_voltage_mv();
        self.pen_current_ma_idle += self.adc.pen_current_ma();
        self.cpu_temperature_mc += self.adc.cpu_temperature_mc();
        self.pen_temperature_mc += self.adc.pen_temperature_mc();
        self.measurements_count += 1;
        if self.remaining_ticks > 0 {
            self.adc.measure_idle_start();
            return;
        }
        self.cpu_voltage_mv_idle /= self.measurements_count;
        self.supply_voltage_mv_idle /= self.measurements_count;
        self.pen_current_ma_idle /= self.measurements_count;
        self.cpu_temperature_mc /= self.measurements_count;
        self.pen_temperature_mc /= self.measurements_count;
        if self.adc.pen_sensor_ok() {
            self.pen_sensor_status = PenSensorStatus::Ok;
        } else {
            // A dead sensor also invalidates the resistance reading taken
            // this period.
            self.pen_sensor_status = PenSensorStatus::Broken;
            self.heating_element_status = HeatingElementStatus::Unknown;
            debug!("pen sensor path broken");
        }
        self.state = State::Stop;
    }
}
