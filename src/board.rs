//! Hardware capabilities required by the control core.
//!
//! The concrete board owns the pins and peripherals behind these traits; the
//! engine only sees this fixed set of operations. For the duration of a
//! period the engine has exclusive use of the heater gate and the ADC
//! channel bank. Mock implementations drive the engine in host tests.

/// Tick source characteristics.
pub trait Clock {
    /// Tick rate of the monotonic counter in ticks per second.
    const CORE_FREQ: u32;
}

/// The heating element gate.
///
/// Both operations are idempotent GPIO drives.
pub trait Heater {
    /// Close the gate; current flows through the element.
    fn on(&mut self);

    /// Open the gate.
    fn off(&mut self);
}

/// One-shot measurement bursts over the pen's ADC channel bank.
///
/// A burst is armed with one of the `measure_*_start` operations and has
/// completed once [`Adc::measure_is_done`] returns `true`. The getters are
/// only defined while a completed burst's samples are current.
pub trait Adc {
    /// Arm a burst optimized for live heat-phase signals (supply voltage,
    /// element current, CPU voltage).
    fn measure_heat_start(&mut self);

    /// Arm a burst that additionally samples the thermocouple EMF and the
    /// die temperature.
    fn measure_idle_start(&mut self);

    /// Whether the last armed burst has completed.
    fn measure_is_done(&self) -> bool;

    /// Supply rail voltage in mV.
    fn supply_voltage_mv(&self) -> i32;

    /// CPU rail voltage in mV.
    fn cpu_voltage_mv(&self) -> i32;

    /// Element current in mA.
    fn pen_current_ma(&self) -> i32;

    /// Die temperature in m°C, the thermocouple's cold junction.
    fn cpu_temperature_mc(&self) -> i32;

    /// Thermocouple EMF expressed as a temperature difference in m°C.
    fn pen_temperature_mc(&self) -> i32;

    /// Sanity bit for the pen temperature sensor path.
    fn pen_sensor_ok(&self) -> bool;
}
