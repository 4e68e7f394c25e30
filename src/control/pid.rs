//! Discrete integer PID controller for the tip temperature loop.

/// A discrete PID controller in integer milli-units.
///
/// Gains are scaled by 1000, so the combined term is divided down once at
/// the output. The integral is clamped such that the proportional plus
/// integral sum stays inside the saturation band, and the final output is
/// clamped to `[0, output_max]` since the heater is unipolar.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Pid {
    /// Proportional gain, milli-units.
    kp: i32,
    /// Integral gain, milli-units.
    ki: i32,
    /// Derivative gain, milli-units.
    kd: i32,
    /// Control steps per second.
    sample_rate: i32,
    /// Upper output clamp.
    output_max: i32,
    /// Accumulated error.
    integral: i64,
    /// Error of the previous step.
    previous_error: i32,
}

impl Pid {
    /// Create a controller with the given gains, sample rate in steps per
    /// second, and output clamp.
    pub const fn new(kp: i32, ki: i32, kd: i32, sample_rate: i32, output_max: i32) -> Self {
        Self {
            kp,
            ki,
            kd,
            sample_rate,
            output_max,
            integral: 0,
            previous_error: 0,
        }
    }

    /// Discard the accumulated error history.
    ///
    /// Called whenever the control loop runs open (no valid measurement), so
    /// stale history cannot wind the integral up.
    pub fn reset(&mut self) {
        self.integral = 0;
        self.previous_error = 0;
    }

    /// Run one control step and return the requested output, clamped to
    /// `[0, output_max]`.
    pub fn process(&mut self, measured_mc: i32, setpoint_mc: i32) -> i32 {
        let error = setpoint_mc - measured_mc;
        let band = i64::from(self.output_max) * 1000;

        let p = i64::from(self.kp) * i64::from(error);

        let mut i = 0;
        if self.ki != 0 {
            self.integral += i64::from(error);
            i = i64::from(self.ki) * self.integral / i64::from(self.sample_rate);
            // keep P + I inside the saturation band
            if p + i > band {
                i = band - p;
                self.integral = i * i64::from(self.sample_rate) / i64::from(self.ki);
            } else if p + i < 0 {
                i = -p;
                self.integral = i * i64::from(self.sample_rate) / i64::from(self.ki);
            }
        }

        let d = i64::from(self.kd)
            * i64::from(error - self.previous_error)
            * i64::from(self.sample_rate);
        self.previous_error = error;

        ((p + i + d) / 1000).clamp(0, i64::from(self.output_max)) as i32
    }
}
