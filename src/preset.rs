//! The user's setpoint record.
//!
//! A small mutable store of preset tip temperatures, the selected and
//! currently edited slots, and the standby flag. Pure in-memory; the UI
//! layer mutates it between periods and the heating engine reads the
//! effective setpoint once per period.

use serde::{Deserialize, Serialize};

/// Number of stored setpoints.
pub const PRESET_COUNT: usize = 2;

/// Lowest storable setpoint in m°C.
pub const MIN_TEMPERATURE_MC: i32 = 20 * 1000;

/// Highest storable setpoint in m°C.
pub const MAX_TEMPERATURE_MC: i32 = 400 * 1000;

/// Effective setpoint while in standby, in m°C.
const STANDBY_TEMPERATURE_MC: i32 = 0;

/// Stored setpoints with selection, edit and standby state.
///
/// Every stored temperature stays inside
/// [`MIN_TEMPERATURE_MC`]..=[`MAX_TEMPERATURE_MC`]. The record boots in
/// standby; [`Preset::select`] is the only path out of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Preset {
    /// Stored setpoints in m°C.
    temperatures: [i32; PRESET_COUNT],
    /// Index of the active setpoint.
    selected: usize,
    /// Index of the setpoint being edited, if any.
    edited: Option<usize>,
    /// When set, the effective setpoint is [`STANDBY_TEMPERATURE_MC`].
    standby: bool,
}

impl Default for Preset {
    fn default() -> Self {
        Self {
            temperatures: [300 * 1000, 250 * 1000],
            selected: 0,
            edited: None,
            standby: true,
        }
    }
}

impl Preset {
    /// Enter standby mode.
    pub fn set_standby(&mut self) {
        self.standby = true;
    }

    /// Whether standby mode is active.
    pub fn is_standby(&self) -> bool {
        self.standby
    }

    /// Activate the given setpoint and leave standby.
    ///
    /// Out-of-range indices are ignored.
    pub fn select(&mut self, preset: usize) {
        if preset >= PRESET_COUNT {
            return;
        }
        self.selected = preset;
        self.standby = false;
    }

    /// Begin editing the given setpoint.
    ///
    /// Out-of-range indices are ignored.
    pub fn edit_select(&mut self, preset: usize) {
        if preset >= PRESET_COUNT {
            return;
        }
        self.edited = Some(preset);
    }

    /// Stop editing.
    pub fn edit_end(&mut self) {
        self.edited = None;
    }

    /// Adjust the edited setpoint by `delta_mc` and clamp it to the storable
    /// band. No-op unless a setpoint is being edited.
    pub fn edit_add(&mut self, delta_mc: i32) {
        if let Some(edited) = self.edited {
            let temperature = &mut self.temperatures[edited];
            *temperature = temperature
                .saturating_add(delta_mc)
                .clamp(MIN_TEMPERATURE_MC, MAX_TEMPERATURE_MC);
        }
    }

    /// The effective setpoint in m°C: 0 in standby, the selected setpoint
    /// otherwise.
    pub fn temperature(&self) -> i32 {
        if self.standby {
            return STANDBY_TEMPERATURE_MC;
        }
        self.temperatures[self.selected]
    }

    /// Read a stored setpoint in m°C.
    pub fn preset_temperature(&self, preset: usize) -> Option<i32> {
        self.temperatures.get(preset).copied()
    }

    /// Index of the active setpoint.
    pub fn selected(&self) -> usize {
        self.selected
    }

    /// Index of the setpoint being edited, if any.
    pub fn edited(&self) -> Option<usize> {
        self.edited
    }

    /// Whether any setpoint is being edited.
    pub fn is_editing(&self) -> bool {
        self.edited.is_some()
    }

    /// Whether the given setpoint is being edited.
    pub fn is_editing_preset(&self, preset: usize) -> bool {
        self.edited == Some(preset)
    }
}
