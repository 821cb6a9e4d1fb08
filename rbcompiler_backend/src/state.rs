//! Pulser-wide settings shared by all functions.

use std::fmt;

use crate::error::{PulserError, Result};
use crate::timebase::{ClockRate, Ticks, Timebase};

/// Source of the repetition trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// The repetition-trigger card retriggers itself from its clock
    Internal,
    /// An external signal triggers the repetition-trigger card
    External,
}

impl TriggerMode {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_uppercase().as_str() {
            "INTERNAL" | "INTERN" => Ok(TriggerMode::Internal),
            "EXTERNAL" | "EXTERN" => Ok(TriggerMode::External),
            _ => Err(PulserError::InvalidValue(format!("unknown trigger mode '{}'", name))),
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                TriggerMode::Internal => "INTERNAL",
                TriggerMode::External => "EXTERNAL",
            }
        )
    }
}

/// Edge a delay card reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEdge {
    Rising,
    Falling,
}

impl TriggerEdge {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_uppercase().as_str() {
            "RISING" | "POSITIVE" | "POS" => Ok(TriggerEdge::Rising),
            "FALLING" | "NEGATIVE" | "NEG" => Ok(TriggerEdge::Falling),
            _ => Err(PulserError::InvalidValue(format!("unknown trigger slope '{}'", name))),
        }
    }
}

/// Whether a run only checks the sequence or drives the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Test,
    Experiment,
}

impl RunMode {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_uppercase().as_str() {
            "TEST" => Ok(RunMode::Test),
            "EXPERIMENT" | "EXP" => Ok(RunMode::Experiment),
            _ => Err(PulserError::InvalidValue(format!("unknown run mode '{}'", name))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GlobalPulserState {
    pub timebase: Timebase,
    /// `None` until set; treated as internal
    pub trigger_mode: Option<TriggerMode>,
    pub trigger_slope: TriggerEdge,
    pub repetition_time: Option<f64>,
    /// Clock setting and tick count of the repetition-trigger card
    pub repetition: Option<(ClockRate, Ticks)>,
    /// Amount every stored function delay is offset by
    pub neg_delay_floor: Ticks,
    pub is_running: bool,
}

impl GlobalPulserState {
    pub fn new(default_timebase: f64) -> Self {
        Self {
            timebase: Timebase::new(default_timebase),
            trigger_mode: None,
            trigger_slope: TriggerEdge::Rising,
            repetition_time: None,
            repetition: None,
            neg_delay_floor: 0,
            is_running: false,
        }
    }

    pub fn mode(&self) -> TriggerMode {
        self.trigger_mode.unwrap_or(TriggerMode::Internal)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(TriggerMode::from_name(" extern").unwrap(), TriggerMode::External);
        assert_eq!(TriggerEdge::from_name("negative").unwrap(), TriggerEdge::Falling);
        assert_eq!(RunMode::from_name("Test").unwrap(), RunMode::Test);
        assert!(matches!(
            TriggerMode::from_name("sometimes"),
            Err(PulserError::InvalidValue(_))
        ));
    }

    #[test]
    fn unset_mode_is_internal() {
        let state = GlobalPulserState::new(1e-8);
        assert_eq!(state.mode(), TriggerMode::Internal);
        assert!(!state.is_running);
    }
}
