//! Error and notice types shared by every stage of the pulser pipeline.
//!
//! Fatal outcomes are [`PulserError`] values propagated with `?` until the front-end call
//! returns. Recoverable outcomes (rounding that had to be accepted, resubmitted values)
//! are [`Notice`]s: they are logged where they occur and collected where a caller may
//! want to inspect them.

use std::fmt;

use crate::function::FunctionKind;
use crate::pulse::PulseId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PulserError>;

/// Coarse classification of a [`PulserError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad timebase, bad topology, too many pulses. Aborts the run.
    Configuration,
    /// A request that contradicts the pulse model. Identifies the offending pulse or function.
    Validation,
    /// A driver call failed. The pulser is torn down before the error propagates.
    Hardware,
}

/// Pulse attributes that can be assigned through the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseAttr {
    Function,
    Position,
    Length,
    PositionChange,
    LengthChange,
}

impl fmt::Display for PulseAttr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                PulseAttr::Function => "function",
                PulseAttr::Position => "position",
                PulseAttr::Length => "length",
                PulseAttr::PositionChange => "position change",
                PulseAttr::LengthChange => "length change",
            }
        )
    }
}

/// Every fatal error the pulser can raise.
#[derive(Debug, thiserror::Error)]
pub enum PulserError {
    // Configuration
    #[error("timebase of {0} s is not supported by the clock card")]
    UnsupportedTimebase(f64),

    #[error("timebase has already been set to {0} s")]
    TimebaseAlreadySet(f64),

    #[error("function {function} has {requested} pulses but its card chain supports only {capacity}")]
    TooManyPulses {
        function: FunctionKind,
        requested: usize,
        capacity: usize,
    },

    #[error("card topology mismatch: {0}")]
    TopologyMismatch(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("RF synthesizer module '{module}' is unavailable: {reason}")]
    RfUnavailable { module: String, reason: String },

    // Validation
    #[error("{attr} of pulse #{pulse} has already been set")]
    AttributeAlreadySet { pulse: PulseId, attr: PulseAttr },

    #[error("{attr} of pulse #{pulse} has not been set")]
    AttributeNotSet { pulse: PulseId, attr: PulseAttr },

    #[error("pulse #{pulse} of function {function} starts before the earliest possible time of {earliest} s")]
    PulseTooEarly {
        pulse: PulseId,
        function: FunctionKind,
        earliest: f64,
    },

    #[error("pulses #{first} and #{second} of function {function} overlap")]
    PulsesOverlap {
        function: FunctionKind,
        first: PulseId,
        second: PulseId,
    },

    #[error("pulse sequence of function {function} ends at {end} s, after the repetition time of {repetition} s")]
    SequenceTooLong {
        function: FunctionKind,
        end: f64,
        repetition: f64,
    },

    #[error("delay of function {0} has already been set")]
    DelayAlreadySet(FunctionKind),

    #[error("negative delay of function {function} is not possible with external trigger")]
    NegativeDelayInExternalMode { function: FunctionKind },

    #[error("time of {0} s is too long to be represented by the pulser")]
    TimeTooLong(f64),

    #[error("time of {time} s is not an integer multiple of the timebase of {timebase} s")]
    ImprecisePosition { time: f64, timebase: f64 },

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("pulse #{0} does not exist")]
    UnknownPulse(PulseId),

    #[error("pulse #{0} already exists")]
    DuplicatePulse(PulseId),

    #[error("cannot {0} after setup has been finished")]
    SetupFinished(&'static str),

    #[error("cannot {0} before setup has been finished")]
    SetupNotFinished(&'static str),

    // Hardware
    #[error("communication with card '{card}' failed: {reason}")]
    HardwareCommFailure { card: String, reason: String },

    // Wrappers
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration file error: {0}")]
    Config(#[from] serde_yaml::Error),
}

impl PulserError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PulserError::UnsupportedTimebase(_)
            | PulserError::TimebaseAlreadySet(_)
            | PulserError::TooManyPulses { .. }
            | PulserError::TopologyMismatch(_)
            | PulserError::InvalidConfig(_)
            | PulserError::RfUnavailable { .. }
            | PulserError::Io(_)
            | PulserError::Config(_) => ErrorCategory::Configuration,
            PulserError::HardwareCommFailure { .. } => ErrorCategory::Hardware,
            _ => ErrorCategory::Validation,
        }
    }

    /// Shortcut for building a [`PulserError::HardwareCommFailure`]
    pub fn hardware(card: &str, reason: impl Into<String>) -> Self {
        PulserError::HardwareCommFailure {
            card: card.to_string(),
            reason: reason.into(),
        }
    }
}

/// Recoverable outcome of a request. Logged, never aborts.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// A computed card delay had to be rounded beyond the precision tolerance.
    Precision {
        card: String,
        requested: f64,
        realized: f64,
    },
    /// A request did not change anything.
    Redundant(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Notice::Precision {
                card,
                requested,
                realized,
            } => write!(
                f,
                "delay of card {} rounded from {} s to {} s",
                card, requested, realized
            ),
            Notice::Redundant(msg) => write!(f, "{}", msg),
        }
    }
}

/// What a `change_*` request did to the pulse model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Applied,
    Redundant,
}
