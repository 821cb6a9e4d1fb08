//! Conversion between real time (seconds, `f64`) and integer clock ticks.
//!
//! All chain arithmetic of the sequence builder happens in [`Ticks`] of the timebase
//! clock. The only supported periods are those the RB8515 clock card can generate,
//! see [`ClockRate`].

use std::fmt;

use tracing::info;

use crate::error::{PulserError, Result};

/// Integer number of timebase periods.
pub type Ticks = i64;

/// Largest value an RB8514 delay card register can hold (24 bit).
pub const MAX_TICKS: Ticks = 0xFF_FFFF;

/// Relative tolerance for rounding a time to the tick grid.
pub const PRECISION: f64 = 0.01;

/// Relative tolerance when matching a requested timebase against the clock card rates.
const TIMEBASE_TOLERANCE: f64 = 1e-3;

/// Beyond this many ticks times are no longer exactly representable as `f64`.
const MAX_POSITION_TICKS: Ticks = 1 << 53;

/// Output settings of the RB8515 clock card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockRate {
    Off,
    Hz100M,
    Hz10M,
    Hz1M,
    Hz100k,
    Hz10k,
    Hz1k,
}

impl ClockRate {
    /// Running rates, fastest first
    pub const RUNNING: [ClockRate; 6] = [
        ClockRate::Hz100M,
        ClockRate::Hz10M,
        ClockRate::Hz1M,
        ClockRate::Hz100k,
        ClockRate::Hz10k,
        ClockRate::Hz1k,
    ];

    pub fn frequency(&self) -> Option<f64> {
        match self {
            ClockRate::Off => None,
            ClockRate::Hz100M => Some(1e8),
            ClockRate::Hz10M => Some(1e7),
            ClockRate::Hz1M => Some(1e6),
            ClockRate::Hz100k => Some(1e5),
            ClockRate::Hz10k => Some(1e4),
            ClockRate::Hz1k => Some(1e3),
        }
    }

    pub fn period(&self) -> Option<f64> {
        self.frequency().map(|freq| 1.0 / freq)
    }

    /// Finds the running rate whose period matches `period` within tolerance
    pub fn from_period(period: f64) -> Option<ClockRate> {
        ClockRate::RUNNING.into_iter().find(|rate| {
            let p = rate.period().unwrap_or(f64::NAN);
            ((period - p) / p).abs() <= TIMEBASE_TOLERANCE
        })
    }
}

impl fmt::Display for ClockRate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.frequency() {
            None => write!(f, "OFF"),
            Some(freq) => write!(f, "{} Hz", freq),
        }
    }
}

/// The timebase of the pulser: set at most once, falls back to a default period.
#[derive(Debug, Clone)]
pub struct Timebase {
    period: Option<f64>,
    default_period: f64,
}

impl Timebase {
    pub fn new(default_period: f64) -> Self {
        Self {
            period: None,
            default_period,
        }
    }

    pub fn is_set(&self) -> bool {
        self.period.is_some()
    }

    /// Accepts `value` once if it matches a period of the clock card.
    pub fn set(&mut self, value: f64) -> Result<()> {
        if let Some(period) = self.period {
            return Err(PulserError::TimebaseAlreadySet(period));
        }
        let rate = ClockRate::from_period(value).ok_or(PulserError::UnsupportedTimebase(value))?;
        // Store the exact period so tick arithmetic is not skewed by the user's rounding
        self.period = rate.period();
        Ok(())
    }

    /// Installs the default period if none was set yet.
    pub fn ensure_set(&mut self) {
        if self.period.is_none() {
            info!(period = self.default_period, "Timebase not set, using default");
            self.period = Some(self.default_period);
        }
    }

    pub fn period(&self) -> f64 {
        self.period.unwrap_or(self.default_period)
    }

    /// Clock card setting that realizes this timebase.
    pub fn rate(&self) -> ClockRate {
        ClockRate::from_period(self.period()).unwrap_or(ClockRate::Hz100M)
    }

    /// Converts `time` to ticks, refusing any rounding beyond [`PRECISION`].
    pub fn to_ticks(&self, time: f64) -> Result<Ticks> {
        let period = self.period();
        let ticks_f = time / period;
        if !ticks_f.is_finite() || ticks_f.abs() > MAX_POSITION_TICKS as f64 {
            return Err(PulserError::TimeTooLong(time));
        }
        let ticks = ticks_f.round() as Ticks;
        let realized = ticks as f64 * period;
        if (ticks == 0 && time > 0.0) || (realized - time).abs() > PRECISION * time.abs() {
            return Err(PulserError::ImprecisePosition {
                time,
                timebase: period,
            });
        }
        Ok(ticks)
    }

    /// Rounds `time` to the nearest tick. The flag is `false` if the rounding
    /// moved the value beyond [`PRECISION`].
    pub fn to_ticks_rounded(&self, time: f64) -> (Ticks, bool) {
        let period = self.period();
        let ticks = (time / period).round() as Ticks;
        let realized = ticks as f64 * period;
        let precise = (realized - time).abs() <= PRECISION * period.max(time.abs());
        (ticks, precise)
    }

    pub fn to_time(&self, ticks: Ticks) -> f64 {
        ticks as f64 * self.period()
    }
}

/// Picks the fastest clock rate under which `time` fits into one delay card,
/// returning the rate and the number of its periods.
pub fn repetition_clock_for(time: f64) -> Result<(ClockRate, Ticks)> {
    if !(time > 0.0) {
        return Err(PulserError::InvalidValue(format!(
            "repetition time must be positive, got {} s",
            time
        )));
    }
    for rate in ClockRate::RUNNING {
        let period = rate.period().unwrap_or(f64::NAN);
        let ticks = (time / period).round() as Ticks;
        if ticks > 0 && ticks <= MAX_TICKS {
            return Ok((rate, ticks));
        }
    }
    Err(PulserError::TimeTooLong(time))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_once() {
        let mut tb = Timebase::new(1e-8);
        assert!(!tb.is_set());
        tb.set(1.00001e-7).unwrap();
        assert_eq!(tb.period(), 1e-7);
        assert_eq!(tb.rate(), ClockRate::Hz10M);
        assert!(matches!(
            tb.set(1e-7),
            Err(PulserError::TimebaseAlreadySet(_))
        ));
    }

    #[test]
    fn unsupported_timebase() {
        let mut tb = Timebase::new(1e-8);
        assert!(matches!(
            tb.set(2e-8),
            Err(PulserError::UnsupportedTimebase(_))
        ));
        assert!(!tb.is_set());
    }

    #[test]
    fn default_is_installed_on_demand() {
        let mut tb = Timebase::new(1e-8);
        tb.ensure_set();
        assert!(tb.is_set());
        assert_eq!(tb.period(), 1e-8);
    }

    #[test]
    fn to_ticks_round_trip() {
        let mut tb = Timebase::new(1e-8);
        tb.ensure_set();
        for t in [0, 1, 2, 7, 10, 999, 123_456, MAX_TICKS, 3 * MAX_TICKS, -5] {
            assert_eq!(tb.to_ticks(tb.to_time(t)).unwrap(), t);
        }
    }

    #[test]
    fn to_ticks_imprecise() {
        let tb = Timebase::new(1e-8);
        assert!(matches!(
            tb.to_ticks(15e-9),
            Err(PulserError::ImprecisePosition { .. })
        ));
        assert!(matches!(
            tb.to_ticks(3e-9),
            Err(PulserError::ImprecisePosition { .. })
        ));
        // Within 1 % of an integer multiple
        assert_eq!(tb.to_ticks(100.5e-9).unwrap(), 10);
    }

    #[test]
    fn to_ticks_too_long() {
        let tb = Timebase::new(1e-8);
        assert!(matches!(tb.to_ticks(1e12), Err(PulserError::TimeTooLong(_))));
        assert!(matches!(
            tb.to_ticks(f64::INFINITY),
            Err(PulserError::TimeTooLong(_))
        ));
    }

    #[test]
    fn rounded_conversion_flags_precision() {
        let tb = Timebase::new(1e-8);
        assert_eq!(tb.to_ticks_rounded(40e-9), (4, true));
        let (ticks, precise) = tb.to_ticks_rounded(43e-9);
        assert_eq!(ticks, 4);
        assert!(!precise);
    }

    #[test]
    fn repetition_clock() {
        assert_eq!(repetition_clock_for(1e-6).unwrap(), (ClockRate::Hz100M, 100));
        // 1 s does not fit at 100 MHz (1e8 > MAX_TICKS) but does at 10 MHz
        assert_eq!(repetition_clock_for(1.0).unwrap(), (ClockRate::Hz10M, 10_000_000));
        assert!(matches!(repetition_clock_for(1e6), Err(PulserError::TimeTooLong(_))));
        assert!(repetition_clock_for(0.0).is_err());
    }
}
