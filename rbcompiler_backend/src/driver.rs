//! Traits at the seam to the card hardware, and an in-memory implementation.
//!
//! The pulser only talks to the cards through [`DelayCardDriver`] and
//! [`ClockCardDriver`]. `rbctrl_backend` implements both on top of the Rulbus library;
//! [`RecordingDriver`] implements them without hardware and records every command,
//! which is what dry runs and tests use.

use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::card::CardHandle;
use crate::error::{PulserError, Result};
use crate::state::TriggerEdge;
use crate::timebase::{ClockRate, Ticks, MAX_TICKS};

/// Which edges of its counting interval a delay card reports on its outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPulse {
    None,
    Start,
    End,
}

/// Commands for an RB8514 delay card.
pub trait DelayCardDriver {
    fn open_card(&mut self, name: &str) -> Result<CardHandle>;
    fn close_card(&mut self, handle: CardHandle) -> Result<()>;
    fn set_trigger(&mut self, handle: CardHandle, edge: TriggerEdge) -> Result<()>;
    fn set_output_pulse(&mut self, handle: CardHandle, pulse: OutputPulse) -> Result<()>;
    /// Writes the delay register. Blocks until the card is ready to accept the
    /// value and fails with [`PulserError::HardwareCommFailure`] if it never is.
    fn set_raw_delay(&mut self, handle: CardHandle, ticks: Ticks) -> Result<()>;
    fn busy(&mut self, handle: CardHandle) -> Result<bool>;
    fn software_start(&mut self, handle: CardHandle) -> Result<()>;
    /// Delay between trigger and start of counting [s]
    fn intrinsic_delay(&mut self, handle: CardHandle) -> Result<f64>;
}

/// Commands for an RB8515 clock card.
pub trait ClockCardDriver {
    fn open_clock(&mut self, name: &str) -> Result<CardHandle>;
    fn close_clock(&mut self, handle: CardHandle) -> Result<()>;
    fn set_frequency(&mut self, handle: CardHandle, rate: ClockRate) -> Result<()>;
}

/// Everything the pulser needs from the hardware
pub trait PulserDriver: DelayCardDriver + ClockCardDriver {}

impl<T: DelayCardDriver + ClockCardDriver> PulserDriver for T {}

const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Polls `busy` until it reports ready, giving up after `timeout`.
pub fn poll_ready<F>(card: &str, timeout: Duration, mut busy: F) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let start = Instant::now();
    while busy()? {
        if start.elapsed() >= timeout {
            return Err(PulserError::hardware(
                card,
                format!("card still busy after {} ms", timeout.as_millis()),
            ));
        }
        thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

/// A command as received by the [`RecordingDriver`], with card names resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    OpenCard(String),
    CloseCard(String),
    SetTrigger(String, TriggerEdge),
    SetOutputPulse(String, OutputPulse),
    SetRawDelay(String, Ticks),
    SoftwareStart(String),
    OpenClock(String),
    CloseClock(String),
    SetFrequency(String, ClockRate),
}

impl DriverCall {
    pub fn card(&self) -> &str {
        match self {
            DriverCall::OpenCard(name)
            | DriverCall::CloseCard(name)
            | DriverCall::SetTrigger(name, _)
            | DriverCall::SetOutputPulse(name, _)
            | DriverCall::SetRawDelay(name, _)
            | DriverCall::SoftwareStart(name)
            | DriverCall::OpenClock(name)
            | DriverCall::CloseClock(name)
            | DriverCall::SetFrequency(name, _) => name,
        }
    }

    /// Whether the command changes the timing produced by a delay card
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            DriverCall::SetOutputPulse(..) | DriverCall::SetRawDelay(..)
        )
    }
}

#[derive(Debug, Default)]
struct Recording {
    calls: Vec<DriverCall>,
    names: IndexMap<CardHandle, String>,
    intrinsic_delays: IndexMap<String, f64>,
    busy_polls: IndexMap<String, usize>,
    fail_on: Option<String>,
}

/// Driver double recording every command.
///
/// Clones share their recording, so a clone kept by the caller observes the commands
/// sent to the one handed to the pulser.
#[derive(Debug, Clone)]
pub struct RecordingDriver {
    state: Rc<RefCell<Recording>>,
    busy_timeout: Duration,
}

impl Default for RecordingDriver {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

impl RecordingDriver {
    pub fn new(busy_timeout: Duration) -> Self {
        Self {
            state: Rc::new(RefCell::new(Recording::default())),
            busy_timeout,
        }
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.borrow().calls.clone()
    }

    pub fn clear(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Number of recorded commands that change delay card timing
    pub fn write_count(&self) -> usize {
        self.state.borrow().calls.iter().filter(|c| c.is_write()).count()
    }

    /// Intrinsic delay reported for `card`, zero if not given
    pub fn set_intrinsic_delay(&self, card: &str, delay: f64) {
        self.state
            .borrow_mut()
            .intrinsic_delays
            .insert(card.to_string(), delay);
    }

    /// Makes `card` report busy for the next `polls` queries
    pub fn set_busy_polls(&self, card: &str, polls: usize) {
        self.state
            .borrow_mut()
            .busy_polls
            .insert(card.to_string(), polls);
    }

    /// Makes every later command addressed to `card` fail
    pub fn fail_on(&self, card: Option<&str>) {
        self.state.borrow_mut().fail_on = card.map(str::to_string);
    }

    fn name(&self, handle: CardHandle) -> Result<String> {
        self.state
            .borrow()
            .names
            .get(&handle)
            .cloned()
            .ok_or_else(|| PulserError::hardware(&format!("#{}", handle), "invalid card handle"))
    }

    fn check(&self, name: &str) -> Result<()> {
        match &self.state.borrow().fail_on {
            Some(card) if card == name => Err(PulserError::hardware(name, "injected failure")),
            _ => Ok(()),
        }
    }

    fn record(&self, handle: CardHandle, call: impl FnOnce(String) -> DriverCall) -> Result<()> {
        let name = self.name(handle)?;
        self.check(&name)?;
        self.state.borrow_mut().calls.push(call(name));
        Ok(())
    }

    fn open(&self, name: &str, call: DriverCall) -> Result<CardHandle> {
        self.check(name)?;
        let mut state = self.state.borrow_mut();
        let handle = state.names.len() as CardHandle;
        state.names.insert(handle, name.to_string());
        state.calls.push(call);
        Ok(handle)
    }
}

impl DelayCardDriver for RecordingDriver {
    fn open_card(&mut self, name: &str) -> Result<CardHandle> {
        self.open(name, DriverCall::OpenCard(name.to_string()))
    }

    fn close_card(&mut self, handle: CardHandle) -> Result<()> {
        self.record(handle, DriverCall::CloseCard)
    }

    fn set_trigger(&mut self, handle: CardHandle, edge: TriggerEdge) -> Result<()> {
        self.record(handle, |name| DriverCall::SetTrigger(name, edge))
    }

    fn set_output_pulse(&mut self, handle: CardHandle, pulse: OutputPulse) -> Result<()> {
        self.record(handle, |name| DriverCall::SetOutputPulse(name, pulse))
    }

    fn set_raw_delay(&mut self, handle: CardHandle, ticks: Ticks) -> Result<()> {
        let name = self.name(handle)?;
        if !(0..=MAX_TICKS).contains(&ticks) {
            return Err(PulserError::hardware(&name, format!("delay {} out of range", ticks)));
        }
        let timeout = self.busy_timeout;
        poll_ready(&name, timeout, || self.busy(handle))?;
        self.record(handle, |name| DriverCall::SetRawDelay(name, ticks))
    }

    fn busy(&mut self, handle: CardHandle) -> Result<bool> {
        let name = self.name(handle)?;
        self.check(&name)?;
        let mut state = self.state.borrow_mut();
        match state.busy_polls.get_mut(&name) {
            Some(polls) if *polls > 0 => {
                *polls -= 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn software_start(&mut self, handle: CardHandle) -> Result<()> {
        self.record(handle, DriverCall::SoftwareStart)
    }

    fn intrinsic_delay(&mut self, handle: CardHandle) -> Result<f64> {
        let name = self.name(handle)?;
        self.check(&name)?;
        Ok(self
            .state
            .borrow()
            .intrinsic_delays
            .get(&name)
            .copied()
            .unwrap_or(0.0))
    }
}

impl ClockCardDriver for RecordingDriver {
    fn open_clock(&mut self, name: &str) -> Result<CardHandle> {
        self.open(name, DriverCall::OpenClock(name.to_string()))
    }

    fn close_clock(&mut self, handle: CardHandle) -> Result<()> {
        self.record(handle, DriverCall::CloseClock)
    }

    fn set_frequency(&mut self, handle: CardHandle, rate: ClockRate) -> Result<()> {
        self.record(handle, |name| DriverCall::SetFrequency(name, rate))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn records_by_name() {
        let mut driver = RecordingDriver::default();
        let observer = driver.clone();
        let h = driver.open_card("MW_DELAY_0").unwrap();
        let c = driver.open_clock("TB_CLOCK").unwrap();
        driver.set_raw_delay(h, 12).unwrap();
        driver.set_output_pulse(h, OutputPulse::End).unwrap();
        driver.set_frequency(c, ClockRate::Hz100M).unwrap();
        assert_eq!(
            observer.calls(),
            vec![
                DriverCall::OpenCard("MW_DELAY_0".to_string()),
                DriverCall::OpenClock("TB_CLOCK".to_string()),
                DriverCall::SetRawDelay("MW_DELAY_0".to_string(), 12),
                DriverCall::SetOutputPulse("MW_DELAY_0".to_string(), OutputPulse::End),
                DriverCall::SetFrequency("TB_CLOCK".to_string(), ClockRate::Hz100M),
            ]
        );
        assert_eq!(observer.write_count(), 2);
    }

    #[test]
    fn waits_while_busy() {
        let mut driver = RecordingDriver::default();
        let h = driver.open_card("INIT_DELAY").unwrap();
        driver.set_busy_polls("INIT_DELAY", 3);
        driver.set_raw_delay(h, 4).unwrap();
        assert!(!driver.busy(h).unwrap());
    }

    #[test]
    fn busy_wait_times_out() {
        let mut driver = RecordingDriver::new(Duration::from_millis(5));
        let h = driver.open_card("INIT_DELAY").unwrap();
        driver.set_busy_polls("INIT_DELAY", usize::MAX);
        let err = driver.set_raw_delay(h, 4).unwrap_err();
        assert!(matches!(err, PulserError::HardwareCommFailure { ref card, .. } if card == "INIT_DELAY"));
        assert_eq!(driver.write_count(), 0);
    }

    #[test]
    fn injected_failure() {
        let mut driver = RecordingDriver::default();
        let h = driver.open_card("DET_DELAY_0").unwrap();
        driver.fail_on(Some("DET_DELAY_0"));
        assert!(matches!(
            driver.software_start(h),
            Err(PulserError::HardwareCommFailure { .. })
        ));
        driver.fail_on(None);
        driver.software_start(h).unwrap();
    }

    #[test]
    fn unknown_handle() {
        let mut driver = RecordingDriver::default();
        assert!(matches!(
            driver.set_output_pulse(42, OutputPulse::None),
            Err(PulserError::HardwareCommFailure { .. })
        ));
    }
}
