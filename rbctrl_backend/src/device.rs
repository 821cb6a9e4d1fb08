//! [`PulserDriver`] implementation on top of the Rulbus library.

use std::time::Duration;

use indexmap::IndexMap;
use libc::{c_int, c_ulong};
use tracing::{debug, info, warn};

use rbcompiler_backend::card::CardHandle;
use rbcompiler_backend::driver::{poll_ready, ClockCardDriver, DelayCardDriver, OutputPulse};
use rbcompiler_backend::error::{PulserError, Result};
use rbcompiler_backend::state::TriggerEdge;
use rbcompiler_backend::timebase::{ClockRate, Ticks, MAX_TICKS};
use rbcompiler_backend::utils::TickTimer;
use rbcompiler_backend::PulserConfig;

use crate::rulbus::*;

pub fn clock_code(rate: ClockRate) -> c_int {
    match rate {
        ClockRate::Off => RULBUS_RB8515_CLOCK_FREQ_OFF,
        ClockRate::Hz100M => RULBUS_RB8515_CLOCK_FREQ_100MHZ,
        ClockRate::Hz10M => RULBUS_RB8515_CLOCK_FREQ_10MHZ,
        ClockRate::Hz1M => RULBUS_RB8515_CLOCK_FREQ_1MHZ,
        ClockRate::Hz100k => RULBUS_RB8515_CLOCK_FREQ_100KHZ,
        ClockRate::Hz10k => RULBUS_RB8515_CLOCK_FREQ_10KHZ,
        ClockRate::Hz1k => RULBUS_RB8515_CLOCK_FREQ_1KHZ,
    }
}

pub fn edge_code(edge: TriggerEdge) -> c_int {
    match edge {
        TriggerEdge::Rising => RULBUS_RB8514_DELAY_RAISING_EDGE,
        TriggerEdge::Falling => RULBUS_RB8514_DELAY_FALLING_EDGE,
    }
}

pub fn pulse_code(pulse: OutputPulse) -> c_int {
    match pulse {
        OutputPulse::None => RULBUS_RB8514_DELAY_PULSE_NONE,
        OutputPulse::Start => RULBUS_RB8514_DELAY_START_PULSE,
        OutputPulse::End => RULBUS_RB8514_DELAY_END_PULSE,
    }
}

/// Drives the delay and clock cards of one Rulbus rack.
///
/// The bus is opened with the first card and closed when the driver is dropped.
pub struct RulbusDriver {
    lib: RulbusLib,
    names: IndexMap<CardHandle, String>,
    busy_timeout: Duration,
    bus_open: bool,
}

impl RulbusDriver {
    pub fn new(config: &PulserConfig) -> Result<Self> {
        let lib = RulbusLib::load(&config.library_path)?;
        Ok(Self {
            lib,
            names: IndexMap::new(),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            bus_open: false,
        })
    }

    fn name(&self, handle: CardHandle) -> Result<String> {
        self.names
            .get(&handle)
            .cloned()
            .ok_or_else(|| PulserError::hardware(&format!("#{}", handle), "card is not open"))
    }

    fn open(&mut self, name: &str) -> Result<CardHandle> {
        if !self.bus_open {
            let mut timer = TickTimer::new();
            self.lib.open()?;
            self.bus_open = true;
            timer.tick_log("Rulbus opened");
        }
        let handle = self.lib.card_open(name)?;
        self.names.insert(handle, name.to_string());
        debug!(card = name, handle, "Card opened");
        Ok(handle)
    }

    fn close(&mut self, handle: CardHandle) -> Result<()> {
        let name = self.name(handle)?;
        self.lib.card_close(&name, handle)?;
        self.names.shift_remove(&handle);
        if self.names.is_empty() && self.bus_open {
            self.lib.close();
            self.bus_open = false;
            info!("Rulbus closed");
        }
        Ok(())
    }
}

impl DelayCardDriver for RulbusDriver {
    fn open_card(&mut self, name: &str) -> Result<CardHandle> {
        self.open(name)
    }

    fn close_card(&mut self, handle: CardHandle) -> Result<()> {
        self.close(handle)
    }

    fn set_trigger(&mut self, handle: CardHandle, edge: TriggerEdge) -> Result<()> {
        let name = self.name(handle)?;
        Ok(self.lib.delay_set_trigger(&name, handle, edge_code(edge))?)
    }

    fn set_output_pulse(&mut self, handle: CardHandle, pulse: OutputPulse) -> Result<()> {
        let name = self.name(handle)?;
        Ok(self.lib.delay_set_output_pulse(&name, handle, pulse_code(pulse))?)
    }

    fn set_raw_delay(&mut self, handle: CardHandle, ticks: Ticks) -> Result<()> {
        let name = self.name(handle)?;
        if !(0..=MAX_TICKS).contains(&ticks) {
            return Err(PulserError::hardware(&name, format!("delay {} out of range", ticks)));
        }
        let timeout = self.busy_timeout;
        poll_ready(&name, timeout, || self.busy(handle))?;
        Ok(self.lib.delay_set_raw_delay(&name, handle, ticks as c_ulong)?)
    }

    fn busy(&mut self, handle: CardHandle) -> Result<bool> {
        let name = self.name(handle)?;
        Ok(self.lib.delay_busy(&name, handle)?)
    }

    fn software_start(&mut self, handle: CardHandle) -> Result<()> {
        let name = self.name(handle)?;
        Ok(self.lib.delay_software_start(&name, handle)?)
    }

    fn intrinsic_delay(&mut self, handle: CardHandle) -> Result<f64> {
        let name = self.name(handle)?;
        Ok(self.lib.delay_intrinsic_delay(&name, handle)?)
    }
}

impl ClockCardDriver for RulbusDriver {
    fn open_clock(&mut self, name: &str) -> Result<CardHandle> {
        self.open(name)
    }

    fn close_clock(&mut self, handle: CardHandle) -> Result<()> {
        self.close(handle)
    }

    fn set_frequency(&mut self, handle: CardHandle, rate: ClockRate) -> Result<()> {
        let name = self.name(handle)?;
        Ok(self.lib.clock_set_frequency(&name, handle, clock_code(rate))?)
    }
}

impl Drop for RulbusDriver {
    fn drop(&mut self) {
        let handles: Vec<CardHandle> = self.names.keys().copied().collect();
        for handle in handles {
            if let Err(err) = self.close(handle) {
                warn!(error = %err, "Closing card on drop failed");
            }
        }
        if self.bus_open {
            self.lib.close();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clock_codes_are_distinct() {
        let mut codes: Vec<c_int> = ClockRate::RUNNING.iter().map(|&r| clock_code(r)).collect();
        codes.push(clock_code(ClockRate::Off));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), 7);
    }

    #[test]
    fn missing_library_is_a_hardware_error() {
        let config = PulserConfig {
            library_path: "/nonexistent/librulbus.so".to_string(),
            ..PulserConfig::default()
        };
        assert!(matches!(
            RulbusDriver::new(&config),
            Err(PulserError::HardwareCommFailure { .. })
        ));
    }
}
