//! The pulser front-end: the single place where the pulse model, the card chains and
//! the hardware meet.
//!
//! ## Overview
//!
//! A [`Pulser`] goes through two phases:
//!
//! 1. **Setup.** Pulses are created and their attributes assigned once each
//!    (`new_pulse`, `set_*`), together with the pulser-wide settings (timebase,
//!    trigger, repetition time, function delays).
//! 2. **Runs.** [`Pulser::begin_run`] finishes the setup on first use, brings the pulses
//!    back to their initial state and commits the full sequence. During a run pulses
//!    are modified with `change_*`, [`Pulser::shift`] and [`Pulser::increment`], and
//!    the modifications are sent with [`Pulser::update`].
//!
//! A [`RunMode::Test`] run checks every sequence the experiment would produce without
//! touching the hardware. A [`RunMode::Experiment`] run opens the cards and keeps them
//! synchronized with the model, writing only the differences.
//!
//! Times are given and returned in seconds; internally everything is in [`Ticks`] of
//! the timebase.
//!
//! ## Hardware failures
//!
//! When any driver command fails, every card is closed on a best-effort basis, the
//! pulser is marked as stopped and the [`PulserError::HardwareCommFailure`] is returned.

use std::io::Write;
use std::time::Duration;

use ndarray::Array2;
use tracing::{debug, error, info, warn};

use crate::card::{CardHandle, CardSlot, CardTable, ClockSlot};
use crate::commit::{self, CommitReport};
use crate::config::PulserConfig;
use crate::driver::{OutputPulse, PulserDriver, RecordingDriver};
use crate::error::{Change, Notice, PulseAttr, PulserError, Result};
use crate::function::{FunctionKind, FunctionTable};
use crate::pulse::{PulseId, PulseRegistry};
use crate::rf::{NoSynthesizer, RfLink, SynthesizerLookup};
use crate::sequence::{self, SequencePlan};
use crate::signal;
use crate::state::{GlobalPulserState, RunMode, TriggerEdge, TriggerMode};
use crate::timebase::{repetition_clock_for, ClockRate, Ticks, MAX_TICKS, PRECISION};
use crate::utils::TickTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Setup,
    Finished,
}

pub struct Pulser {
    config: PulserConfig,
    state: GlobalPulserState,
    registry: PulseRegistry,
    functions: FunctionTable,
    cards: CardTable,
    driver: Box<dyn PulserDriver>,
    rf: RfLink,
    run_mode: RunMode,
    phase: Phase,
    hardware_open: bool,
    needs_update: bool,
    dump: Option<Box<dyn Write>>,
    last_plan: Option<SequencePlan>,
    last_report: Option<CommitReport>,
}

fn redundant(msg: String) {
    let notice = Notice::Redundant(msg);
    warn!(%notice, "Redundant request");
}

impl Pulser {
    /// Creates a pulser for the cards named in `config`, driven through `driver`.
    /// The RF synthesizer is looked up by the configured module name.
    pub fn new(
        config: PulserConfig,
        driver: Box<dyn PulserDriver>,
        lookup: &dyn SynthesizerLookup,
    ) -> Result<Self> {
        config.validate()?;
        let cards = CardTable::new(&config)?;
        let rf = RfLink::resolve(lookup, &config.synthesizer_module);
        Ok(Self {
            state: GlobalPulserState::new(config.default_timebase),
            registry: PulseRegistry::new(),
            functions: FunctionTable::new(),
            cards,
            driver,
            rf,
            run_mode: RunMode::Test,
            phase: Phase::Setup,
            hardware_open: false,
            needs_update: true,
            dump: None,
            last_plan: None,
            last_report: None,
            config,
        })
    }

    /// A pulser without hardware and without RF synthesizer
    pub fn dry_run(config: PulserConfig) -> Result<Self> {
        let driver = RecordingDriver::new(Duration::from_millis(config.busy_timeout_ms));
        Self::new(config, Box::new(driver), &NoSynthesizer)
    }

    // FIELD methods
    pub fn config(&self) -> &PulserConfig {
        &self.config
    }
    pub fn registry(&self) -> &PulseRegistry {
        &self.registry
    }
    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }
    pub fn cards(&self) -> &CardTable {
        &self.cards
    }
    pub fn global_state(&self) -> &GlobalPulserState {
        &self.state
    }
    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }
    pub fn is_running(&self) -> bool {
        self.state.is_running
    }
    pub fn is_setup_finished(&self) -> bool {
        self.phase == Phase::Finished
    }
    pub fn needs_update(&self) -> bool {
        self.needs_update
    }
    pub fn last_plan(&self) -> Option<&SequencePlan> {
        self.last_plan.as_ref()
    }
    pub fn last_report(&self) -> Option<&CommitReport> {
        self.last_report.as_ref()
    }

    /// Committed delay of a card [ticks]
    pub fn card_delay(&self, slot: CardSlot) -> Result<Ticks> {
        Ok(self.cards.card(slot)?.delay)
    }

    pub fn card_is_active(&self, slot: CardSlot) -> Result<bool> {
        Ok(self.cards.card(slot)?.is_active)
    }

    // Helpers
    fn to_ticks(&mut self, time: f64) -> Result<Ticks> {
        self.state.timebase.ensure_set();
        self.state.timebase.to_ticks(time)
    }

    fn to_time(&self, ticks: Ticks) -> f64 {
        self.state.timebase.to_time(ticks)
    }

    fn check_setup(&self, action: &'static str) -> Result<()> {
        match self.phase {
            Phase::Setup => Ok(()),
            Phase::Finished => Err(PulserError::SetupFinished(action)),
        }
    }

    fn check_finished(&self, action: &'static str) -> Result<()> {
        match self.phase {
            Phase::Setup => Err(PulserError::SetupNotFinished(action)),
            Phase::Finished => Ok(()),
        }
    }

    fn is_live(&self) -> bool {
        self.run_mode == RunMode::Experiment && self.hardware_open
    }

    /// Checks that a pulse does not start before its chain can produce it.
    fn check_start(&self, id: PulseId) -> Result<()> {
        let pulse = self.registry.by_id(id)?;
        let Some(pos) = pulse.pos_opt() else {
            return Ok(());
        };
        let Some(kind) = pulse.function_opt() else {
            if pos < 0 {
                return Err(PulserError::InvalidValue(format!(
                    "negative position for pulse #{}",
                    id
                )));
            }
            return Ok(());
        };
        let period = self.state.timebase.period();
        let earliest = self
            .cards
            .min_start_time(kind, self.config.init_delay_min_ticks, period)?;
        let start = self.to_time(pos + self.functions.get(kind).delay);
        if pos < 0 || start < earliest - PRECISION * period {
            return Err(PulserError::PulseTooEarly {
                pulse: id,
                function: kind,
                earliest,
            });
        }
        Ok(())
    }

    fn note_change(&mut self, id: PulseId, attr: PulseAttr, change: Change) {
        match change {
            Change::Applied => self.needs_update = true,
            Change::Redundant => redundant(format!("{} of pulse #{} is unchanged", attr, id)),
        }
    }

    /// Runs `f`, tearing the hardware down if it fails to communicate.
    fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = f(self);
        if let Err(err @ PulserError::HardwareCommFailure { .. }) = &result {
            error!(error = %err, "Hardware failure, closing all cards");
            self.teardown();
        }
        result
    }

    // Pulse setup
    pub fn new_pulse(&mut self, id: PulseId) -> Result<()> {
        self.check_setup("create a pulse")?;
        self.registry.new_pulse(id)?;
        debug!(pulse = id, "Pulse created");
        Ok(())
    }

    pub fn set_function(&mut self, id: PulseId, kind: FunctionKind) -> Result<()> {
        self.check_setup("set a pulse function")?;
        self.registry.by_id_mut(id)?.set_function(kind)?;
        self.functions.declare(kind);
        self.check_start(id)
    }

    pub fn set_position(&mut self, id: PulseId, time: f64) -> Result<()> {
        self.check_setup("set a pulse position")?;
        self.registry.idx(id)?;
        let pos = self.to_ticks(time)?;
        self.registry.by_id_mut(id)?.set_position(pos)?;
        self.check_start(id)
    }

    pub fn set_length(&mut self, id: PulseId, time: f64) -> Result<()> {
        self.check_setup("set a pulse length")?;
        self.registry.idx(id)?;
        let len = self.to_ticks(time)?;
        self.registry.by_id_mut(id)?.set_length(len)
    }

    pub fn set_position_change(&mut self, id: PulseId, time: f64) -> Result<()> {
        self.check_setup("set a pulse position change")?;
        self.registry.idx(id)?;
        let dpos = self.to_ticks(time)?;
        self.registry.by_id_mut(id)?.set_position_change(dpos)?;
        if dpos == 0 {
            redundant(format!("zero position change for pulse #{}", id));
        }
        Ok(())
    }

    pub fn set_length_change(&mut self, id: PulseId, time: f64) -> Result<()> {
        self.check_setup("set a pulse length change")?;
        self.registry.idx(id)?;
        let dlen = self.to_ticks(time)?;
        self.registry.by_id_mut(id)?.set_length_change(dlen)?;
        if dlen == 0 {
            redundant(format!("zero length change for pulse #{}", id));
        }
        Ok(())
    }

    // Pulse queries
    pub fn get_function(&self, id: PulseId) -> Result<FunctionKind> {
        self.registry.by_id(id)?.function()
    }

    pub fn get_position(&self, id: PulseId) -> Result<f64> {
        Ok(self.to_time(self.registry.by_id(id)?.pos()?))
    }

    pub fn get_length(&self, id: PulseId) -> Result<f64> {
        Ok(self.to_time(self.registry.by_id(id)?.len()?))
    }

    pub fn get_position_change(&self, id: PulseId) -> Result<f64> {
        Ok(self.to_time(self.registry.by_id(id)?.dpos()?))
    }

    pub fn get_length_change(&self, id: PulseId) -> Result<f64> {
        Ok(self.to_time(self.registry.by_id(id)?.dlen()?))
    }

    // Run-time changes
    pub fn change_position(&mut self, id: PulseId, time: f64) -> Result<Change> {
        self.check_finished("change a pulse position")?;
        self.registry.idx(id)?;
        let pos = self.to_ticks(time)?;
        if pos < 0 {
            let pulse = self.registry.by_id(id)?;
            return Err(PulserError::PulseTooEarly {
                pulse: id,
                function: pulse.function()?,
                earliest: self.cards.min_start_time(
                    pulse.function()?,
                    self.config.init_delay_min_ticks,
                    self.state.timebase.period(),
                )?,
            });
        }
        let change = self.registry.by_id_mut(id)?.change_position(pos);
        self.note_change(id, PulseAttr::Position, change);
        Ok(change)
    }

    pub fn change_length(&mut self, id: PulseId, time: f64) -> Result<Change> {
        self.check_finished("change a pulse length")?;
        self.registry.idx(id)?;
        let len = self.to_ticks(time)?;
        let change = self.registry.by_id_mut(id)?.change_length(len)?;
        self.note_change(id, PulseAttr::Length, change);
        Ok(change)
    }

    pub fn change_position_change(&mut self, id: PulseId, time: f64) -> Result<Change> {
        self.check_finished("change a pulse position change")?;
        self.registry.idx(id)?;
        let dpos = self.to_ticks(time)?;
        let change = self.registry.by_id_mut(id)?.change_position_change(dpos);
        if change == Change::Redundant {
            redundant(format!("position change of pulse #{} is unchanged", id));
        }
        Ok(change)
    }

    pub fn change_length_change(&mut self, id: PulseId, time: f64) -> Result<Change> {
        self.check_finished("change a pulse length change")?;
        self.registry.idx(id)?;
        let dlen = self.to_ticks(time)?;
        let change = self.registry.by_id_mut(id)?.change_length_change(dlen);
        if change == Change::Redundant {
            redundant(format!("length change of pulse #{} is unchanged", id));
        }
        Ok(change)
    }

    /// Moves the listed pulses, or every pulse with a position change, by their
    /// position change.
    pub fn shift(&mut self, ids: Option<&[PulseId]>) -> Result<()> {
        self.check_finished("shift pulses")?;
        let selected = self.registry.select(ids)?;
        let mut movable = Vec::with_capacity(selected.len());
        for idx in selected {
            let pulse = self.registry.get(idx);
            if ids.is_none() && pulse.dpos().is_err() {
                continue;
            }
            pulse.dpos()?;
            pulse.pos()?;
            movable.push(idx);
        }
        for idx in movable {
            let pulse = self.registry.get_mut(idx);
            if pulse.shift()? {
                self.needs_update = true;
                debug!(
                    pulse = pulse.id(),
                    from = ?pulse.previous().pos,
                    to = ?pulse.pos_opt(),
                    "Pulse shifted"
                );
            }
        }
        Ok(())
    }

    /// Grows the listed pulses, or every pulse with a length change, by their
    /// length change.
    pub fn increment(&mut self, ids: Option<&[PulseId]>) -> Result<()> {
        self.check_finished("increment pulses")?;
        let selected = self.registry.select(ids)?;
        let mut growable = Vec::with_capacity(selected.len());
        for idx in selected {
            let pulse = self.registry.get(idx);
            if ids.is_none() && pulse.dlen().is_err() {
                continue;
            }
            let len = pulse.len()? + pulse.dlen()?;
            if len < 0 {
                return Err(PulserError::InvalidValue(format!(
                    "negative length for pulse #{}",
                    pulse.id()
                )));
            }
            growable.push(idx);
        }
        for idx in growable {
            let pulse = self.registry.get_mut(idx);
            if pulse.increment()? {
                self.needs_update = true;
                debug!(
                    pulse = pulse.id(),
                    from = ?pulse.previous().len,
                    to = ?pulse.len_opt(),
                    "Pulse incremented"
                );
            }
        }
        Ok(())
    }

    /// Brings every pulse back to its state at the end of setup.
    pub fn reset(&mut self) -> Result<()> {
        self.pulse_reset(None)
    }

    pub fn pulse_reset(&mut self, ids: Option<&[PulseId]>) -> Result<()> {
        self.check_finished("reset pulses")?;
        for idx in self.registry.select(ids)? {
            if self.registry.get_mut(idx).reset() {
                self.needs_update = true;
            }
        }
        Ok(())
    }

    // Pulser-wide settings
    pub fn set_timebase(&mut self, period: f64) -> Result<()> {
        self.check_setup("set the timebase")?;
        self.state.timebase.set(period)?;
        info!(period = self.state.timebase.period(), "Timebase set");
        Ok(())
    }

    pub fn timebase(&self) -> f64 {
        self.state.timebase.period()
    }

    pub fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<()> {
        self.check_setup("set the trigger mode")?;
        match self.state.trigger_mode {
            Some(current) if current == mode => {
                redundant(format!("trigger mode is already {}", mode));
                return Ok(());
            }
            Some(current) => {
                return Err(PulserError::InvalidValue(format!(
                    "trigger mode has already been set to {}",
                    current
                )))
            }
            None => {}
        }
        if mode == TriggerMode::External {
            if let Some(function) = self.functions.negative_delay() {
                return Err(PulserError::NegativeDelayInExternalMode { function });
            }
            if self.state.repetition_time.is_some() {
                return Err(PulserError::InvalidValue(
                    "a repetition time requires the internal trigger".to_string(),
                ));
            }
        }
        self.state.trigger_mode = Some(mode);
        info!(%mode, "Trigger mode set");
        Ok(())
    }

    /// Sets the edge of the external trigger. Implies the external trigger mode.
    pub fn set_trigger_slope(&mut self, edge: TriggerEdge) -> Result<()> {
        self.check_setup("set the trigger slope")?;
        if self.state.trigger_mode != Some(TriggerMode::External) {
            self.set_trigger_mode(TriggerMode::External)?;
        }
        self.state.trigger_slope = edge;
        Ok(())
    }

    /// Sets the repetition time of the internal trigger. Implies the internal mode.
    pub fn set_repetition_time(&mut self, time: f64) -> Result<()> {
        self.check_setup("set the repetition time")?;
        if self.state.trigger_mode == Some(TriggerMode::External) {
            return Err(PulserError::InvalidValue(
                "a repetition time cannot be used with the external trigger".to_string(),
            ));
        }
        if let Some(current) = self.state.repetition_time {
            return Err(PulserError::InvalidValue(format!(
                "repetition time has already been set to {} s",
                current
            )));
        }
        let repetition = self.repetition_setting(time)?;
        self.state.repetition_time = Some(time);
        self.state.repetition = Some(repetition);
        self.state.trigger_mode = Some(TriggerMode::Internal);
        info!(time, clock = %repetition.0, ticks = repetition.1, "Repetition time set");
        Ok(())
    }

    pub fn set_repetition_frequency(&mut self, frequency: f64) -> Result<()> {
        if !(frequency > 0.0) {
            return Err(PulserError::InvalidValue(format!(
                "repetition frequency must be positive, got {} Hz",
                frequency
            )));
        }
        self.set_repetition_time(1.0 / frequency)
    }

    fn repetition_setting(&mut self, time: f64) -> Result<(ClockRate, Ticks)> {
        if self.cards.clock(ClockSlot::Repetition).is_some() {
            return repetition_clock_for(time);
        }
        // The repetition trigger shares the timebase clock
        self.state.timebase.ensure_set();
        let (ticks, _) = self.state.timebase.to_ticks_rounded(time);
        if !(time > 0.0) || ticks < 1 {
            return Err(PulserError::InvalidValue(format!(
                "repetition time must be at least one timebase period, got {} s",
                time
            )));
        }
        if ticks > MAX_TICKS {
            return Err(PulserError::TimeTooLong(time));
        }
        Ok((self.state.timebase.rate(), ticks))
    }

    /// Sets the static delay of a function [s]. Negative delays require the
    /// internal trigger and are realized by delaying all other functions.
    pub fn set_function_delay(&mut self, kind: FunctionKind, time: f64) -> Result<()> {
        self.check_setup("set a function delay")?;
        let ticks = self.to_ticks(time)?;
        self.functions.set_delay(
            kind,
            ticks,
            self.state.mode(),
            &mut self.state.neg_delay_floor,
        )?;
        if ticks == 0 {
            redundant(format!("zero delay for function {}", kind));
        }
        debug!(function = %kind, ticks, floor = self.state.neg_delay_floor, "Function delay set");
        Ok(())
    }

    /// Stored delay of a function [s], including the negative-delay offset
    pub fn function_delay(&self, kind: FunctionKind) -> f64 {
        self.to_time(self.functions.get(kind).delay)
    }

    /// Marks a function as used even without pulses
    pub fn declare_function(&mut self, kind: FunctionKind) -> Result<()> {
        self.check_setup("declare a function")?;
        self.functions.declare(kind);
        Ok(())
    }

    /// Writes the committed pulses of every used function to `target` after each update
    pub fn set_dump_target(&mut self, target: Option<Box<dyn Write>>) {
        self.dump = target;
    }

    /// Samples the pulse pattern, see [`signal::calc_signal`].
    pub fn calc_signal(
        &self,
        t_start: f64,
        t_end: f64,
        nsamps: usize,
    ) -> Result<(Vec<FunctionKind>, Array2<f64>)> {
        if self.phase == Phase::Setup {
            let mut functions = self.functions.clone();
            functions.init(&self.registry, &self.cards)?;
            return signal::calc_signal(
                &self.registry,
                &functions,
                &self.state.timebase,
                t_start,
                t_end,
                nsamps,
            );
        }
        signal::calc_signal(
            &self.registry,
            &self.functions,
            &self.state.timebase,
            t_start,
            t_end,
            nsamps,
        )
    }

    // Runs
    fn finish_setup(&mut self) -> Result<()> {
        self.state.timebase.ensure_set();
        self.functions.init(&self.registry, &self.cards)?;
        if self.functions.get(FunctionKind::Rf).is_used {
            self.rf.require()?;
        }
        if self.state.mode() == TriggerMode::External {
            if let Some(function) = self.functions.negative_delay() {
                return Err(PulserError::NegativeDelayInExternalMode { function });
            }
        }
        self.registry.freeze_initial();
        self.phase = Phase::Finished;
        info!(
            pulses = self.registry.len(),
            timebase = self.state.timebase.period(),
            mode = %self.state.mode(),
            "Pulser setup finished"
        );
        Ok(())
    }

    /// Starts a run: finishes the setup on first use, returns all pulses to their
    /// initial state and commits the complete sequence. In experiment mode the cards
    /// are opened first. The pulser is started if its trigger is fully configured.
    pub fn begin_run(&mut self, mode: RunMode) -> Result<()> {
        if self.state.is_running {
            self.run(Some(false))?;
        }
        if self.phase == Phase::Setup {
            self.finish_setup()?;
        } else {
            for pulse in self.registry.iter_mut() {
                pulse.reset();
                pulse.clear_run_flags();
            }
        }
        self.run_mode = mode;
        self.state.is_running = false;
        self.cards.reset_bookkeeping();
        self.functions.reset_cached();
        self.needs_update = true;
        info!(?mode, "Run started");

        self.guarded(|p| {
            if mode == RunMode::Experiment && !p.hardware_open {
                p.open_hardware()?;
            }
            p.rebuild()
        })?;

        if self.state.mode() == TriggerMode::External || self.state.repetition_time.is_some() {
            self.run(Some(true))?;
        } else {
            warn!("No repetition time set, pulser not started");
        }
        Ok(())
    }

    /// Ids of pulses that have not been active at any time during the run
    pub fn never_active(&self) -> Vec<PulseId> {
        self.registry
            .iter()
            .filter(|(_, pulse)| !pulse.has_been_active())
            .map(|(_, pulse)| pulse.id())
            .collect()
    }

    /// Ends a run: stops the pulser and closes the cards.
    pub fn end_run(&mut self) -> Result<()> {
        self.check_finished("end a run")?;
        if self.run_mode == RunMode::Test {
            for id in self.never_active() {
                warn!(pulse = id, "Pulse was never active during the test run");
            }
        }
        if self.state.is_running {
            self.run(Some(false))?;
        }
        if self.hardware_open {
            self.close_hardware()?;
        }
        info!(mode = ?self.run_mode, "Run finished");
        Ok(())
    }

    /// Stops the pulser and releases the hardware.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state.is_running && self.is_live() {
            if let Err(err) = self.stop_trigger() {
                warn!(error = %err, "Stopping the pulser failed");
            }
        }
        self.state.is_running = false;
        if self.hardware_open {
            self.close_hardware()?;
        }
        Ok(())
    }

    /// Sets (`Some`) or queries (`None`) the running state. Returns the new state.
    pub fn run(&mut self, state: Option<bool>) -> Result<bool> {
        let Some(on) = state else {
            return Ok(self.state.is_running);
        };
        self.check_finished("start or stop the pulser")?;
        if on == self.state.is_running {
            redundant(format!(
                "pulser is already {}",
                if on { "running" } else { "stopped" }
            ));
            return Ok(on);
        }
        if on {
            if self.state.mode() == TriggerMode::Internal && self.state.repetition_time.is_none() {
                return Err(PulserError::InvalidValue(
                    "repetition time has not been set".to_string(),
                ));
            }
            self.guarded(|p| {
                if p.needs_update {
                    p.rebuild()?;
                }
                if p.is_live() {
                    p.start_trigger()?;
                }
                Ok(())
            })?;
        } else {
            self.guarded(|p| if p.is_live() { p.stop_trigger() } else { Ok(()) })?;
        }
        self.state.is_running = on;
        info!(running = on, "Pulser state changed");
        Ok(on)
    }

    /// Sends all modifications since the last update.
    pub fn update(&mut self) -> Result<()> {
        self.check_finished("update the pulser")?;
        if !self.needs_update {
            debug!("Pulser is up to date");
            return Ok(());
        }
        self.guarded(|p| p.rebuild())
    }

    /// Rebuilds the sequence and commits it. The repetition trigger is paused while
    /// the cards are rewritten.
    fn rebuild(&mut self) -> Result<()> {
        self.functions.sort_pulses(&self.registry);
        let plan = sequence::build(
            &self.registry,
            &self.functions,
            &self.cards,
            &self.state,
            self.config.init_delay_min_ticks,
        )?;

        let live = self.is_live();
        let restart = live && self.state.is_running;
        if restart {
            self.stop_trigger()?;
        }
        let report = commit::commit(
            &plan,
            &mut self.cards,
            &mut self.functions,
            &self.state.timebase,
            if live { Some(self.driver.as_mut()) } else { None },
            if live { Some(&mut self.rf) } else { None },
        )?;
        self.write_dump()?;
        if restart {
            self.start_trigger()?;
        }

        debug!(
            commands = report.card_commands(),
            rf_calls = report.rf_calls,
            notices = plan.notices.len(),
            "Pulser updated"
        );
        self.needs_update = false;
        self.last_plan = Some(plan);
        self.last_report = Some(report);
        Ok(())
    }

    fn write_dump(&mut self) -> Result<()> {
        let Some(out) = self.dump.as_mut() else {
            return Ok(());
        };
        for function in self.functions.used() {
            let entries: Vec<String> = function
                .active_pulses()
                .iter()
                .map(|&idx| {
                    let pulse = self.registry.get(idx);
                    format!(
                        "{} {} {}",
                        pulse.id(),
                        pulse.pos_opt().unwrap_or(0) + function.delay,
                        pulse.len_opt().unwrap_or(0)
                    )
                })
                .collect();
            if entries.is_empty() {
                writeln!(out, "{}:", function.kind)?;
            } else {
                writeln!(out, "{}: {}", function.kind, entries.join(", "))?;
            }
        }
        out.flush()?;
        Ok(())
    }

    // Hardware
    fn handle(&self, slot: CardSlot) -> Result<CardHandle> {
        let card = self.cards.card(slot)?;
        card.handle
            .ok_or_else(|| PulserError::hardware(&card.name, "card has not been opened"))
    }

    fn clock_handle(&self, slot: ClockSlot) -> Result<CardHandle> {
        let clock = self.cards.clock(slot).ok_or_else(|| {
            PulserError::TopologyMismatch(format!("no clock card configured for {:?}", slot))
        })?;
        clock
            .handle
            .ok_or_else(|| PulserError::hardware(&clock.name, "card has not been opened"))
    }

    fn open_hardware(&mut self) -> Result<()> {
        let mut timer = TickTimer::new();
        self.hardware_open = true;
        for card in self.cards.cards_mut() {
            let handle = self.driver.open_card(&card.name)?;
            card.handle = Some(handle);
            card.intrinsic_delay = self.driver.intrinsic_delay(handle)?;
            self.driver.set_trigger(handle, TriggerEdge::Rising)?;
            self.driver.set_output_pulse(handle, OutputPulse::None)?;
            debug!(card = %card.name, handle, intrinsic = card.intrinsic_delay, "Delay card opened");
        }
        let tb_rate = self.state.timebase.rate();
        for clock in self.cards.clocks_mut() {
            let handle = self.driver.open_clock(&clock.name)?;
            clock.handle = Some(handle);
            let rate = match clock.slot {
                ClockSlot::Timebase => tb_rate,
                ClockSlot::Repetition => ClockRate::Off,
            };
            self.driver.set_frequency(handle, rate)?;
            clock.rate = rate;
            debug!(card = %clock.name, handle, %rate, "Clock card opened");
        }
        timer.tick_log("Hardware opened");
        Ok(())
    }

    /// Closes every opened card. All cards are attempted; the first error is returned.
    fn close_hardware(&mut self) -> Result<()> {
        let mut first_err = None;
        for card in self.cards.cards_mut() {
            if let Some(handle) = card.handle.take() {
                if let Err(err) = self.driver.close_card(handle) {
                    warn!(card = %card.name, error = %err, "Closing card failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        for clock in self.cards.clocks_mut() {
            if let Some(handle) = clock.handle.take() {
                if let Err(err) = self.driver.close_clock(handle) {
                    warn!(card = %clock.name, error = %err, "Closing card failed");
                    first_err.get_or_insert(err);
                }
            }
            clock.rate = ClockRate::Off;
        }
        self.hardware_open = false;
        self.state.is_running = false;
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn teardown(&mut self) {
        if let Err(err) = self.close_hardware() {
            warn!(error = %err, "Teardown incomplete");
        }
    }

    fn start_trigger(&mut self) -> Result<()> {
        let ert = self.handle(CardSlot::Ert)?;
        match self.state.mode() {
            TriggerMode::Internal => {
                let time = self.state.repetition_time.ok_or_else(|| {
                    PulserError::InvalidValue("repetition time has not been set".to_string())
                })?;
                let (rate, ticks) = self.repetition_setting(time)?;
                let slot = self.cards.repetition_clock_slot();
                let clock = self.clock_handle(slot)?;
                self.driver.set_frequency(clock, rate)?;
                if let Some(clock) = self.cards.clock_mut(slot) {
                    clock.rate = rate;
                }
                self.driver.set_raw_delay(ert, ticks)?;
                self.driver.set_output_pulse(ert, OutputPulse::End)?;
                self.driver.software_start(ert)?;
                self.state.repetition = Some((rate, ticks));
            }
            TriggerMode::External => {
                self.driver.set_trigger(ert, self.state.trigger_slope)?;
                self.driver.set_raw_delay(ert, 0)?;
                self.driver.set_output_pulse(ert, OutputPulse::End)?;
            }
        }
        debug!(mode = %self.state.mode(), "Repetition trigger started");
        Ok(())
    }

    fn stop_trigger(&mut self) -> Result<()> {
        if self.state.mode() == TriggerMode::Internal {
            let slot = self.cards.repetition_clock_slot();
            let clock = self.clock_handle(slot)?;
            self.driver.set_frequency(clock, ClockRate::Off)?;
            if let Some(clock) = self.cards.clock_mut(slot) {
                clock.rate = ClockRate::Off;
            }
        }
        let ert = self.handle(CardSlot::Ert)?;
        self.driver.set_output_pulse(ert, OutputPulse::None)?;
        debug!("Repetition trigger stopped");
        Ok(())
    }
}

impl Drop for Pulser {
    fn drop(&mut self) {
        if self.hardware_open {
            if let Err(err) = self.shutdown() {
                warn!(error = %err, "Shutdown on drop failed");
            }
        }
    }
}
