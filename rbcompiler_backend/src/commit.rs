//! Hands a [`SequencePlan`] to the card table and, in live runs, to the hardware.
//!
//! Only differences to the previously committed state are sent. Per delay card
//! (the repetition trigger excepted, it is driven by run/stop):
//!
//! | Transition          | Commands                                  |
//! |---------------------|-------------------------------------------|
//! | became inactive     | output off                                |
//! | became active       | delay register, end pulse on              |
//! | active, new value   | delay register                            |
//! | otherwise           | none                                      |
//!
//! The register of an inactive card is not tracked, hence the unconditional write on
//! activation.

use indexmap::IndexMap;
use tracing::debug;

use crate::card::{CardRole, CardTable, DelayCard};
use crate::driver::{OutputPulse, PulserDriver};
use crate::error::{PulserError, Result};
use crate::function::{FunctionKind, FunctionTable};
use crate::rf::RfLink;
use crate::sequence::SequencePlan;
use crate::timebase::Timebase;
use crate::utils::TickTimer;

/// Commands issued by one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Driver commands per card name
    pub commands: IndexMap<String, usize>,
    pub rf_calls: usize,
}

impl CommitReport {
    fn count(&mut self, card: &str) {
        *self.commands.entry(card.to_string()).or_insert(0) += 1;
    }

    pub fn card_commands(&self) -> usize {
        self.commands.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.card_commands() == 0 && self.rf_calls == 0
    }
}

fn send(card: &DelayCard, driver: &mut dyn PulserDriver, report: &mut CommitReport) -> Result<()> {
    let handle = card
        .handle
        .ok_or_else(|| PulserError::hardware(&card.name, "card has not been opened"))?;

    if card.was_active && !card.is_active {
        debug!(card = %card.name, "Output off");
        driver.set_output_pulse(handle, OutputPulse::None)?;
        report.count(&card.name);
    } else if card.is_active {
        if !card.was_active || card.delay != card.old_delay {
            debug!(card = %card.name, from = card.old_delay, to = card.delay, "Delay");
            driver.set_raw_delay(handle, card.delay)?;
            report.count(&card.name);
        }
        if !card.was_active {
            debug!(card = %card.name, "Output on");
            driver.set_output_pulse(handle, OutputPulse::End)?;
            report.count(&card.name);
        }
    }
    Ok(())
}

/// Applies `plan`. Without a driver (test runs) only the bookkeeping advances.
pub fn commit(
    plan: &SequencePlan,
    cards: &mut CardTable,
    functions: &mut FunctionTable,
    timebase: &Timebase,
    mut driver: Option<&mut dyn PulserDriver>,
    mut rf: Option<&mut RfLink>,
) -> Result<CommitReport> {
    let mut timer = TickTimer::new();
    let mut report = CommitReport::default();

    for card in cards.cards_mut() {
        if card.role == CardRole::Trigger {
            continue;
        }
        let setting = plan.card(card.slot);
        card.is_active = setting.is_active;
        card.delay = if setting.is_active { setting.delay } else { 0 };

        if let Some(driver) = driver.as_deref_mut() {
            send(card, driver, &mut report)?;
        }

        if card.is_active {
            card.old_delay = card.delay;
        } else {
            card.old_delay = 0;
        }
        card.was_active = card.is_active;
    }

    for (&kind, cached) in plan.cached.iter() {
        let function = functions.get_mut(kind);
        if kind == FunctionKind::Rf {
            if let Some(rf) = rf.as_deref_mut() {
                if cached.is_active && cached.len != function.cached_len {
                    rf.set_pulse_width(timebase.to_time(cached.len))?;
                    report.rf_calls += 1;
                }
                if cached.is_active != function.cached_active {
                    rf.set_pulse_state(cached.is_active)?;
                    report.rf_calls += 1;
                }
            }
        }
        function.cached_active = cached.is_active;
        if cached.is_active {
            function.cached_len = cached.len;
        }
    }

    timer.tick_log("Sequence committed");
    Ok(report)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::card::CardSlot;
    use crate::config::PulserConfig;
    use crate::driver::{DelayCardDriver, DriverCall, RecordingDriver};
    use crate::rf::{RecordingSynthesizer, RfCall};
    use crate::sequence::{CachedPulse, CardSetting};

    fn opened_cards(driver: &mut RecordingDriver) -> CardTable {
        let mut cards = CardTable::new(&PulserConfig::default()).unwrap();
        for card in cards.cards_mut() {
            card.handle = Some(driver.open_card(&card.name).unwrap());
        }
        driver.clear();
        cards
    }

    fn plan(settings: &[(CardSlot, i64)]) -> SequencePlan {
        let mut plan = SequencePlan::default();
        for &(slot, delay) in settings {
            plan.cards.insert(slot, CardSetting { delay, is_active: true });
        }
        plan
    }

    #[test]
    fn writes_only_differences() {
        let mut driver = RecordingDriver::default();
        let mut cards = opened_cards(&mut driver);
        let mut functions = FunctionTable::new();
        let tb = Timebase::new(1e-8);

        let first = plan(&[(CardSlot::Init, 10), (CardSlot::Mw(0), 2)]);
        let report = commit(&first, &mut cards, &mut functions, &tb, Some(&mut driver), None).unwrap();
        assert_eq!(report.card_commands(), 4);
        assert_eq!(
            driver.calls(),
            vec![
                DriverCall::SetRawDelay("INIT_DELAY".to_string(), 10),
                DriverCall::SetOutputPulse("INIT_DELAY".to_string(), OutputPulse::End),
                DriverCall::SetRawDelay("MW_DELAY_0".to_string(), 2),
                DriverCall::SetOutputPulse("MW_DELAY_0".to_string(), OutputPulse::End),
            ]
        );

        driver.clear();
        let report = commit(&first, &mut cards, &mut functions, &tb, Some(&mut driver), None).unwrap();
        assert!(report.is_empty());
        assert_eq!(driver.write_count(), 0);

        let second = plan(&[(CardSlot::Init, 12)]);
        commit(&second, &mut cards, &mut functions, &tb, Some(&mut driver), None).unwrap();
        assert_eq!(
            driver.calls(),
            vec![
                DriverCall::SetRawDelay("INIT_DELAY".to_string(), 12),
                DriverCall::SetOutputPulse("MW_DELAY_0".to_string(), OutputPulse::None),
            ]
        );
        let mw0 = cards.card(CardSlot::Mw(0)).unwrap();
        assert_eq!((mw0.delay, mw0.old_delay, mw0.is_active), (0, 0, false));
    }

    #[test]
    fn test_run_only_keeps_books() {
        let mut cards = CardTable::new(&PulserConfig::default()).unwrap();
        let mut functions = FunctionTable::new();
        let tb = Timebase::new(1e-8);
        let report = commit(
            &plan(&[(CardSlot::Init, 3)]),
            &mut cards,
            &mut functions,
            &tb,
            None,
            None,
        )
        .unwrap();
        assert!(report.is_empty());
        let init = cards.card(CardSlot::Init).unwrap();
        assert_eq!((init.old_delay, init.was_active), (3, true));
    }

    #[test]
    fn unopened_card() {
        let mut driver = RecordingDriver::default();
        let mut cards = CardTable::new(&PulserConfig::default()).unwrap();
        let mut functions = FunctionTable::new();
        let tb = Timebase::new(1e-8);
        assert!(matches!(
            commit(&plan(&[(CardSlot::Init, 3)]), &mut cards, &mut functions, &tb, Some(&mut driver), None),
            Err(PulserError::HardwareCommFailure { .. })
        ));
    }

    #[test]
    fn rf_calls_follow_the_cached_length() {
        let mut driver = RecordingDriver::default();
        let mut cards = opened_cards(&mut driver);
        let mut functions = FunctionTable::new();
        let tb = Timebase::new(1e-8);
        let synth = RecordingSynthesizer::new();
        let mut link = RfLink::resolve(&synth.lookup(), "synthesizer");

        let mut p = plan(&[(CardSlot::Init, 1), (CardSlot::Rf, 5)]);
        p.cached.insert(FunctionKind::Rf, CachedPulse { len: 4, is_active: true });
        let report = commit(&p, &mut cards, &mut functions, &tb, Some(&mut driver), Some(&mut link)).unwrap();
        assert_eq!(report.rf_calls, 2);
        assert_eq!(
            synth.calls(),
            vec![RfCall::PulseWidth(4e-8), RfCall::PulseState(true)]
        );

        synth.clear();
        commit(&p, &mut cards, &mut functions, &tb, Some(&mut driver), Some(&mut link)).unwrap();
        assert!(synth.calls().is_empty());

        p.cached.insert(FunctionKind::Rf, CachedPulse { len: 4, is_active: false });
        commit(&p, &mut cards, &mut functions, &tb, Some(&mut driver), Some(&mut link)).unwrap();
        assert_eq!(synth.calls(), vec![RfCall::PulseState(false)]);
    }
}
