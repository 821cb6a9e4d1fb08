//! Translation of the pulse model into delay card settings.
//!
//! [`build`] walks the chain of every used function in lock-step with its active
//! pulses and computes what each card has to hold. It reads the model and returns a
//! [`SequencePlan`]; the card table is only touched when a valid plan is committed
//! (see [`crate::commit`]), so a rejected sequence leaves the hardware state untouched.
//!
//! For each function, the walk starts at the end edge of the init card:
//! * a *delay-before* card gets the gap up to the start of the next pulse, net of its
//!   own intrinsic delay and that of the following length card,
//! * a *length* card gets the length of the pulse it realizes,
//! * a chain ending in a delay-before card caches the length of its last pulse.
//!
//! The first MW pulse is special: the MW chain starts with a length card, so the init
//! card delay is chosen to put that pulse at its position.

use indexmap::IndexMap;
use tracing::warn;

use crate::card::{CardRole, CardSlot, CardTable};
use crate::error::{Notice, PulserError, Result};
use crate::function::{Function, FunctionKind, FunctionTable};
use crate::pulse::{PulseId, PulseRegistry};
use crate::state::{GlobalPulserState, TriggerMode};
use crate::timebase::{Ticks, Timebase, MAX_TICKS};

/// Value and activity of one delay card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CardSetting {
    pub delay: Ticks,
    pub is_active: bool,
}

/// Pulse length of a chain without a length card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CachedPulse {
    pub len: Ticks,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequencePlan {
    /// Every card except the repetition trigger, in topology order
    pub cards: IndexMap<CardSlot, CardSetting>,
    pub cached: IndexMap<FunctionKind, CachedPulse>,
    /// End of the last pulse of each function with active pulses, relative to the
    /// trigger of the init card [s]
    pub end_times: IndexMap<FunctionKind, f64>,
    pub notices: Vec<Notice>,
}

impl SequencePlan {
    pub fn card(&self, slot: CardSlot) -> CardSetting {
        self.cards.get(&slot).copied().unwrap_or_default()
    }

    pub fn init_ticks(&self) -> Ticks {
        self.card(CardSlot::Init).delay
    }
}

/// Checks rounding of a computed card delay, recording a notice if needed.
fn round_delay(
    timebase: &Timebase,
    card: &str,
    time: f64,
    notices: &mut Vec<Notice>,
) -> Ticks {
    let (ticks, precise) = timebase.to_ticks_rounded(time);
    if !precise {
        let notice = Notice::Precision {
            card: card.to_string(),
            requested: time,
            realized: timebase.to_time(ticks),
        };
        warn!(%notice, "Imprecise card delay");
        notices.push(notice);
    }
    ticks
}

fn check_range(ticks: Ticks, time: f64) -> Result<Ticks> {
    if ticks > MAX_TICKS {
        return Err(PulserError::TimeTooLong(time));
    }
    Ok(ticks)
}

struct ChainWalk<'a> {
    registry: &'a PulseRegistry,
    cards: &'a CardTable,
    timebase: &'a Timebase,
    init_floor: Ticks,
}

impl ChainWalk<'_> {
    /// Start of an active pulse relative to the origin [s]
    fn start(&self, function: &Function, k: usize) -> Result<(PulseId, f64)> {
        let pulse = self.registry.get(function.active_pulses()[k]);
        let ticks = pulse.pos()? + function.delay;
        Ok((pulse.id(), self.timebase.to_time(ticks)))
    }

    fn len(&self, function: &Function, k: usize) -> Result<Ticks> {
        self.registry.get(function.active_pulses()[k]).len()
    }

    /// Walks the chain of `function`, triggered at `t` [s]. Returns the end of its
    /// last pulse, if any.
    fn walk(
        &self,
        function: &Function,
        mut t: f64,
        plan: &mut SequencePlan,
    ) -> Result<Option<f64>> {
        let chain = self.cards.chain(function.kind);
        let num_active = if function.is_used { function.num_active } else { 0 };
        let period = self.timebase.period();
        let mut k = 0;
        let mut end = None;

        for (i, &(slot, role)) in chain.iter().enumerate() {
            let card = self.cards.card(slot)?;
            if k >= num_active {
                plan.cards.insert(slot, CardSetting::default());
                continue;
            }
            match role {
                CardRole::DelayBefore => {
                    let next_length = match chain.get(i + 1) {
                        Some(&(next, CardRole::Length)) => Some(self.cards.card(next)?),
                        _ => None,
                    };
                    let (id, start) = self.start(function, k)?;
                    let gap = start
                        - t
                        - card.intrinsic_delay
                        - next_length.map_or(0.0, |c| c.intrinsic_delay);
                    let ticks = round_delay(self.timebase, &card.name, gap, &mut plan.notices);
                    if ticks < 0 {
                        return Err(if k == 0 {
                            PulserError::PulseTooEarly {
                                pulse: id,
                                function: function.kind,
                                earliest: self.cards.min_start_time(
                                    function.kind,
                                    self.init_floor,
                                    period,
                                )?,
                            }
                        } else {
                            PulserError::PulsesOverlap {
                                function: function.kind,
                                first: self.start(function, k - 1)?.0,
                                second: id,
                            }
                        });
                    }
                    let ticks = check_range(ticks, gap)?;
                    plan.cards.insert(slot, CardSetting { delay: ticks, is_active: true });
                    t += card.intrinsic_delay + self.timebase.to_time(ticks);

                    if next_length.is_none() {
                        // The pulse itself is produced at the end edge of this card
                        let len = self.len(function, k)?;
                        plan.cached.insert(function.kind, CachedPulse { len, is_active: true });
                        end = Some(t + self.timebase.to_time(len));
                        k += 1;
                    }
                }
                CardRole::Length => {
                    let len = self.len(function, k)?;
                    let len = check_range(len, self.timebase.to_time(len))?;
                    plan.cards.insert(slot, CardSetting { delay: len, is_active: true });
                    t += card.intrinsic_delay + self.timebase.to_time(len);
                    end = Some(t);
                    k += 1;
                }
                CardRole::Trigger | CardRole::Init => {
                    return Err(PulserError::TopologyMismatch(format!(
                        "card {} cannot be part of the {} chain",
                        slot, function.kind
                    )))
                }
            }
        }

        if k < num_active {
            return Err(PulserError::TooManyPulses {
                function: function.kind,
                requested: num_active,
                capacity: function.capacity,
            });
        }
        Ok(end)
    }

    /// Delay of the init card: the floor, or what places the first MW pulse.
    fn init_ticks(&self, functions: &FunctionTable, plan: &mut SequencePlan) -> Result<Ticks> {
        let mw = functions.get(FunctionKind::Mw);
        if !mw.is_used || mw.num_active == 0 {
            return Ok(self.init_floor);
        }
        let head = match self.cards.chain(FunctionKind::Mw).first() {
            Some(&(slot, CardRole::Length)) => self.cards.card(slot)?,
            _ => return Ok(self.init_floor),
        };
        let init = self.cards.card(CardSlot::Init)?;
        let (id, start) = self.start(mw, 0)?;
        let offset = start - init.intrinsic_delay - head.intrinsic_delay;
        let ticks = round_delay(self.timebase, &init.name, offset, &mut plan.notices);
        if ticks < self.init_floor {
            return Err(PulserError::PulseTooEarly {
                pulse: id,
                function: FunctionKind::Mw,
                earliest: self.cards.min_start_time(
                    FunctionKind::Mw,
                    self.init_floor,
                    self.timebase.period(),
                )?,
            });
        }
        check_range(ticks, offset)
    }
}

/// Computes the card settings realizing the current pulse model.
///
/// The pulses of every function must have been sorted with
/// [`FunctionTable::sort_pulses`] beforehand.
pub fn build(
    registry: &PulseRegistry,
    functions: &FunctionTable,
    cards: &CardTable,
    state: &GlobalPulserState,
    init_floor: Ticks,
) -> Result<SequencePlan> {
    let walk = ChainWalk {
        registry,
        cards,
        timebase: &state.timebase,
        init_floor,
    };
    let mut plan = SequencePlan::default();

    let init_ticks = walk.init_ticks(functions, &mut plan)?;
    plan.cards.insert(
        CardSlot::Init,
        CardSetting {
            delay: init_ticks,
            is_active: true,
        },
    );
    let origin_end = cards.card(CardSlot::Init)?.intrinsic_delay + state.timebase.to_time(init_ticks);

    for function in functions.iter() {
        if cards.first_card(function.kind).is_none() {
            continue;
        }
        if !cards.has_length_card(function.kind) {
            plan.cached.insert(function.kind, CachedPulse::default());
        }
        if let Some(end) = walk.walk(function, origin_end, &mut plan)? {
            plan.end_times.insert(function.kind, end);
        }
    }

    if state.mode() == TriggerMode::Internal {
        if let Some(repetition) = state.repetition_time {
            let tolerance = state.timebase.period() * 1e-6;
            for (&kind, &end) in plan.end_times.iter() {
                if end > repetition + tolerance {
                    return Err(PulserError::SequenceTooLong {
                        function: kind,
                        end,
                        repetition,
                    });
                }
            }
        }
    }
    Ok(plan)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::PulserConfig;
    use crate::pulse::PulseIdx;

    struct Fixture {
        registry: PulseRegistry,
        functions: FunctionTable,
        cards: CardTable,
        state: GlobalPulserState,
    }

    impl Fixture {
        fn new(config: &PulserConfig) -> Self {
            let mut state = GlobalPulserState::new(1e-8);
            state.timebase.ensure_set();
            Self {
                registry: PulseRegistry::new(),
                functions: FunctionTable::new(),
                cards: CardTable::new(config).unwrap(),
                state,
            }
        }

        fn pulse(&mut self, id: PulseId, kind: FunctionKind, pos: Ticks, len: Ticks) -> PulseIdx {
            let idx = self.registry.new_pulse(id).unwrap();
            let p = self.registry.get_mut(idx);
            p.set_function(kind).unwrap();
            p.set_position(pos).unwrap();
            p.set_length(len).unwrap();
            idx
        }

        fn build(&mut self) -> Result<SequencePlan> {
            self.functions.init(&self.registry, &self.cards)?;
            self.functions.sort_pulses(&self.registry);
            build(&self.registry, &self.functions, &self.cards, &self.state, 1)
        }
    }

    #[test]
    fn single_mw_pulse() {
        let mut fx = Fixture::new(&PulserConfig::default());
        fx.pulse(1, FunctionKind::Mw, 10, 2);
        fx.state.repetition_time = Some(1e-6);
        let plan = fx.build().unwrap();
        assert_eq!(plan.init_ticks(), 10);
        assert_eq!(plan.card(CardSlot::Mw(0)), CardSetting { delay: 2, is_active: true });
        assert!(!plan.card(CardSlot::Mw(1)).is_active);
        assert!(!plan.card(CardSlot::Det(0)).is_active);
        assert!((plan.end_times[&FunctionKind::Mw] - 120e-9).abs() < 1e-15);
        assert!(plan.notices.is_empty());
    }

    #[test]
    fn intrinsic_delays_shift_the_init_card() {
        let mut config = PulserConfig::default();
        config.intrinsic_delays.insert("INIT_DELAY".to_string(), 20e-9);
        config.intrinsic_delays.insert("MW_DELAY_0".to_string(), 10e-9);
        let mut fx = Fixture::new(&config);
        fx.pulse(1, FunctionKind::Mw, 10, 2);
        let plan = fx.build().unwrap();
        assert_eq!(plan.init_ticks(), 7);
    }

    #[test]
    fn rounded_init_delay_is_reported() {
        let mut config = PulserConfig::default();
        config.intrinsic_delays.insert("INIT_DELAY".to_string(), 43e-9);
        let mut fx = Fixture::new(&config);
        fx.pulse(1, FunctionKind::Mw, 10, 2);
        let plan = fx.build().unwrap();
        assert_eq!(plan.init_ticks(), 6);
        assert_eq!(plan.notices.len(), 1);
        assert!(matches!(
            &plan.notices[0],
            Notice::Precision { card, requested, realized }
                if card == "INIT_DELAY"
                    && (requested - 57e-9).abs() < 1e-15
                    && (realized - 60e-9).abs() < 1e-15
        ));
    }

    #[test]
    fn rounded_gap_is_reported() {
        let mut config = PulserConfig::default();
        config.intrinsic_delays.insert("DET_DELAY_0".to_string(), 6e-9);
        let mut fx = Fixture::new(&config);
        fx.pulse(1, FunctionKind::Det, 30, 5);
        let plan = fx.build().unwrap();
        assert_eq!(plan.card(CardSlot::Det(0)), CardSetting { delay: 28, is_active: true });
        assert_eq!(plan.card(CardSlot::Det(1)).delay, 5);
        assert!(matches!(
            plan.notices.as_slice(),
            [Notice::Precision { card, .. }] if card == "DET_DELAY_0"
        ));
    }

    #[test]
    fn init_floor_without_mw() {
        let mut fx = Fixture::new(&PulserConfig::default());
        fx.pulse(1, FunctionKind::Det, 30, 5);
        let plan = fx.build().unwrap();
        assert_eq!(plan.init_ticks(), 1);
        // Detection starts 20 ticks after the end edge of the init card
        assert_eq!(plan.card(CardSlot::Det(0)), CardSetting { delay: 29, is_active: true });
        assert_eq!(plan.card(CardSlot::Det(1)), CardSetting { delay: 5, is_active: true });
    }

    #[test]
    fn mw_chain_alternates() {
        let mut fx = Fixture::new(&PulserConfig::default());
        fx.pulse(1, FunctionKind::Mw, 10, 2);
        fx.pulse(2, FunctionKind::Mw, 20, 3);
        fx.pulse(3, FunctionKind::Mw, 40, 4);
        let plan = fx.build().unwrap();
        assert_eq!(plan.init_ticks(), 10);
        assert_eq!(plan.card(CardSlot::Mw(0)).delay, 2);
        // First pulse ends at 12, second starts at 20
        assert_eq!(plan.card(CardSlot::Mw(1)).delay, 8);
        assert_eq!(plan.card(CardSlot::Mw(2)).delay, 3);
        assert_eq!(plan.card(CardSlot::Mw(3)).delay, 17);
        assert_eq!(plan.card(CardSlot::Mw(4)).delay, 4);
    }

    #[test]
    fn rf_length_is_cached() {
        let mut fx = Fixture::new(&PulserConfig::default());
        fx.pulse(1, FunctionKind::Rf, 15, 6);
        let plan = fx.build().unwrap();
        assert_eq!(plan.card(CardSlot::Rf), CardSetting { delay: 14, is_active: true });
        assert_eq!(plan.cached[&FunctionKind::Rf], CachedPulse { len: 6, is_active: true });
        assert!((plan.end_times[&FunctionKind::Rf] - 210e-9).abs() < 1e-15);
    }

    #[test]
    fn overlapping_pulses() {
        let mut fx = Fixture::new(&PulserConfig::default());
        fx.pulse(1, FunctionKind::Mw, 10, 20);
        fx.pulse(2, FunctionKind::Mw, 20, 3);
        assert!(matches!(
            fx.build(),
            Err(PulserError::PulsesOverlap { function: FunctionKind::Mw, first: 1, second: 2 })
        ));
    }

    #[test]
    fn pulse_before_init_end() {
        let mut fx = Fixture::new(&PulserConfig::default());
        fx.pulse(1, FunctionKind::Mw, 30, 2);
        fx.pulse(2, FunctionKind::Det, 10, 2);
        assert!(matches!(
            fx.build(),
            Err(PulserError::PulseTooEarly { pulse: 2, function: FunctionKind::Det, .. })
        ));

        let mut fx = Fixture::new(&PulserConfig::default());
        fx.pulse(1, FunctionKind::Mw, 0, 2);
        assert!(matches!(
            fx.build(),
            Err(PulserError::PulseTooEarly { pulse: 1, function: FunctionKind::Mw, .. })
        ));
    }

    #[test]
    fn sequence_too_long() {
        let mut fx = Fixture::new(&PulserConfig::default());
        fx.pulse(1, FunctionKind::Mw, 10, 2);
        fx.state.repetition_time = Some(50e-9);
        assert!(matches!(
            fx.build(),
            Err(PulserError::SequenceTooLong { function: FunctionKind::Mw, .. })
        ));
        // Not checked with an external trigger
        fx.state.trigger_mode = Some(TriggerMode::External);
        fx.build().unwrap();
    }

    #[test]
    fn inactive_pulses_free_their_cards() {
        let mut fx = Fixture::new(&PulserConfig::default());
        fx.pulse(1, FunctionKind::Mw, 10, 2);
        let idx = fx.pulse(2, FunctionKind::Mw, 30, 2);
        let plan = fx.build().unwrap();
        assert!(plan.card(CardSlot::Mw(2)).is_active);

        fx.registry.get_mut(idx).change_length(0).unwrap();
        let plan = fx.build().unwrap();
        assert!(!plan.card(CardSlot::Mw(1)).is_active);
        assert!(!plan.card(CardSlot::Mw(2)).is_active);
    }

    #[test]
    fn delay_beyond_register() {
        let mut fx = Fixture::new(&PulserConfig::default());
        fx.pulse(1, FunctionKind::Det, MAX_TICKS + 10, 2);
        assert!(matches!(fx.build(), Err(PulserError::TimeTooLong(_))));
    }

    #[test]
    fn function_delay_moves_pulses() {
        let mut fx = Fixture::new(&PulserConfig::default());
        fx.pulse(1, FunctionKind::Mw, 10, 2);
        fx.pulse(2, FunctionKind::Det, 30, 2);
        let mut floor = 0;
        fx.functions
            .set_delay(FunctionKind::Det, -5, TriggerMode::Internal, &mut floor)
            .unwrap();
        let plan = fx.build().unwrap();
        // MW is delayed by the floor instead
        assert_eq!(plan.init_ticks(), 15);
        assert_eq!(plan.card(CardSlot::Det(0)).delay, 15);
    }

    #[test]
    fn rebuild_is_idempotent() {
        let mut fx = Fixture::new(&PulserConfig::default());
        fx.pulse(1, FunctionKind::Mw, 10, 2);
        fx.pulse(2, FunctionKind::Mw, 25, 2);
        fx.pulse(3, FunctionKind::Det, 40, 8);
        let first = fx.build().unwrap();
        let second = fx.build().unwrap();
        assert_eq!(first, second);
    }
}
