//! Static model of the Rulbus delay and clock cards and how they are chained.
//!
//! ## Topology
//! Every experiment shares a leading pair of delay cards: the repetition trigger
//! ([`CardSlot::Ert`]) whose end pulse starts the init card ([`CardSlot::Init`]).
//! The end edge of the init card is the common time origin of all function chains
//! and triggers:
//!
//! | Function | Chain (role)                                                            |
//! |----------|-------------------------------------------------------------------------|
//! | MW       | `Mw(0)` length, `Mw(1)` delay, `Mw(2)` length, `Mw(3)` delay, `Mw(4)` length |
//! | RF       | `Rf` delay; the pulse length is realized by the RF synthesizer          |
//! | DET      | `Det(0)` delay, `Det(1)` length                                         |
//!
//! The start of the first MW pulse is set by the init card itself, which is why the
//! MW chain begins with a length card.
//!
//! ## Time model
//! A card triggered at `t` produces its end edge at `t + intrinsic + ticks * period`.
//! The output of a length card is high between `t + intrinsic` and its end edge.

use std::fmt;

use indexmap::IndexMap;

use crate::config::PulserConfig;
use crate::error::{PulserError, Result};
use crate::function::FunctionKind;
use crate::timebase::{ClockRate, Ticks};

/// Handle returned by the Rulbus library for an opened card
pub type CardHandle = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CardSlot {
    Ert,
    Init,
    Mw(u8),
    Rf,
    Det(u8),
}

impl fmt::Display for CardSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CardSlot::Ert => write!(f, "ERT_DELAY"),
            CardSlot::Init => write!(f, "INIT_DELAY"),
            CardSlot::Mw(i) => write!(f, "MW_DELAY_{}", i),
            CardSlot::Rf => write!(f, "RF_DELAY"),
            CardSlot::Det(i) => write!(f, "DET_DELAY_{}", i),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardRole {
    /// Repetition trigger, only touched by run/stop
    Trigger,
    Init,
    /// Delay before the next pulse of the chain starts
    DelayBefore,
    /// Realizes the length of a pulse
    Length,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockSlot {
    Timebase,
    Repetition,
}

const MW_ROLES: [CardRole; 5] = [
    CardRole::Length,
    CardRole::DelayBefore,
    CardRole::Length,
    CardRole::DelayBefore,
    CardRole::Length,
];
const DET_ROLES: [CardRole; 2] = [CardRole::DelayBefore, CardRole::Length];

/// Bookkeeping for one RB8514 delay card.
#[derive(Debug, Clone)]
pub struct DelayCard {
    pub slot: CardSlot,
    /// Physical name as known to the Rulbus library
    pub name: String,
    pub role: CardRole,
    pub handle: Option<CardHandle>,
    /// Value to be written by the next commit
    pub delay: Ticks,
    /// Value the hardware currently holds
    pub old_delay: Ticks,
    /// Fixed delay between trigger and start of counting [s]
    pub intrinsic_delay: f64,
    pub is_active: bool,
    pub was_active: bool,
    pub prev: Option<CardSlot>,
    pub next: Option<CardSlot>,
}

impl DelayCard {
    fn new(slot: CardSlot, name: &str, role: CardRole, intrinsic_delay: f64) -> Self {
        Self {
            slot,
            name: name.to_string(),
            role,
            handle: None,
            delay: 0,
            old_delay: 0,
            intrinsic_delay,
            is_active: false,
            was_active: false,
            prev: None,
            next: None,
        }
    }

    /// Forgets everything that was committed.
    pub fn reset_bookkeeping(&mut self) {
        self.delay = 0;
        self.old_delay = 0;
        self.is_active = false;
        self.was_active = false;
    }
}

/// Bookkeeping for one RB8515 clock card.
#[derive(Debug, Clone)]
pub struct ClockCard {
    pub slot: ClockSlot,
    pub name: String,
    pub handle: Option<CardHandle>,
    pub rate: ClockRate,
}

/// All cards of the pulser in topology order.
#[derive(Debug, Clone)]
pub struct CardTable {
    cards: IndexMap<CardSlot, DelayCard>,
    clocks: IndexMap<ClockSlot, ClockCard>,
}

impl CardTable {
    /// Builds the card table from the configured names. Intrinsic delays are taken
    /// from the configuration until the hardware is opened.
    pub fn new(config: &PulserConfig) -> Result<Self> {
        let names = &config.cards;
        let mut cards = IndexMap::new();
        let mut add = |slot: CardSlot, name: &str, role: CardRole| {
            cards.insert(
                slot,
                DelayCard::new(slot, name, role, config.intrinsic_delay(name)),
            );
        };

        add(CardSlot::Ert, &names.ert_delay, CardRole::Trigger);
        add(CardSlot::Init, &names.init_delay, CardRole::Init);
        if names.mw_delays.len() > MW_ROLES.len() {
            return Err(PulserError::TopologyMismatch(format!(
                "at most {} MW cards can be chained",
                MW_ROLES.len()
            )));
        }
        for (i, name) in names.mw_delays.iter().enumerate() {
            add(CardSlot::Mw(i as u8), name, MW_ROLES[i]);
        }
        if let Some(name) = &names.rf_delay {
            add(CardSlot::Rf, name, CardRole::DelayBefore);
        }
        match names.det_delays.len() {
            0 => {}
            2 => {
                for (i, name) in names.det_delays.iter().enumerate() {
                    add(CardSlot::Det(i as u8), name, DET_ROLES[i]);
                }
            }
            n => {
                return Err(PulserError::TopologyMismatch(format!(
                    "DET chain needs exactly 2 cards, got {}",
                    n
                )))
            }
        }

        let mut clocks = IndexMap::new();
        clocks.insert(
            ClockSlot::Timebase,
            ClockCard {
                slot: ClockSlot::Timebase,
                name: names.tb_clock.clone(),
                handle: None,
                rate: ClockRate::Off,
            },
        );
        if let Some(name) = &names.ert_clock {
            clocks.insert(
                ClockSlot::Repetition,
                ClockCard {
                    slot: ClockSlot::Repetition,
                    name: name.clone(),
                    handle: None,
                    rate: ClockRate::Off,
                },
            );
        }

        let mut table = Self { cards, clocks };
        table.link();
        Ok(table)
    }

    /// Fills in the `prev`/`next` links of every chain.
    fn link(&mut self) {
        let mut links: Vec<(CardSlot, CardSlot)> = vec![(CardSlot::Ert, CardSlot::Init)];
        for kind in FunctionKind::ALL {
            let chain = self.chain(kind);
            if let Some(&(first, _)) = chain.first() {
                links.push((CardSlot::Init, first));
            }
            for pair in chain.windows(2) {
                links.push((pair[0].0, pair[1].0));
            }
        }
        for (from, to) in links {
            if let Some(card) = self.cards.get_mut(&to) {
                card.prev = Some(from);
            }
            // Init triggers several chains; its `next` is the first one (MW if present)
            if let Some(card) = self.cards.get_mut(&from) {
                if card.next.is_none() {
                    card.next = Some(to);
                }
            }
        }
    }

    pub fn card(&self, slot: CardSlot) -> Result<&DelayCard> {
        self.cards
            .get(&slot)
            .ok_or_else(|| PulserError::TopologyMismatch(format!("card {} is not configured", slot)))
    }

    pub fn card_mut(&mut self, slot: CardSlot) -> Result<&mut DelayCard> {
        self.cards
            .get_mut(&slot)
            .ok_or_else(|| PulserError::TopologyMismatch(format!("card {} is not configured", slot)))
    }

    pub fn has_card(&self, slot: CardSlot) -> bool {
        self.cards.contains_key(&slot)
    }

    pub fn cards(&self) -> impl Iterator<Item = &DelayCard> {
        self.cards.values()
    }

    pub fn cards_mut(&mut self) -> impl Iterator<Item = &mut DelayCard> {
        self.cards.values_mut()
    }

    pub fn clock(&self, slot: ClockSlot) -> Option<&ClockCard> {
        self.clocks.get(&slot)
    }

    pub fn clock_mut(&mut self, slot: ClockSlot) -> Option<&mut ClockCard> {
        self.clocks.get_mut(&slot)
    }

    pub fn clocks(&self) -> impl Iterator<Item = &ClockCard> {
        self.clocks.values()
    }

    pub fn clocks_mut(&mut self) -> impl Iterator<Item = &mut ClockCard> {
        self.clocks.values_mut()
    }

    /// Clock card driving the repetition trigger
    pub fn repetition_clock_slot(&self) -> ClockSlot {
        if self.clocks.contains_key(&ClockSlot::Repetition) {
            ClockSlot::Repetition
        } else {
            ClockSlot::Timebase
        }
    }

    /// The configured cards of a function's chain with their roles, in trigger order.
    pub fn chain(&self, kind: FunctionKind) -> Vec<(CardSlot, CardRole)> {
        let slots: Vec<CardSlot> = match kind {
            FunctionKind::Mw => (0..MW_ROLES.len() as u8).map(CardSlot::Mw).collect(),
            FunctionKind::Rf => vec![CardSlot::Rf],
            FunctionKind::Det => (0..DET_ROLES.len() as u8).map(CardSlot::Det).collect(),
        };
        slots
            .into_iter()
            .filter_map(|slot| self.cards.get(&slot).map(|card| (slot, card.role)))
            .collect()
    }

    /// Whether the chain of `kind` ends the pulse with its own length card.
    /// Without one the length is cached on the function.
    pub fn has_length_card(&self, kind: FunctionKind) -> bool {
        self.chain(kind)
            .iter()
            .any(|&(_, role)| role == CardRole::Length)
    }

    /// Number of pulses the chain of `kind` can realize.
    pub fn chain_capacity(&self, kind: FunctionKind) -> usize {
        let chain = self.chain(kind);
        let lengths = chain
            .iter()
            .filter(|&&(_, role)| role == CardRole::Length)
            .count();
        let cached = matches!(chain.last(), Some(&(_, CardRole::DelayBefore)));
        lengths + usize::from(cached)
    }

    /// Head of the chain of `kind`, if configured
    pub fn first_card(&self, kind: FunctionKind) -> Option<CardSlot> {
        self.chain(kind).first().map(|&(slot, _)| slot)
    }

    /// Earliest start [s] of a pulse of `kind` relative to the time origin, reached
    /// with the init card at its floor and all delay cards of the chain at zero.
    pub fn min_start_time(&self, kind: FunctionKind, init_floor: Ticks, period: f64) -> Result<f64> {
        let init = self.card(CardSlot::Init)?;
        let mut earliest = init.intrinsic_delay + init_floor as f64 * period;
        for (slot, role) in self.chain(kind) {
            earliest += self.card(slot)?.intrinsic_delay;
            if role == CardRole::Length {
                break;
            }
        }
        Ok(earliest)
    }

    /// Forgets committed state of every card, used before each run
    pub fn reset_bookkeeping(&mut self) {
        for card in self.cards.values_mut() {
            card.reset_bookkeeping();
        }
        for clock in self.clocks.values_mut() {
            clock.rate = ClockRate::Off;
        }
    }
}
