//! Logical pulse functions (MW, RF, DET) and the table that owns them.
//!
//! A [`Function`] groups the pulses realized by one card chain. During setup the user
//! may give each function a static delay. Since delay cards cannot count backwards, a
//! negative delay is realized by delaying every *other* function instead; the amount
//! shared by all functions is the negative-delay floor kept in the global state.

use std::fmt;

use indexmap::IndexMap;
use maplit::hashmap;
use tracing::{debug, warn};

use crate::card::{CardSlot, CardTable};
use crate::error::{PulseAttr, PulserError, Result};
use crate::pulse::{PulseIdx, PulseRegistry};
use crate::state::TriggerMode;
use crate::timebase::Ticks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FunctionKind {
    Mw,
    Rf,
    Det,
}

impl FunctionKind {
    pub const ALL: [FunctionKind; 3] = [FunctionKind::Mw, FunctionKind::Rf, FunctionKind::Det];

    pub fn name(&self) -> &'static str {
        match self {
            FunctionKind::Mw => "MW",
            FunctionKind::Rf => "RF",
            FunctionKind::Det => "DET",
        }
    }

    /// Upper bound on the number of pulses regardless of the configured chain
    pub fn limit(&self) -> usize {
        match self {
            FunctionKind::Mw => 3,
            FunctionKind::Rf => 1,
            FunctionKind::Det => 1,
        }
    }

    /// Resolves a function name as used in experiment scripts (case insensitive).
    pub fn from_name(name: &str) -> Result<Self> {
        let aliases = hashmap! {
            "MW" => FunctionKind::Mw,
            "MICROWAVE" => FunctionKind::Mw,
            "RF" => FunctionKind::Rf,
            "RADIO_FREQUENCY" => FunctionKind::Rf,
            "DET" => FunctionKind::Det,
            "DETECTION" => FunctionKind::Det,
        };
        let upper = name.trim().to_ascii_uppercase().replace(' ', "_");
        aliases
            .get(upper.as_str())
            .copied()
            .ok_or_else(|| PulserError::InvalidValue(format!("unknown pulse function '{}'", name)))
    }
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub kind: FunctionKind,
    /// Declared explicitly or referenced by a pulse
    pub is_used: bool,
    /// Pulses of the function; after [`FunctionTable::sort_pulses`] the active ones
    /// come first, ordered by start
    pub pulses: Vec<PulseIdx>,
    pub num_active: usize,
    /// Pulses the function can realize with its configured chain
    pub capacity: usize,
    /// Head of the card chain
    pub first_card: Option<CardSlot>,
    /// Delay as requested by the user
    pub requested_delay: Option<Ticks>,
    /// Delay actually applied, shifted by the negative-delay floor
    pub delay: Ticks,
    /// Length committed for a chain without a length card
    pub cached_len: Ticks,
    pub cached_active: bool,
}

impl Function {
    fn new(kind: FunctionKind) -> Self {
        Self {
            kind,
            is_used: false,
            pulses: Vec::new(),
            num_active: 0,
            capacity: 0,
            first_card: None,
            requested_delay: None,
            delay: 0,
            cached_len: 0,
            cached_active: false,
        }
    }

    pub fn active_pulses(&self) -> &[PulseIdx] {
        &self.pulses[..self.num_active]
    }
}

#[derive(Debug, Clone)]
pub struct FunctionTable {
    functions: IndexMap<FunctionKind, Function>,
}

impl Default for FunctionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionTable {
    pub fn new() -> Self {
        Self {
            functions: FunctionKind::ALL
                .into_iter()
                .map(|kind| (kind, Function::new(kind)))
                .collect(),
        }
    }

    pub fn get(&self, kind: FunctionKind) -> &Function {
        &self.functions[&kind]
    }

    pub fn get_mut(&mut self, kind: FunctionKind) -> &mut Function {
        &mut self.functions[&kind]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Function> {
        self.functions.values()
    }

    /// Functions that take part in the sequence, in table order
    pub fn used(&self) -> impl Iterator<Item = &Function> {
        self.functions.values().filter(|f| f.is_used)
    }

    pub fn declare(&mut self, kind: FunctionKind) {
        self.get_mut(kind).is_used = true;
    }

    /// Assigns the pulses of the registry to their functions and checks every used
    /// function against the capacity of its chain.
    ///
    /// A declared function without pulses is demoted to unused with a warning.
    pub fn init(&mut self, registry: &PulseRegistry, cards: &CardTable) -> Result<()> {
        for function in self.functions.values_mut() {
            function.pulses.clear();
            function.num_active = 0;
        }
        for (idx, pulse) in registry.iter() {
            let Some(kind) = pulse.function_opt() else {
                return Err(PulserError::AttributeNotSet {
                    pulse: pulse.id(),
                    attr: PulseAttr::Function,
                });
            };
            let function = self.get_mut(kind);
            function.is_used = true;
            function.pulses.push(idx);
        }

        for function in self.functions.values_mut() {
            function.first_card = cards.first_card(function.kind);
            function.capacity = function.kind.limit().min(cards.chain_capacity(function.kind));
            if !function.is_used {
                continue;
            }
            if function.pulses.is_empty() {
                warn!(function = %function.kind, "Function is declared but has no pulses, not used");
                function.is_used = false;
                continue;
            }
            if function.first_card.is_none() {
                return Err(PulserError::TopologyMismatch(format!(
                    "function {} has pulses but no cards are configured for it",
                    function.kind
                )));
            }
            if function.pulses.len() > function.capacity {
                return Err(PulserError::TooManyPulses {
                    function: function.kind,
                    requested: function.pulses.len(),
                    capacity: function.capacity,
                });
            }
            debug!(
                function = %function.kind,
                pulses = function.pulses.len(),
                capacity = function.capacity,
                "Function initialized"
            );
        }
        Ok(())
    }

    /// Orders the pulses of every used function: active first, then by start,
    /// ties broken by pulse id.
    pub fn sort_pulses(&mut self, registry: &PulseRegistry) {
        for function in self.functions.values_mut().filter(|f| f.is_used) {
            function.pulses.sort_by_key(|&idx| {
                let pulse = registry.get(idx);
                (
                    !pulse.is_active(),
                    pulse.pos_opt().unwrap_or(Ticks::MAX),
                    pulse.id(),
                )
            });
            function.num_active = function
                .pulses
                .iter()
                .filter(|&&idx| registry.get(idx).is_active())
                .count();
        }
    }

    /// Sets the static delay of `kind`, redistributing negative delays.
    ///
    /// Stored delays are offset by `neg_floor` so that they never become negative.
    /// A request more negative than the current floor raises the floor and delays
    /// every other function by the difference.
    pub fn set_delay(
        &mut self,
        kind: FunctionKind,
        requested: Ticks,
        mode: TriggerMode,
        neg_floor: &mut Ticks,
    ) -> Result<()> {
        if self.get(kind).requested_delay.is_some() {
            return Err(PulserError::DelayAlreadySet(kind));
        }
        if requested < 0 && mode == TriggerMode::External {
            return Err(PulserError::NegativeDelayInExternalMode { function: kind });
        }

        let needed = -requested;
        if needed > *neg_floor {
            let diff = needed - *neg_floor;
            for function in self.functions.values_mut().filter(|f| f.kind != kind) {
                function.delay += diff;
            }
            *neg_floor = needed;
            self.get_mut(kind).delay = 0;
            debug!(function = %kind, floor = needed, "Negative delay floor raised");
        } else {
            self.get_mut(kind).delay = requested + *neg_floor;
        }
        self.get_mut(kind).requested_delay = Some(requested);
        Ok(())
    }

    /// The function holding a negative delay, if any
    pub fn negative_delay(&self) -> Option<FunctionKind> {
        self.functions
            .values()
            .find(|f| f.requested_delay.is_some_and(|d| d < 0))
            .map(|f| f.kind)
    }

    /// Forgets the committed state of cached lengths
    pub fn reset_cached(&mut self) {
        for function in self.functions.values_mut() {
            function.cached_len = 0;
            function.cached_active = false;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::PulserConfig;

    #[test]
    fn names_and_aliases() {
        assert_eq!(FunctionKind::from_name("mw").unwrap(), FunctionKind::Mw);
        assert_eq!(FunctionKind::from_name("Microwave").unwrap(), FunctionKind::Mw);
        assert_eq!(FunctionKind::from_name("radio frequency").unwrap(), FunctionKind::Rf);
        assert_eq!(FunctionKind::from_name("DETECTION").unwrap(), FunctionKind::Det);
        assert!(matches!(
            FunctionKind::from_name("laser"),
            Err(PulserError::InvalidValue(_))
        ));
        assert_eq!(FunctionKind::Det.to_string(), "DET");
    }

    #[test]
    fn negative_delay_redistribution() {
        let mut table = FunctionTable::new();
        let mut floor = 0;
        table
            .set_delay(FunctionKind::Mw, -3, TriggerMode::Internal, &mut floor)
            .unwrap();
        assert_eq!(floor, 3);
        assert_eq!(table.get(FunctionKind::Mw).delay, 0);
        assert_eq!(table.get(FunctionKind::Det).delay, 3);

        table
            .set_delay(FunctionKind::Det, -5, TriggerMode::Internal, &mut floor)
            .unwrap();
        assert_eq!(floor, 5);
        assert_eq!(table.get(FunctionKind::Mw).delay, 2);
        assert_eq!(table.get(FunctionKind::Det).delay, 0);
        assert_eq!(table.get(FunctionKind::Rf).delay, 5);

        // Non-negative requests are offset by the floor
        table
            .set_delay(FunctionKind::Rf, 4, TriggerMode::Internal, &mut floor)
            .unwrap();
        assert_eq!(table.get(FunctionKind::Rf).delay, 9);
        assert_eq!(table.negative_delay(), Some(FunctionKind::Mw));
    }

    #[test]
    fn delay_set_only_once() {
        let mut table = FunctionTable::new();
        let mut floor = 0;
        table
            .set_delay(FunctionKind::Mw, 2, TriggerMode::Internal, &mut floor)
            .unwrap();
        assert!(matches!(
            table.set_delay(FunctionKind::Mw, 2, TriggerMode::Internal, &mut floor),
            Err(PulserError::DelayAlreadySet(FunctionKind::Mw))
        ));
    }

    #[test]
    fn negative_delay_needs_internal_trigger() {
        let mut table = FunctionTable::new();
        let mut floor = 0;
        assert!(matches!(
            table.set_delay(FunctionKind::Det, -1, TriggerMode::External, &mut floor),
            Err(PulserError::NegativeDelayInExternalMode { function: FunctionKind::Det })
        ));
        assert_eq!(floor, 0);
        assert_eq!(table.get(FunctionKind::Mw).delay, 0);
    }

    fn registry_with(pulses: &[(i64, FunctionKind, Option<Ticks>, Option<Ticks>)]) -> PulseRegistry {
        let mut registry = PulseRegistry::new();
        for &(id, kind, pos, len) in pulses {
            let idx = registry.new_pulse(id).unwrap();
            let pulse = registry.get_mut(idx);
            pulse.set_function(kind).unwrap();
            if let Some(pos) = pos {
                pulse.set_position(pos).unwrap();
            }
            if let Some(len) = len {
                pulse.set_length(len).unwrap();
            }
        }
        registry
    }

    #[test]
    fn init_and_sort() {
        let cards = CardTable::new(&PulserConfig::default()).unwrap();
        let registry = registry_with(&[
            (1, FunctionKind::Mw, Some(50), Some(2)),
            (2, FunctionKind::Mw, Some(10), Some(0)),
            (3, FunctionKind::Mw, Some(20), Some(2)),
            (4, FunctionKind::Det, Some(20), Some(5)),
        ]);
        let mut table = FunctionTable::new();
        table.declare(FunctionKind::Rf);
        table.init(&registry, &cards).unwrap();
        assert!(table.get(FunctionKind::Mw).is_used);
        assert!(table.get(FunctionKind::Det).is_used);
        // Declared without pulses
        assert!(!table.get(FunctionKind::Rf).is_used);

        table.sort_pulses(&registry);
        let mw = table.get(FunctionKind::Mw);
        let ids: Vec<i64> = mw.pulses.iter().map(|&i| registry.get(i).id()).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(mw.num_active, 2);
        assert_eq!(mw.active_pulses().len(), 2);
    }

    #[test]
    fn ties_are_broken_by_id() {
        let cards = CardTable::new(&PulserConfig::default()).unwrap();
        let registry = registry_with(&[
            (9, FunctionKind::Mw, Some(30), Some(1)),
            (4, FunctionKind::Mw, Some(30), Some(1)),
        ]);
        let mut table = FunctionTable::new();
        table.init(&registry, &cards).unwrap();
        table.sort_pulses(&registry);
        let first = table.get(FunctionKind::Mw).pulses[0];
        assert_eq!(registry.get(first).id(), 4);
    }

    #[test]
    fn too_many_pulses() {
        let mut config = PulserConfig::default();
        config.cards.mw_delays.truncate(3);
        let cards = CardTable::new(&config).unwrap();
        let registry = registry_with(&[
            (1, FunctionKind::Mw, Some(10), Some(1)),
            (2, FunctionKind::Mw, Some(20), Some(1)),
            (3, FunctionKind::Mw, Some(30), Some(1)),
        ]);
        let mut table = FunctionTable::new();
        let err = table.init(&registry, &cards).unwrap_err();
        assert!(matches!(
            err,
            PulserError::TooManyPulses { function: FunctionKind::Mw, requested: 3, capacity: 2 }
        ));
        assert!(err.to_string().contains("MW"));
    }

    #[test]
    fn pulse_without_function() {
        let cards = CardTable::new(&PulserConfig::default()).unwrap();
        let mut registry = PulseRegistry::new();
        registry.new_pulse(7).unwrap();
        let mut table = FunctionTable::new();
        assert!(matches!(
            table.init(&registry, &cards),
            Err(PulserError::AttributeNotSet { pulse: 7, attr: PulseAttr::Function })
        ));
    }

    #[test]
    fn function_without_cards() {
        let mut config = PulserConfig::default();
        config.cards.rf_delay = None;
        let cards = CardTable::new(&config).unwrap();
        let registry = registry_with(&[(1, FunctionKind::Rf, Some(10), Some(1))]);
        let mut table = FunctionTable::new();
        assert!(matches!(
            table.init(&registry, &cards),
            Err(PulserError::TopologyMismatch(_))
        ));
    }
}
