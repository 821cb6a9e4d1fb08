//! Logical pulses and the registry that owns them.
//!
//! A [`Pulse`] is what the user declares: a function it belongs to, a start position,
//! a length and optional per-step changes of both. Times are kept in timebase
//! [`Ticks`]; the conversion from seconds happens in the front-end
//! (see [`crate::pulser`]).
//!
//! ## Attribute lifecycle
//! During setup each attribute may be assigned exactly once (`set_*`). Once an experiment
//! runs, the `change_*` methods may overwrite position, length and the changes; resubmitting
//! an identical value is reported as [`Change::Redundant`] instead of failing.
//!
//! ## Arena
//! The [`PulseRegistry`] stores pulses in a `Vec` and hands out stable [`PulseIdx`]
//! values. Functions refer to their pulses only through these indices.

use indexmap::IndexMap;

use crate::error::{Change, PulseAttr, PulserError, Result};
use crate::function::FunctionKind;
use crate::timebase::Ticks;

/// User-visible pulse number
pub type PulseId = i64;

/// Stable index of a pulse inside the [`PulseRegistry`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PulseIdx(pub usize);

/// The changeable state of a pulse, used for resets and shift reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PulseSnapshot {
    pub pos: Option<Ticks>,
    pub len: Option<Ticks>,
    pub dpos: Option<Ticks>,
    pub dlen: Option<Ticks>,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct Pulse {
    id: PulseId,
    function: Option<FunctionKind>,
    pos: Option<Ticks>,
    len: Option<Ticks>,
    dpos: Option<Ticks>,
    dlen: Option<Ticks>,

    initial: Option<PulseSnapshot>,
    previous: PulseSnapshot,

    is_active: bool,
    has_been_active: bool,
}

/// Assigns `value` to a setup-time attribute that must not have been assigned before.
fn set_once<T>(slot: &mut Option<T>, value: T, pulse: PulseId, attr: PulseAttr) -> Result<()> {
    if slot.is_some() {
        return Err(PulserError::AttributeAlreadySet { pulse, attr });
    }
    *slot = Some(value);
    Ok(())
}

fn get_set<T: Copy>(slot: &Option<T>, pulse: PulseId, attr: PulseAttr) -> Result<T> {
    slot.ok_or(PulserError::AttributeNotSet { pulse, attr })
}

fn check_length(pulse: PulseId, len: Ticks) -> Result<()> {
    if len < 0 {
        return Err(PulserError::InvalidValue(format!(
            "negative length for pulse #{}",
            pulse
        )));
    }
    Ok(())
}

impl Pulse {
    pub fn new(id: PulseId) -> Self {
        Self {
            id,
            function: None,
            pos: None,
            len: None,
            dpos: None,
            dlen: None,
            initial: None,
            previous: PulseSnapshot::default(),
            is_active: false,
            has_been_active: false,
        }
    }

    // Field methods
    pub fn id(&self) -> PulseId {
        self.id
    }
    pub fn function(&self) -> Result<FunctionKind> {
        get_set(&self.function, self.id, PulseAttr::Function)
    }
    pub fn function_opt(&self) -> Option<FunctionKind> {
        self.function
    }
    pub fn pos(&self) -> Result<Ticks> {
        get_set(&self.pos, self.id, PulseAttr::Position)
    }
    pub fn pos_opt(&self) -> Option<Ticks> {
        self.pos
    }
    pub fn len(&self) -> Result<Ticks> {
        get_set(&self.len, self.id, PulseAttr::Length)
    }
    pub fn len_opt(&self) -> Option<Ticks> {
        self.len
    }
    pub fn dpos(&self) -> Result<Ticks> {
        get_set(&self.dpos, self.id, PulseAttr::PositionChange)
    }
    pub fn dlen(&self) -> Result<Ticks> {
        get_set(&self.dlen, self.id, PulseAttr::LengthChange)
    }
    pub fn is_active(&self) -> bool {
        self.is_active
    }
    pub fn has_been_active(&self) -> bool {
        self.has_been_active
    }
    pub fn previous(&self) -> &PulseSnapshot {
        &self.previous
    }

    /// Re-derives `is_active` from position and length.
    pub fn update_activity(&mut self) {
        self.is_active = self.pos.is_some() && self.len.is_some_and(|len| len > 0);
        if self.is_active {
            self.has_been_active = true;
        }
    }

    // Setup-time assignments
    pub fn set_function(&mut self, function: FunctionKind) -> Result<()> {
        set_once(&mut self.function, function, self.id, PulseAttr::Function)
    }

    pub fn set_position(&mut self, pos: Ticks) -> Result<()> {
        set_once(&mut self.pos, pos, self.id, PulseAttr::Position)?;
        self.update_activity();
        Ok(())
    }

    pub fn set_length(&mut self, len: Ticks) -> Result<()> {
        if self.len.is_some() {
            return Err(PulserError::AttributeAlreadySet {
                pulse: self.id,
                attr: PulseAttr::Length,
            });
        }
        check_length(self.id, len)?;
        self.len = Some(len);
        self.update_activity();
        Ok(())
    }

    pub fn set_position_change(&mut self, dpos: Ticks) -> Result<()> {
        set_once(&mut self.dpos, dpos, self.id, PulseAttr::PositionChange)
    }

    pub fn set_length_change(&mut self, dlen: Ticks) -> Result<()> {
        set_once(&mut self.dlen, dlen, self.id, PulseAttr::LengthChange)
    }

    // Run-time changes
    fn change(slot: &mut Option<Ticks>, value: Ticks) -> Change {
        if *slot == Some(value) {
            return Change::Redundant;
        }
        *slot = Some(value);
        Change::Applied
    }

    pub fn change_position(&mut self, pos: Ticks) -> Change {
        self.previous = self.snapshot();
        let change = Self::change(&mut self.pos, pos);
        self.update_activity();
        change
    }

    pub fn change_length(&mut self, len: Ticks) -> Result<Change> {
        check_length(self.id, len)?;
        self.previous = self.snapshot();
        let change = Self::change(&mut self.len, len);
        self.update_activity();
        Ok(change)
    }

    pub fn change_position_change(&mut self, dpos: Ticks) -> Change {
        Self::change(&mut self.dpos, dpos)
    }

    pub fn change_length_change(&mut self, dlen: Ticks) -> Change {
        Self::change(&mut self.dlen, dlen)
    }

    /// Moves the pulse by its position change. Returns `false` for a zero change.
    pub fn shift(&mut self) -> Result<bool> {
        let dpos = self.dpos()?;
        let pos = self.pos()?;
        self.previous = self.snapshot();
        self.pos = Some(pos + dpos);
        self.update_activity();
        Ok(dpos != 0)
    }

    /// Grows the pulse by its length change. Returns `false` for a zero change.
    pub fn increment(&mut self) -> Result<bool> {
        let dlen = self.dlen()?;
        let len = self.len()?;
        check_length(self.id, len + dlen)?;
        self.previous = self.snapshot();
        self.len = Some(len + dlen);
        self.update_activity();
        Ok(dlen != 0)
    }

    pub fn snapshot(&self) -> PulseSnapshot {
        PulseSnapshot {
            pos: self.pos,
            len: self.len,
            dpos: self.dpos,
            dlen: self.dlen,
            is_active: self.is_active,
        }
    }

    /// Records the current state as the one [`Pulse::reset`] returns to.
    pub fn freeze_initial(&mut self) {
        self.initial = Some(self.snapshot());
    }

    /// Restores the initial snapshot. Returns whether anything changed.
    pub fn reset(&mut self) -> bool {
        let Some(initial) = self.initial else {
            return false;
        };
        let changed = initial != self.snapshot();
        self.previous = self.snapshot();
        self.pos = initial.pos;
        self.len = initial.len;
        self.dpos = initial.dpos;
        self.dlen = initial.dlen;
        self.update_activity();
        changed
    }

    /// Forgets run history, used between a test run and the live experiment
    pub fn clear_run_flags(&mut self) {
        self.has_been_active = self.is_active;
    }
}

/// Owner of every pulse, addressed by [`PulseIdx`].
#[derive(Debug, Clone, Default)]
pub struct PulseRegistry {
    pulses: Vec<Pulse>,
    index: IndexMap<PulseId, PulseIdx>,
}

impl PulseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_pulse(&mut self, id: PulseId) -> Result<PulseIdx> {
        if self.index.contains_key(&id) {
            return Err(PulserError::DuplicatePulse(id));
        }
        let idx = PulseIdx(self.pulses.len());
        self.pulses.push(Pulse::new(id));
        self.index.insert(id, idx);
        Ok(idx)
    }

    pub fn idx(&self, id: PulseId) -> Result<PulseIdx> {
        self.index
            .get(&id)
            .copied()
            .ok_or(PulserError::UnknownPulse(id))
    }

    pub fn get(&self, idx: PulseIdx) -> &Pulse {
        &self.pulses[idx.0]
    }

    pub fn get_mut(&mut self, idx: PulseIdx) -> &mut Pulse {
        &mut self.pulses[idx.0]
    }

    pub fn by_id(&self, id: PulseId) -> Result<&Pulse> {
        Ok(self.get(self.idx(id)?))
    }

    pub fn by_id_mut(&mut self, id: PulseId) -> Result<&mut Pulse> {
        let idx = self.idx(id)?;
        Ok(self.get_mut(idx))
    }

    pub fn len(&self) -> usize {
        self.pulses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pulses.is_empty()
    }

    /// Iterates pulses in declaration order together with their indices
    pub fn iter(&self) -> impl Iterator<Item = (PulseIdx, &Pulse)> {
        self.pulses
            .iter()
            .enumerate()
            .map(|(i, pulse)| (PulseIdx(i), pulse))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pulse> {
        self.pulses.iter_mut()
    }

    /// Resolves a list of ids, or all pulses for `None`
    pub fn select(&self, ids: Option<&[PulseId]>) -> Result<Vec<PulseIdx>> {
        match ids {
            None => Ok((0..self.pulses.len()).map(PulseIdx).collect()),
            Some(ids) => ids.iter().map(|&id| self.idx(id)).collect(),
        }
    }

    pub fn freeze_initial(&mut self) {
        for pulse in self.pulses.iter_mut() {
            pulse.freeze_initial();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn activity_follows_position_and_length() {
        let mut p = Pulse::new(1);
        assert!(!p.is_active());
        p.set_position(10).unwrap();
        assert!(!p.is_active());
        p.set_length(0).unwrap();
        assert!(!p.is_active());
        assert_eq!(p.change_length(5).unwrap(), Change::Applied);
        assert!(p.is_active());
        assert!(p.has_been_active());
        assert_eq!(p.change_length(0).unwrap(), Change::Applied);
        assert!(!p.is_active());
        assert!(p.has_been_active());
    }

    #[test]
    fn activity_invariant_over_all_states() {
        for pos in [None, Some(0), Some(5)] {
            for len in [None, Some(0), Some(3)] {
                let mut p = Pulse::new(0);
                if let Some(pos) = pos {
                    p.set_position(pos).unwrap();
                }
                if let Some(len) = len {
                    p.set_length(len).unwrap();
                }
                let expected = pos.is_some() && len.is_some_and(|l| l > 0);
                assert_eq!(p.is_active(), expected, "pos {:?} len {:?}", pos, len);
            }
        }
    }

    #[test]
    fn attributes_set_only_once() {
        let mut p = Pulse::new(3);
        p.set_function(FunctionKind::Mw).unwrap();
        p.set_position(1).unwrap();
        p.set_length(2).unwrap();
        p.set_position_change(3).unwrap();
        p.set_length_change(4).unwrap();

        // Even identical values are rejected
        let already = |r: Result<()>, attr: PulseAttr| {
            assert!(matches!(r, Err(PulserError::AttributeAlreadySet { pulse: 3, attr: a }) if a == attr))
        };
        already(p.set_function(FunctionKind::Mw), PulseAttr::Function);
        already(p.set_position(1), PulseAttr::Position);
        already(p.set_length(2), PulseAttr::Length);
        already(p.set_position_change(3), PulseAttr::PositionChange);
        already(p.set_length_change(4), PulseAttr::LengthChange);
    }

    #[test]
    fn unset_attributes() {
        let p = Pulse::new(9);
        assert!(matches!(
            p.pos(),
            Err(PulserError::AttributeNotSet { pulse: 9, attr: PulseAttr::Position })
        ));
        assert!(matches!(
            p.dlen(),
            Err(PulserError::AttributeNotSet { attr: PulseAttr::LengthChange, .. })
        ));
        assert!(p.function().is_err());
    }

    #[test]
    fn negative_length_rejected() {
        let mut p = Pulse::new(1);
        assert!(matches!(p.set_length(-1), Err(PulserError::InvalidValue(_))));
        p.set_length(2).unwrap();
        p.set_length_change(-3).unwrap();
        assert!(p.increment().is_err());
        assert_eq!(p.len().unwrap(), 2);
    }

    #[test]
    fn identical_change_is_redundant() {
        let mut p = Pulse::new(1);
        p.set_position(4).unwrap();
        assert_eq!(p.change_position(4), Change::Redundant);
        assert_eq!(p.change_position(6), Change::Applied);
        assert_eq!(p.previous().pos, Some(4));
    }

    #[test]
    fn shift_increment_and_reset() {
        let mut p = Pulse::new(1);
        p.set_position(10).unwrap();
        p.set_length(2).unwrap();
        p.set_position_change(5).unwrap();
        p.set_length_change(1).unwrap();
        p.freeze_initial();

        assert!(p.shift().unwrap());
        assert!(p.increment().unwrap());
        assert_eq!((p.pos().unwrap(), p.len().unwrap()), (15, 3));
        assert_eq!(p.previous().len, Some(2));

        assert!(p.reset());
        assert_eq!((p.pos().unwrap(), p.len().unwrap()), (10, 2));
        assert!(!p.reset());
    }

    #[test]
    fn shift_requires_change() {
        let mut p = Pulse::new(2);
        p.set_position(1).unwrap();
        assert!(matches!(
            p.shift(),
            Err(PulserError::AttributeNotSet { attr: PulseAttr::PositionChange, .. })
        ));
    }

    #[test]
    fn registry_ids_are_unique() {
        let mut reg = PulseRegistry::new();
        let a = reg.new_pulse(5).unwrap();
        let b = reg.new_pulse(2).unwrap();
        assert_ne!(a, b);
        assert!(matches!(reg.new_pulse(5), Err(PulserError::DuplicatePulse(5))));
        assert_eq!(reg.idx(2).unwrap(), b);
        assert!(matches!(reg.idx(4), Err(PulserError::UnknownPulse(4))));
        assert_eq!(reg.select(None).unwrap(), vec![a, b]);
        assert_eq!(reg.select(Some(&[2])).unwrap(), vec![b]);
    }
}
