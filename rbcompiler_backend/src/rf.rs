//! Link to the RF synthesizer that shapes the RF pulse.
//!
//! The RF chain has no length card. Its delay card only triggers the synthesizer,
//! which is told separately whether to produce a pulse at all and how long it is.
//! The synthesizer is resolved once, by module name, through a [`SynthesizerLookup`].

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::error::{PulserError, Result};

/// Pulse entry points of an RF synthesizer.
pub trait RfSynthesizer {
    fn set_pulse_state(&mut self, on: bool) -> Result<()>;
    /// Width of the pulse [s]
    fn set_pulse_width(&mut self, width: f64) -> Result<()>;
}

/// Resolves a synthesizer module by name.
pub trait SynthesizerLookup {
    fn resolve(&self, module: &str) -> std::result::Result<Box<dyn RfSynthesizer>, String>;
}

impl<F> SynthesizerLookup for F
where
    F: Fn(&str) -> std::result::Result<Box<dyn RfSynthesizer>, String>,
{
    fn resolve(&self, module: &str) -> std::result::Result<Box<dyn RfSynthesizer>, String> {
        self(module)
    }
}

/// Lookup for setups without any synthesizer module
pub struct NoSynthesizer;

impl SynthesizerLookup for NoSynthesizer {
    fn resolve(&self, module: &str) -> std::result::Result<Box<dyn RfSynthesizer>, String> {
        Err(format!("no module named '{}' is loaded", module))
    }
}

pub enum RfLink {
    Connected {
        module: String,
        synthesizer: Box<dyn RfSynthesizer>,
    },
    Unavailable {
        module: String,
        reason: String,
    },
}

impl fmt::Debug for RfLink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RfLink::Connected { module, .. } => write!(f, "RfLink::Connected({})", module),
            RfLink::Unavailable { module, reason } => {
                write!(f, "RfLink::Unavailable({}: {})", module, reason)
            }
        }
    }
}

impl RfLink {
    pub fn resolve(lookup: &dyn SynthesizerLookup, module: &str) -> Self {
        match lookup.resolve(module) {
            Ok(synthesizer) => {
                debug!(module, "RF synthesizer resolved");
                RfLink::Connected {
                    module: module.to_string(),
                    synthesizer,
                }
            }
            Err(reason) => {
                warn!(module, %reason, "RF synthesizer unavailable");
                RfLink::Unavailable {
                    module: module.to_string(),
                    reason,
                }
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, RfLink::Connected { .. })
    }

    /// Fails unless a synthesizer is connected
    pub fn require(&self) -> Result<()> {
        match self {
            RfLink::Connected { .. } => Ok(()),
            RfLink::Unavailable { module, reason } => Err(PulserError::RfUnavailable {
                module: module.clone(),
                reason: reason.clone(),
            }),
        }
    }

    fn synthesizer(&mut self) -> Result<&mut Box<dyn RfSynthesizer>> {
        match self {
            RfLink::Connected { synthesizer, .. } => Ok(synthesizer),
            RfLink::Unavailable { module, reason } => Err(PulserError::RfUnavailable {
                module: module.clone(),
                reason: reason.clone(),
            }),
        }
    }

    pub fn set_pulse_state(&mut self, on: bool) -> Result<()> {
        debug!(on, "RF pulse state");
        self.synthesizer()?.set_pulse_state(on)
    }

    pub fn set_pulse_width(&mut self, width: f64) -> Result<()> {
        debug!(width, "RF pulse width");
        self.synthesizer()?.set_pulse_width(width)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RfCall {
    PulseState(bool),
    PulseWidth(f64),
}

/// Synthesizer double recording every call. Clones share their recording.
#[derive(Debug, Clone, Default)]
pub struct RecordingSynthesizer {
    calls: Rc<RefCell<Vec<RfCall>>>,
}

impl RecordingSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RfCall> {
        self.calls.borrow().clone()
    }

    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
    }

    /// A lookup resolving any module name to this synthesizer
    pub fn lookup(&self) -> impl SynthesizerLookup {
        let synth = self.clone();
        move |_: &str| -> std::result::Result<Box<dyn RfSynthesizer>, String> {
            Ok(Box::new(synth.clone()))
        }
    }
}

impl RfSynthesizer for RecordingSynthesizer {
    fn set_pulse_state(&mut self, on: bool) -> Result<()> {
        self.calls.borrow_mut().push(RfCall::PulseState(on));
        Ok(())
    }

    fn set_pulse_width(&mut self, width: f64) -> Result<()> {
        self.calls.borrow_mut().push(RfCall::PulseWidth(width));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unavailable_link() {
        let mut link = RfLink::resolve(&NoSynthesizer, "synthesizer");
        assert!(!link.is_connected());
        assert!(matches!(
            link.require(),
            Err(PulserError::RfUnavailable { ref module, .. }) if module == "synthesizer"
        ));
        assert!(link.set_pulse_state(true).is_err());
    }

    #[test]
    fn connected_link_forwards() {
        let synth = RecordingSynthesizer::new();
        let mut link = RfLink::resolve(&synth.lookup(), "hp8664a");
        link.require().unwrap();
        link.set_pulse_state(true).unwrap();
        link.set_pulse_width(2e-7).unwrap();
        assert_eq!(
            synth.calls(),
            vec![RfCall::PulseState(true), RfCall::PulseWidth(2e-7)]
        );
    }

    #[test]
    fn closure_lookup_by_name() {
        let synth = RecordingSynthesizer::new();
        let lookup = move |module: &str| -> std::result::Result<Box<dyn RfSynthesizer>, String> {
            if module == "hp8664a" {
                Ok(Box::new(synth.clone()))
            } else {
                Err("not loaded".to_string())
            }
        };
        assert!(RfLink::resolve(&lookup, "hp8664a").is_connected());
        assert!(!RfLink::resolve(&lookup, "sml01").is_connected());
    }
}
