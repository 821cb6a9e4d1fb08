//! Pulse-sequence compiler for Rulbus delay-card pulsers.
//!
//! An experiment describes pulses abstractly (function, position, length and their
//! per-step changes). The [`pulser::Pulser`] translates them into the delay settings of
//! a fixed chain of RB8514 delay cards clocked by RB8515 clock cards, validates the
//! resulting sequence and keeps the cards synchronized, sending only what changed.
//!
//! The hardware is reached through [`driver::PulserDriver`]; this crate ships the
//! recording implementation used for dry runs and tests, `rbctrl_backend` the one on
//! top of the Rulbus library.

pub mod card;
pub mod commit;
pub mod config;
pub mod driver;
pub mod error;
pub mod function;
pub mod pulse;
pub mod pulser;
#[cfg(feature = "python")]
pub mod python;
pub mod rf;
pub mod sequence;
pub mod signal;
pub mod state;
pub mod timebase;
pub mod utils;

pub use card::*;
pub use config::*;
pub use error::*;
pub use function::*;
pub use pulse::*;
pub use pulser::*;
pub use state::*;
pub use timebase::*;

#[cfg(feature = "python")]
#[pyo3::pymodule]
fn rbcompiler_backend(_py: pyo3::Python, m: &pyo3::types::PyModule) -> pyo3::PyResult<()> {
    m.add_class::<python::DryRunPulser>()?;
    Ok(())
}
