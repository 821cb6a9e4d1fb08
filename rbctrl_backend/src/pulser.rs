//! # Driving a Rulbus pulser
//!
//! [`RulbusPulser`] is a [`rbcompiler_backend::pulser::Pulser`] wired to real cards
//! through [`RulbusDriver`]. Everything about building and validating pulse sequences
//! lives in `rbcompiler_backend`; this module only supplies the hardware and, with the
//! `python` feature, an RF synthesizer imported as a python module.
//!
//! ## How to use
//!
//! 1. Create a `RulbusPulser` from a [`PulserConfig`]. The Rulbus library is loaded
//!    right away, the cards are only opened by `begin_run` in experiment mode.
//! 2. Describe pulses and settings as for any `Pulser`.
//! 3. `begin_run`, modify, `update`, `end_run`.

use std::ops::{Deref, DerefMut};

use rbcompiler_backend::error::Result;
use rbcompiler_backend::pulser::Pulser;
use rbcompiler_backend::rf::SynthesizerLookup;
use rbcompiler_backend::PulserConfig;

use crate::device::RulbusDriver;

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg_attr(feature = "python", pyclass(name = "Pulser", unsendable))]
pub struct RulbusPulser {
    pub pulser: Pulser,
}

impl RulbusPulser {
    pub fn new(config: PulserConfig, synthesizers: &dyn SynthesizerLookup) -> Result<Self> {
        let driver = RulbusDriver::new(&config)?;
        Ok(Self {
            pulser: Pulser::new(config, Box::new(driver), synthesizers)?,
        })
    }
}

impl Deref for RulbusPulser {
    type Target = Pulser;
    fn deref(&self) -> &Pulser {
        &self.pulser
    }
}

impl DerefMut for RulbusPulser {
    fn deref_mut(&mut self) -> &mut Pulser {
        &mut self.pulser
    }
}

#[cfg(feature = "python")]
mod python {
    use pyo3::prelude::*;

    use rbcompiler_backend::error::{PulserError, Result};
    use rbcompiler_backend::python::{load_config, to_py_err};
    use rbcompiler_backend::rf::RfSynthesizer;

    use super::RulbusPulser;

    /// RF synthesizer implemented by a python module exposing
    /// `set_pulse_state(bool)` and `set_pulse_width(float)`
    struct PyModuleSynthesizer {
        name: String,
        module: PyObject,
    }

    impl PyModuleSynthesizer {
        fn call(&self, method: &str, arg: impl IntoPy<Py<pyo3::types::PyTuple>>) -> Result<()> {
            Python::with_gil(|py| {
                self.module
                    .call_method1(py, method, arg)
                    .map(|_| ())
                    .map_err(|e| PulserError::hardware(&self.name, e.to_string()))
            })
        }
    }

    impl RfSynthesizer for PyModuleSynthesizer {
        fn set_pulse_state(&mut self, on: bool) -> Result<()> {
            self.call("set_pulse_state", (on,))
        }

        fn set_pulse_width(&mut self, width: f64) -> Result<()> {
            self.call("set_pulse_width", (width,))
        }
    }

    fn import_synthesizer(module: &str) -> std::result::Result<Box<dyn RfSynthesizer>, String> {
        Python::with_gil(|py| {
            let imported = py.import(module).map_err(|e| e.to_string())?;
            Ok(Box::new(PyModuleSynthesizer {
                name: module.to_string(),
                module: imported.into_py(py),
            }) as Box<dyn RfSynthesizer>)
        })
    }

    #[pymethods]
    impl RulbusPulser {
        #[new]
        #[pyo3(signature = (config_path=None))]
        fn py_new(config_path: Option<&str>) -> PyResult<Self> {
            let config = load_config(config_path)?;
            RulbusPulser::new(config, &import_synthesizer).map_err(to_py_err)
        }

        fn library_path(&self) -> String {
            self.pulser.config().library_path.clone()
        }
    }

    rbcompiler_backend::impl_pulser_boilerplate!(RulbusPulser);
}
