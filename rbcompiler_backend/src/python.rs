//! Python bindings.
//!
//! [`impl_pulser_boilerplate`] generates the python-exposed wrappers around a [`Pulser`]
//! for any pyclass holding one in a field named `pulser`, so that crates supplying
//! their own driver (such as `rbctrl_backend`) get the full surface and can add
//! methods of their own in a separate `#[pymethods]` block.
//!
//! Validation errors are raised as `ValueError`, configuration and hardware errors as
//! `RuntimeError`.

use std::path::Path;

pub use numpy;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::config::PulserConfig;
use crate::driver::RecordingDriver;
use crate::error::{Change, ErrorCategory, PulserError};
use crate::function::FunctionKind;
use crate::pulser::Pulser;
use crate::rf::NoSynthesizer;

pub fn to_py_err(err: PulserError) -> PyErr {
    match err.category() {
        ErrorCategory::Validation => PyValueError::new_err(err.to_string()),
        ErrorCategory::Configuration | ErrorCategory::Hardware => {
            PyRuntimeError::new_err(err.to_string())
        }
    }
}

pub fn function_kind(name: &str) -> PyResult<FunctionKind> {
    FunctionKind::from_name(name).map_err(to_py_err)
}

pub fn applied(change: Change) -> bool {
    change == Change::Applied
}

pub fn load_config(path: Option<&str>) -> PyResult<PulserConfig> {
    match path {
        Some(path) => PulserConfig::load(Path::new(path)),
        None => Ok(PulserConfig::default()),
    }
    .map_err(to_py_err)
}

/// Generates the `#[pymethods]` wrappers for a struct with a `pulser: Pulser` field.
///
/// # Example
/// ```ignore
/// #[pyclass(unsendable)]
/// struct MyPulser {
///     pulser: rbcompiler_backend::pulser::Pulser,
/// }
/// rbcompiler_backend::impl_pulser_boilerplate!(MyPulser);
/// ```
#[macro_export]
macro_rules! impl_pulser_boilerplate {
    ($pulser_type: ty) => {
        #[::pyo3::pymethods]
        impl $pulser_type {
            // Setup
            pub fn new_pulse(&mut self, id: i64) -> ::pyo3::PyResult<()> {
                self.pulser.new_pulse(id).map_err($crate::python::to_py_err)
            }

            pub fn set_function(&mut self, id: i64, function: &str) -> ::pyo3::PyResult<()> {
                let kind = $crate::python::function_kind(function)?;
                self.pulser.set_function(id, kind).map_err($crate::python::to_py_err)
            }

            pub fn set_position(&mut self, id: i64, time: f64) -> ::pyo3::PyResult<()> {
                self.pulser.set_position(id, time).map_err($crate::python::to_py_err)
            }

            pub fn set_length(&mut self, id: i64, time: f64) -> ::pyo3::PyResult<()> {
                self.pulser.set_length(id, time).map_err($crate::python::to_py_err)
            }

            pub fn set_position_change(&mut self, id: i64, time: f64) -> ::pyo3::PyResult<()> {
                self.pulser
                    .set_position_change(id, time)
                    .map_err($crate::python::to_py_err)
            }

            pub fn set_length_change(&mut self, id: i64, time: f64) -> ::pyo3::PyResult<()> {
                self.pulser
                    .set_length_change(id, time)
                    .map_err($crate::python::to_py_err)
            }

            pub fn get_function(&self, id: i64) -> ::pyo3::PyResult<String> {
                self.pulser
                    .get_function(id)
                    .map(|kind| kind.name().to_string())
                    .map_err($crate::python::to_py_err)
            }

            pub fn get_position(&self, id: i64) -> ::pyo3::PyResult<f64> {
                self.pulser.get_position(id).map_err($crate::python::to_py_err)
            }

            pub fn get_length(&self, id: i64) -> ::pyo3::PyResult<f64> {
                self.pulser.get_length(id).map_err($crate::python::to_py_err)
            }

            pub fn get_position_change(&self, id: i64) -> ::pyo3::PyResult<f64> {
                self.pulser.get_position_change(id).map_err($crate::python::to_py_err)
            }

            pub fn get_length_change(&self, id: i64) -> ::pyo3::PyResult<f64> {
                self.pulser.get_length_change(id).map_err($crate::python::to_py_err)
            }

            // Pulser-wide settings
            pub fn set_timebase(&mut self, period: f64) -> ::pyo3::PyResult<()> {
                self.pulser.set_timebase(period).map_err($crate::python::to_py_err)
            }

            pub fn timebase(&self) -> f64 {
                self.pulser.timebase()
            }

            pub fn set_trigger_mode(&mut self, mode: &str) -> ::pyo3::PyResult<()> {
                let mode = $crate::state::TriggerMode::from_name(mode)
                    .map_err($crate::python::to_py_err)?;
                self.pulser.set_trigger_mode(mode).map_err($crate::python::to_py_err)
            }

            pub fn set_trigger_slope(&mut self, slope: &str) -> ::pyo3::PyResult<()> {
                let edge = $crate::state::TriggerEdge::from_name(slope)
                    .map_err($crate::python::to_py_err)?;
                self.pulser.set_trigger_slope(edge).map_err($crate::python::to_py_err)
            }

            pub fn set_repetition_time(&mut self, time: f64) -> ::pyo3::PyResult<()> {
                self.pulser.set_repetition_time(time).map_err($crate::python::to_py_err)
            }

            pub fn set_repetition_frequency(&mut self, frequency: f64) -> ::pyo3::PyResult<()> {
                self.pulser
                    .set_repetition_frequency(frequency)
                    .map_err($crate::python::to_py_err)
            }

            pub fn set_function_delay(&mut self, function: &str, time: f64) -> ::pyo3::PyResult<()> {
                let kind = $crate::python::function_kind(function)?;
                self.pulser
                    .set_function_delay(kind, time)
                    .map_err($crate::python::to_py_err)
            }

            pub fn declare_function(&mut self, function: &str) -> ::pyo3::PyResult<()> {
                let kind = $crate::python::function_kind(function)?;
                self.pulser.declare_function(kind).map_err($crate::python::to_py_err)
            }

            #[pyo3(signature = (path=None))]
            pub fn set_dump_file(&mut self, path: Option<&str>) -> ::pyo3::PyResult<()> {
                let target: Option<Box<dyn ::std::io::Write>> = match path {
                    Some(path) => {
                        let file = ::std::fs::File::create(path)
                            .map_err(|e| $crate::python::to_py_err(e.into()))?;
                        Some(Box::new(::std::io::BufWriter::new(file)))
                    }
                    None => None,
                };
                self.pulser.set_dump_target(target);
                Ok(())
            }

            // Runs
            pub fn begin_run(&mut self, mode: &str) -> ::pyo3::PyResult<()> {
                let mode = $crate::state::RunMode::from_name(mode)
                    .map_err($crate::python::to_py_err)?;
                self.pulser.begin_run(mode).map_err($crate::python::to_py_err)
            }

            pub fn end_run(&mut self) -> ::pyo3::PyResult<()> {
                self.pulser.end_run().map_err($crate::python::to_py_err)
            }

            pub fn shutdown(&mut self) -> ::pyo3::PyResult<()> {
                self.pulser.shutdown().map_err($crate::python::to_py_err)
            }

            #[pyo3(signature = (state=None))]
            pub fn run(&mut self, state: Option<bool>) -> ::pyo3::PyResult<bool> {
                self.pulser.run(state).map_err($crate::python::to_py_err)
            }

            pub fn update(&mut self) -> ::pyo3::PyResult<()> {
                self.pulser.update().map_err($crate::python::to_py_err)
            }

            pub fn change_position(&mut self, id: i64, time: f64) -> ::pyo3::PyResult<bool> {
                self.pulser
                    .change_position(id, time)
                    .map($crate::python::applied)
                    .map_err($crate::python::to_py_err)
            }

            pub fn change_length(&mut self, id: i64, time: f64) -> ::pyo3::PyResult<bool> {
                self.pulser
                    .change_length(id, time)
                    .map($crate::python::applied)
                    .map_err($crate::python::to_py_err)
            }

            pub fn change_position_change(&mut self, id: i64, time: f64) -> ::pyo3::PyResult<bool> {
                self.pulser
                    .change_position_change(id, time)
                    .map($crate::python::applied)
                    .map_err($crate::python::to_py_err)
            }

            pub fn change_length_change(&mut self, id: i64, time: f64) -> ::pyo3::PyResult<bool> {
                self.pulser
                    .change_length_change(id, time)
                    .map($crate::python::applied)
                    .map_err($crate::python::to_py_err)
            }

            #[pyo3(signature = (ids=None))]
            pub fn shift(&mut self, ids: Option<Vec<i64>>) -> ::pyo3::PyResult<()> {
                self.pulser.shift(ids.as_deref()).map_err($crate::python::to_py_err)
            }

            #[pyo3(signature = (ids=None))]
            pub fn increment(&mut self, ids: Option<Vec<i64>>) -> ::pyo3::PyResult<()> {
                self.pulser.increment(ids.as_deref()).map_err($crate::python::to_py_err)
            }

            pub fn reset(&mut self) -> ::pyo3::PyResult<()> {
                self.pulser.reset().map_err($crate::python::to_py_err)
            }

            #[pyo3(signature = (ids=None))]
            pub fn pulse_reset(&mut self, ids: Option<Vec<i64>>) -> ::pyo3::PyResult<()> {
                self.pulser.pulse_reset(ids.as_deref()).map_err($crate::python::to_py_err)
            }

            pub fn never_active(&self) -> Vec<i64> {
                self.pulser.never_active()
            }

            pub fn calc_signal(
                &self,
                py: ::pyo3::Python<'_>,
                t_start: f64,
                t_end: f64,
                nsamps: usize,
            ) -> ::pyo3::PyResult<(Vec<String>, ::pyo3::PyObject)> {
                use ::pyo3::ToPyObject as _;
                let (kinds, arr) = self
                    .pulser
                    .calc_signal(t_start, t_end, nsamps)
                    .map_err($crate::python::to_py_err)?;
                let names = kinds.iter().map(|k| k.name().to_string()).collect();
                let array = $crate::python::numpy::PyArray::from_array(py, &arr);
                Ok((names, array.to_object(py)))
            }
        }
    };
}

/// A pulser that records card commands instead of sending them.
#[pyclass(name = "DryRunPulser", unsendable)]
pub struct DryRunPulser {
    pub pulser: Pulser,
    driver: RecordingDriver,
}

#[pymethods]
impl DryRunPulser {
    #[new]
    #[pyo3(signature = (config_path=None))]
    fn new(config_path: Option<&str>) -> PyResult<Self> {
        let config = load_config(config_path)?;
        let driver = RecordingDriver::new(std::time::Duration::from_millis(config.busy_timeout_ms));
        let pulser =
            Pulser::new(config, Box::new(driver.clone()), &NoSynthesizer).map_err(to_py_err)?;
        Ok(Self { pulser, driver })
    }

    /// Card commands recorded so far, one string per command
    fn driver_log(&self) -> Vec<String> {
        self.driver.calls().iter().map(|c| format!("{:?}", c)).collect()
    }

    fn clear_driver_log(&self) {
        self.driver.clear();
    }
}

crate::impl_pulser_boilerplate!(DryRunPulser);
