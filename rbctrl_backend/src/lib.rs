//! Rulbus hardware backend for `rbcompiler_backend`.

pub mod device;
pub mod pulser;
pub mod rulbus;

pub use crate::device::RulbusDriver;
pub use crate::pulser::RulbusPulser;

#[cfg(feature = "python")]
#[pyo3::pymodule]
fn rbctrl_backend(_py: pyo3::Python, m: &pyo3::types::PyModule) -> pyo3::PyResult<()> {
    m.add_class::<RulbusPulser>()?;
    Ok(())
}
