//! Minimal wrapper for the parts of the Rulbus C library the pulser needs.
//!
//! ## Overview
//!
//! [`RulbusLib`] loads the shared library at run time (`dlopen`) and resolves the card
//! entry points once. Every call goes through [`RulbusLib::call`], which checks the
//! return code and turns a negative one into a [`RulbusError::Call`] carrying the
//! library's own error message.
//!
//! Loading at run time keeps the crate buildable and testable on machines without the
//! Rulbus library; only opening the pulser requires it.
//!
//! ## Resource management
//!
//! The library handle is released in `Drop`. Cards and the bus itself are closed by
//! [`crate::device::RulbusDriver`].

use std::ffi::{CStr, CString};

use libc::{c_char, c_double, c_int, c_ulong, c_void};
use rbcompiler_backend::error::PulserError;
use tracing::{debug, error};

pub const RULBUS_OK: c_int = 0;

pub const RULBUS_RB8514_DELAY_FALLING_EDGE: c_int = 0;
pub const RULBUS_RB8514_DELAY_RAISING_EDGE: c_int = 1;

pub const RULBUS_RB8514_DELAY_OUTPUT_BOTH: c_int = 3;
pub const RULBUS_RB8514_DELAY_PULSE_NONE: c_int = 0;
pub const RULBUS_RB8514_DELAY_START_PULSE: c_int = 1;
pub const RULBUS_RB8514_DELAY_END_PULSE: c_int = 2;

pub const RULBUS_RB8515_CLOCK_FREQ_OFF: c_int = 0;
pub const RULBUS_RB8515_CLOCK_FREQ_100MHZ: c_int = 1;
pub const RULBUS_RB8515_CLOCK_FREQ_10MHZ: c_int = 2;
pub const RULBUS_RB8515_CLOCK_FREQ_1MHZ: c_int = 3;
pub const RULBUS_RB8515_CLOCK_FREQ_100KHZ: c_int = 4;
pub const RULBUS_RB8515_CLOCK_FREQ_10KHZ: c_int = 5;
pub const RULBUS_RB8515_CLOCK_FREQ_1KHZ: c_int = 6;

#[derive(Debug, thiserror::Error)]
pub enum RulbusError {
    #[error("cannot load Rulbus library '{path}': {reason}")]
    Library { path: String, reason: String },

    #[error("Rulbus library lacks '{name}': {reason}")]
    MissingSymbol { name: &'static str, reason: String },

    #[error("Rulbus error {code} on card '{card}': {message}")]
    Call {
        card: String,
        code: c_int,
        message: String,
    },

    #[error("card name '{0}' contains a NUL byte")]
    InvalidName(String),
}

impl From<RulbusError> for PulserError {
    fn from(err: RulbusError) -> Self {
        let card = match &err {
            RulbusError::Call { card, .. } => card.clone(),
            RulbusError::InvalidName(name) => name.clone(),
            RulbusError::Library { .. } | RulbusError::MissingSymbol { .. } => {
                "rulbus".to_string()
            }
        };
        PulserError::hardware(&card, err.to_string())
    }
}

type OpenFn = unsafe extern "C" fn(c_int) -> c_int;
type CloseFn = unsafe extern "C" fn();
type CardOpenFn = unsafe extern "C" fn(*const c_char) -> c_int;
type HandleFn = unsafe extern "C" fn(c_int) -> c_int;
type HandleIntFn = unsafe extern "C" fn(c_int, c_int) -> c_int;
type OutputPulseFn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
type RawDelayFn = unsafe extern "C" fn(c_int, c_ulong, c_int) -> c_int;
type IntrinsicDelayFn = unsafe extern "C" fn(c_int, *mut c_double) -> c_int;
type StrerrorFn = unsafe extern "C" fn() -> *const c_char;

/// Resolved entry points
#[derive(Clone, Copy)]
struct RulbusApi {
    open: OpenFn,
    close: CloseFn,
    card_open: CardOpenFn,
    card_close: HandleFn,
    strerror: StrerrorFn,
    delay_set_trigger: HandleIntFn,
    delay_set_output_pulse: OutputPulseFn,
    delay_set_raw_delay: RawDelayFn,
    delay_busy: HandleFn,
    delay_software_start: HandleFn,
    delay_get_intrinsic_delay: IntrinsicDelayFn,
    clock_set_frequency: HandleIntFn,
}

pub struct RulbusLib {
    handle: *mut c_void,
    api: RulbusApi,
}

fn dl_error() -> String {
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        "unknown error".to_string()
    } else {
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

/// Looks up `name` in an opened library.
///
/// # Safety
/// `T` must be the function pointer type matching the C declaration of `name`.
unsafe fn symbol<T: Copy>(handle: *mut c_void, name: &'static str) -> Result<T, RulbusError> {
    let cname = CString::new(name).map_err(|_| RulbusError::InvalidName(name.to_string()))?;
    let ptr = libc::dlsym(handle, cname.as_ptr());
    if ptr.is_null() {
        return Err(RulbusError::MissingSymbol {
            name,
            reason: dl_error(),
        });
    }
    Ok(std::mem::transmute_copy::<*mut c_void, T>(&ptr))
}

impl RulbusLib {
    /// Loads the library at `path` and resolves every entry point.
    pub fn load(path: &str) -> Result<Self, RulbusError> {
        let cpath = CString::new(path).map_err(|_| RulbusError::InvalidName(path.to_string()))?;
        let handle = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            return Err(RulbusError::Library {
                path: path.to_string(),
                reason: dl_error(),
            });
        }
        let api = unsafe { Self::resolve(handle) };
        match api {
            Ok(api) => {
                debug!(path, "Rulbus library loaded");
                Ok(Self { handle, api })
            }
            Err(err) => {
                unsafe { libc::dlclose(handle) };
                Err(err)
            }
        }
    }

    unsafe fn resolve(handle: *mut c_void) -> Result<RulbusApi, RulbusError> {
        Ok(RulbusApi {
            open: symbol(handle, "rulbus_open")?,
            close: symbol(handle, "rulbus_close")?,
            card_open: symbol(handle, "rulbus_card_open")?,
            card_close: symbol(handle, "rulbus_card_close")?,
            strerror: symbol(handle, "rulbus_strerror")?,
            delay_set_trigger: symbol(handle, "rulbus_rb8514_delay_set_trigger")?,
            delay_set_output_pulse: symbol(handle, "rulbus_rb8514_delay_set_output_pulse")?,
            delay_set_raw_delay: symbol(handle, "rulbus_rb8514_delay_set_raw_delay")?,
            delay_busy: symbol(handle, "rulbus_rb8514_delay_busy")?,
            delay_software_start: symbol(handle, "rulbus_rb8514_software_start")?,
            delay_get_intrinsic_delay: symbol(handle, "rulbus_rb8514_delay_get_intrinsic_delay")?,
            clock_set_frequency: symbol(handle, "rulbus_rb8515_clock_set_frequency")?,
        })
    }

    fn last_error(&self) -> String {
        let msg = unsafe { (self.api.strerror)() };
        if msg.is_null() {
            return "unknown Rulbus error".to_string();
        }
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }

    /// Runs a library call and checks its return code.
    pub fn call<F: FnOnce() -> c_int>(&self, card: &str, func: F) -> Result<c_int, RulbusError> {
        let code = func();
        if code < RULBUS_OK {
            let message = self.last_error();
            error!(card, code, %message, "Rulbus call failed");
            return Err(RulbusError::Call {
                card: card.to_string(),
                code,
                message,
            });
        }
        Ok(code)
    }

    pub fn open(&self) -> Result<(), RulbusError> {
        self.call("rulbus", || unsafe { (self.api.open)(0) }).map(|_| ())
    }

    pub fn close(&self) {
        unsafe { (self.api.close)() }
    }

    pub fn card_open(&self, name: &str) -> Result<c_int, RulbusError> {
        let cname = CString::new(name).map_err(|_| RulbusError::InvalidName(name.to_string()))?;
        self.call(name, || unsafe { (self.api.card_open)(cname.as_ptr()) })
    }

    pub fn card_close(&self, card: &str, handle: c_int) -> Result<(), RulbusError> {
        self.call(card, || unsafe { (self.api.card_close)(handle) }).map(|_| ())
    }

    pub fn delay_set_trigger(&self, card: &str, handle: c_int, edge: c_int) -> Result<(), RulbusError> {
        self.call(card, || unsafe { (self.api.delay_set_trigger)(handle, edge) })
            .map(|_| ())
    }

    pub fn delay_set_output_pulse(&self, card: &str, handle: c_int, pulse: c_int) -> Result<(), RulbusError> {
        self.call(card, || unsafe {
            (self.api.delay_set_output_pulse)(handle, RULBUS_RB8514_DELAY_OUTPUT_BOTH, pulse)
        })
        .map(|_| ())
    }

    pub fn delay_set_raw_delay(&self, card: &str, handle: c_int, ticks: c_ulong) -> Result<(), RulbusError> {
        self.call(card, || unsafe { (self.api.delay_set_raw_delay)(handle, ticks, 0) })
            .map(|_| ())
    }

    pub fn delay_busy(&self, card: &str, handle: c_int) -> Result<bool, RulbusError> {
        self.call(card, || unsafe { (self.api.delay_busy)(handle) })
            .map(|busy| busy != 0)
    }

    pub fn delay_software_start(&self, card: &str, handle: c_int) -> Result<(), RulbusError> {
        self.call(card, || unsafe { (self.api.delay_software_start)(handle) })
            .map(|_| ())
    }

    pub fn delay_intrinsic_delay(&self, card: &str, handle: c_int) -> Result<f64, RulbusError> {
        let mut delay: c_double = 0.0;
        self.call(card, || unsafe {
            (self.api.delay_get_intrinsic_delay)(handle, &mut delay)
        })?;
        Ok(delay)
    }

    pub fn clock_set_frequency(&self, card: &str, handle: c_int, freq: c_int) -> Result<(), RulbusError> {
        self.call(card, || unsafe { (self.api.clock_set_frequency)(handle, freq) })
            .map(|_| ())
    }
}

impl Drop for RulbusLib {
    fn drop(&mut self) {
        unsafe { libc::dlclose(self.handle) };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_library() {
        assert!(matches!(
            RulbusLib::load("/nonexistent/librulbus.so"),
            Err(RulbusError::Library { .. })
        ));
    }

    #[test]
    fn errors_become_hardware_failures() {
        let err: PulserError = RulbusError::Call {
            card: "MW_DELAY_0".to_string(),
            code: -3,
            message: "card busy".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            PulserError::HardwareCommFailure { ref card, .. } if card == "MW_DELAY_0"
        ));
    }
}
