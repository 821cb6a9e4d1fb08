//! Pulser configuration.
//!
//! Maps every logical card slot to the physical card name known to the Rulbus library,
//! and carries the few numbers the pulser cannot learn from the hardware.
//!
//! Configuration is assembled with the following priority (later sources override
//! earlier ones):
//!
//! 1. Built-in defaults
//! 2. A YAML file, see [`PulserConfig::load`]
//! 3. Environment variables (`RBPULSER_*`)

use std::collections::HashSet;
use std::env;
use std::path::Path;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PulserError, Result};
use crate::timebase::{ClockRate, Ticks};

/// Physical names of the cards in each logical slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardNames {
    /// Repetition-trigger delay card
    pub ert_delay: String,
    pub init_delay: String,
    /// 1, 3 or 5 cards, alternating length and delay
    #[serde(default)]
    pub mw_delays: Vec<String>,
    #[serde(default)]
    pub rf_delay: Option<String>,
    /// Either none or exactly two cards (delay, length)
    #[serde(default)]
    pub det_delays: Vec<String>,
    pub tb_clock: String,
    /// Separate clock for the repetition trigger; shares the timebase clock if absent
    #[serde(default)]
    pub ert_clock: Option<String>,
}

impl Default for CardNames {
    fn default() -> Self {
        Self {
            ert_delay: "ERT_DELAY".to_string(),
            init_delay: "INIT_DELAY".to_string(),
            mw_delays: (0..5).map(|i| format!("MW_DELAY_{}", i)).collect(),
            rf_delay: Some("RF_DELAY".to_string()),
            det_delays: vec!["DET_DELAY_0".to_string(), "DET_DELAY_1".to_string()],
            tb_clock: "TB_CLOCK".to_string(),
            ert_clock: Some("ERT_CLOCK".to_string()),
        }
    }
}

impl CardNames {
    /// Every configured card name, delay cards first
    pub fn all(&self) -> Vec<&str> {
        let mut names = vec![self.ert_delay.as_str(), self.init_delay.as_str()];
        names.extend(self.mw_delays.iter().map(String::as_str));
        names.extend(self.rf_delay.as_deref());
        names.extend(self.det_delays.iter().map(String::as_str));
        names.push(self.tb_clock.as_str());
        names.extend(self.ert_clock.as_deref());
        names
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulserConfig {
    pub cards: CardNames,
    /// Timebase used when the experiment never sets one [s]
    pub default_timebase: f64,
    /// Floor of the init card delay in ticks; detection triggers off its end edge
    pub init_delay_min_ticks: Ticks,
    /// Upper bound for waiting on a busy delay card
    pub busy_timeout_ms: u64,
    /// Intrinsic delays [s] by card name, used whenever the hardware is not opened
    pub intrinsic_delays: IndexMap<String, f64>,
    pub default_intrinsic_delay: f64,
    /// Name under which the RF synthesizer module is looked up
    pub synthesizer_module: String,
    /// Shared library implementing the Rulbus card API
    pub library_path: String,
}

impl Default for PulserConfig {
    fn default() -> Self {
        Self {
            cards: CardNames::default(),
            default_timebase: 1e-8,
            init_delay_min_ticks: 1,
            busy_timeout_ms: 1000,
            intrinsic_delays: IndexMap::new(),
            default_intrinsic_delay: 0.0,
            synthesizer_module: "synthesizer".to_string(),
            library_path: "librulbus.so".to_string(),
        }
    }
}

impl PulserConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RBPULSER_BUSY_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                debug!(busy_timeout_ms = ms, "Busy timeout overridden from environment");
                self.busy_timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var("RBPULSER_LIBRARY") {
            debug!(library = %val, "Rulbus library overridden from environment");
            self.library_path = val;
        }
    }

    /// Intrinsic delay to assume for `card` without hardware access
    pub fn intrinsic_delay(&self, card: &str) -> f64 {
        self.intrinsic_delays
            .get(card)
            .copied()
            .unwrap_or(self.default_intrinsic_delay)
    }

    /// Checks card names and numeric settings.
    ///
    /// Card names have to follow the Rulbus convention `letter (letter|digit|_|-)*`
    /// and be unique. The number of MW cards must be 0, 1, 3 or 5 and the number of DET
    /// cards 0 or 2, since chains alternate length and delay cards.
    pub fn validate(&self) -> Result<()> {
        let re = Regex::new(r"^[A-Za-z][A-Za-z0-9_\-]*$")
            .map_err(|e| PulserError::InvalidConfig(e.to_string()))?;
        let mut seen = HashSet::new();
        for name in self.cards.all() {
            if !re.is_match(name) {
                return Err(PulserError::InvalidConfig(format!(
                    "card name '{}' is not a valid Rulbus card name",
                    name
                )));
            }
            if !seen.insert(name) {
                return Err(PulserError::InvalidConfig(format!(
                    "card name '{}' is used for more than one slot",
                    name
                )));
            }
        }
        if ![0, 1, 3, 5].contains(&self.cards.mw_delays.len()) {
            return Err(PulserError::TopologyMismatch(format!(
                "MW chain needs 0, 1, 3 or 5 cards, got {}",
                self.cards.mw_delays.len()
            )));
        }
        if ![0, 2].contains(&self.cards.det_delays.len()) {
            return Err(PulserError::TopologyMismatch(format!(
                "DET chain needs 0 or 2 cards, got {}",
                self.cards.det_delays.len()
            )));
        }
        if ClockRate::from_period(self.default_timebase).is_none() {
            return Err(PulserError::UnsupportedTimebase(self.default_timebase));
        }
        if self.init_delay_min_ticks < 1 {
            return Err(PulserError::InvalidConfig(
                "init delay floor must be at least one tick".to_string(),
            ));
        }
        if self.busy_timeout_ms == 0 {
            return Err(PulserError::InvalidConfig(
                "busy timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = PulserConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cards.all().len(), 12);
    }

    #[test]
    fn yaml_partial_override() {
        let config = PulserConfig::from_yaml_str(
            r#"
cards:
  ert_delay: ERT
  init_delay: INIT
  mw_delays: [MW0, MW1, MW2]
  tb_clock: CLK
init_delay_min_ticks: 2
intrinsic_delays:
  INIT: 2.0e-8
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.cards.mw_delays.len(), 3);
        assert!(config.cards.rf_delay.is_none());
        assert!(config.cards.det_delays.is_empty());
        assert_eq!(config.init_delay_min_ticks, 2);
        assert_eq!(config.intrinsic_delay("INIT"), 2.0e-8);
        assert_eq!(config.intrinsic_delay("MW0"), 0.0);
        assert_eq!(config.busy_timeout_ms, 1000);
    }

    #[test]
    fn rejects_bad_topology() {
        let mut config = PulserConfig::default();
        config.cards.mw_delays.pop();
        assert!(matches!(
            config.validate(),
            Err(PulserError::TopologyMismatch(_))
        ));
        let mut config = PulserConfig::default();
        config.cards.det_delays.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_names() {
        let mut config = PulserConfig::default();
        config.cards.init_delay = "0init".to_string();
        assert!(matches!(config.validate(), Err(PulserError::InvalidConfig(_))));
        let mut config = PulserConfig::default();
        config.cards.init_delay = config.cards.ert_delay.clone();
        assert!(matches!(config.validate(), Err(PulserError::InvalidConfig(_))));
    }

    #[test]
    fn load_from_file() {
        let path = env::temp_dir().join(format!("rbpulser_config_{}.yaml", std::process::id()));
        std::fs::write(&path, "default_timebase: 1.0e-7\nbusy_timeout_ms: 250\n").unwrap();
        let config = PulserConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.default_timebase, 1e-7);
        assert!(config.busy_timeout_ms == 250 || env::var("RBPULSER_BUSY_TIMEOUT_MS").is_ok());

        assert!(matches!(
            PulserConfig::load(Path::new("/nonexistent/rbpulser.yaml")),
            Err(PulserError::Io(_))
        ));
    }

    #[test]
    fn library_path_from_environment() {
        env::set_var("RBPULSER_LIBRARY", "/opt/rulbus/lib/librulbus.so");
        let mut config = PulserConfig::default();
        config.apply_env_overrides();
        env::remove_var("RBPULSER_LIBRARY");
        assert_eq!(config.library_path, "/opt/rulbus/lib/librulbus.so");
    }

    #[test]
    fn malformed_yaml() {
        assert!(matches!(
            PulserConfig::from_yaml_str("cards: [1, 2"),
            Err(PulserError::Config(_))
        ));
    }
}
