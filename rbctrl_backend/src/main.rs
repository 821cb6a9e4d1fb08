use std::env;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use rbcompiler_backend::error::Result;
use rbcompiler_backend::function::FunctionKind;
use rbcompiler_backend::rf::NoSynthesizer;
use rbcompiler_backend::state::RunMode;
use rbcompiler_backend::PulserConfig;
use rbctrl_backend::RulbusPulser;

// Runs a single microwave pulse with a growing length on the configured rack
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match env::args().nth(1) {
        Some(path) => PulserConfig::load(Path::new(&path))?,
        None => {
            let mut config = PulserConfig::default();
            config.apply_env_overrides();
            config
        }
    };
    let mut pulser = RulbusPulser::new(config, &NoSynthesizer)?;

    pulser.set_timebase(1e-8)?;
    pulser.set_repetition_frequency(1e3)?;
    pulser.new_pulse(1)?;
    pulser.set_function(1, FunctionKind::Mw)?;
    pulser.set_position(1, 200e-9)?;
    pulser.set_length(1, 20e-9)?;
    pulser.set_length_change(1, 10e-9)?;

    pulser.begin_run(RunMode::Experiment)?;
    for step in 0..10 {
        thread::sleep(Duration::from_millis(500));
        pulser.increment(None)?;
        pulser.update()?;
        info!(step, length = pulser.get_length(1)?, "Pulse length");
    }
    pulser.end_run()?;
    pulser.shutdown()
}
