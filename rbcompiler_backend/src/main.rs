use std::time::Duration;

use tracing_subscriber::EnvFilter;

use rbcompiler_backend::driver::RecordingDriver;
use rbcompiler_backend::error::Result;
use rbcompiler_backend::function::FunctionKind;
use rbcompiler_backend::pulser::Pulser;
use rbcompiler_backend::rf::NoSynthesizer;
use rbcompiler_backend::state::RunMode;
use rbcompiler_backend::PulserConfig;

// Two-pulse echo with a moving detection window, run against recorded hardware
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = PulserConfig::default();
    let driver = RecordingDriver::new(Duration::from_millis(config.busy_timeout_ms));
    let mut pulser = Pulser::new(config, Box::new(driver.clone()), &NoSynthesizer)?;

    pulser.set_timebase(1e-8)?;
    pulser.set_repetition_time(1e-4)?;
    for (id, kind, pos, len) in [
        (1, FunctionKind::Mw, 100e-9, 20e-9),
        (2, FunctionKind::Mw, 300e-9, 40e-9),
        (3, FunctionKind::Det, 500e-9, 100e-9),
    ] {
        pulser.new_pulse(id)?;
        pulser.set_function(id, kind)?;
        pulser.set_position(id, pos)?;
        pulser.set_length(id, len)?;
    }
    pulser.set_position_change(3, 20e-9)?;

    pulser.begin_run(RunMode::Experiment)?;
    println!("initial sequence: {} card commands", driver.write_count());
    for step in 0..5 {
        driver.clear();
        pulser.shift(None)?;
        pulser.update()?;
        println!("step {}: {:?}", step, driver.calls());
    }
    pulser.end_run()?;

    let (kinds, signal) = pulser.calc_signal(0.0, 1e-6, 11)?;
    println!("{:?}\n{:?}", kinds, signal);
    Ok(())
}
