//! Sampling of the abstract pulse pattern, for viewers.

use ndarray::{s, Array1, Array2};

use crate::error::{PulserError, Result};
use crate::function::{FunctionKind, FunctionTable};
use crate::pulse::PulseRegistry;
use crate::timebase::Timebase;

/// Samples the active pulses of every used function.
///
/// # Arguments
/// - `t_start`, `t_end`: sampled interval [s], relative to the trigger of the init card.
/// - `nsamps`: number of samples, spread evenly including both interval ends.
///
/// # Returns
/// The used functions and a buffer of shape `[functions][nsamps]` holding `1.0`
/// where a pulse of the function is high and `0.0` elsewhere. Pulse positions include
/// the static function delays.
pub fn calc_signal(
    registry: &PulseRegistry,
    functions: &FunctionTable,
    timebase: &Timebase,
    t_start: f64,
    t_end: f64,
    nsamps: usize,
) -> Result<(Vec<FunctionKind>, Array2<f64>)> {
    if nsamps == 0 || !(t_end > t_start) {
        return Err(PulserError::InvalidValue(format!(
            "cannot sample {} points between {} s and {} s",
            nsamps, t_start, t_end
        )));
    }
    let used: Vec<FunctionKind> = functions.used().map(|f| f.kind).collect();
    let mut buffer = Array2::from_elem((used.len(), nsamps), 0.);
    let t_values = Array1::linspace(t_start, t_end, nsamps);

    for (i, &kind) in used.iter().enumerate() {
        let function = functions.get(kind);
        let mut row = buffer.slice_mut(s![i, ..]);
        for &idx in function.pulses.iter() {
            let pulse = registry.get(idx);
            if !pulse.is_active() {
                continue;
            }
            let start = timebase.to_time(pulse.pos()? + function.delay);
            let end = start + timebase.to_time(pulse.len()?);
            row.iter_mut()
                .zip(t_values.iter())
                .filter(|(_, &t)| t >= start && t < end)
                .for_each(|(v, _)| *v = 1.0);
        }
    }
    Ok((used, buffer))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::card::CardTable;
    use crate::config::PulserConfig;

    #[test]
    fn samples_per_function() {
        let mut registry = PulseRegistry::new();
        for (id, kind, pos, len) in [
            (1, FunctionKind::Mw, 2, 2),
            (2, FunctionKind::Det, 6, 1),
        ] {
            let idx = registry.new_pulse(id).unwrap();
            let p = registry.get_mut(idx);
            p.set_function(kind).unwrap();
            p.set_position(pos).unwrap();
            p.set_length(len).unwrap();
        }
        let mut functions = FunctionTable::new();
        functions
            .init(&registry, &CardTable::new(&PulserConfig::default()).unwrap())
            .unwrap();
        let tb = Timebase::new(1e-8);

        // One sample every 5 ns, offset by half a sample to stay off the edges
        let (kinds, arr) = calc_signal(&registry, &functions, &tb, 2.5e-9, 77.5e-9, 16).unwrap();
        assert_eq!(kinds, vec![FunctionKind::Mw, FunctionKind::Det]);
        assert_eq!(arr.dim(), (2, 16));
        let high: Vec<usize> = (0..16).filter(|&j| arr[[0, j]] == 1.0).collect();
        assert_eq!(high, vec![4, 5, 6, 7]);
        let high: Vec<usize> = (0..16).filter(|&j| arr[[1, j]] == 1.0).collect();
        assert_eq!(high, vec![12, 13]);
    }

    #[test]
    fn rejects_empty_interval() {
        let registry = PulseRegistry::new();
        let functions = FunctionTable::new();
        let tb = Timebase::new(1e-8);
        assert!(matches!(
            calc_signal(&registry, &functions, &tb, 1e-6, 1e-6, 10),
            Err(PulserError::InvalidValue(_))
        ));
    }
}
