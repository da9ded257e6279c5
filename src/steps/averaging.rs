/// Averaging family: simple, block, S/N²-weighted and moving-window
///
/// All of them pass a single repetition through untouched and leave CSI
/// grids alone.

use crate::data::spectrum::Spectrum;
use crate::data::transients::Transients;
use crate::dsp;

use super::parameter::ParameterSet;
use super::{svs_or_pass_through, DataBag, Diagnostics, Step, StepError, StepKind, StepOutcome};

/// Shared preamble: repetitions to average, or `None` when the step has
/// already written a pass-through output.
fn repetitions(kind: StepKind, data: &mut DataBag, outcome: &mut StepOutcome) -> Option<Vec<Spectrum>> {
    let reps = svs_or_pass_through(&kind, data, outcome)?;
    if reps.len() <= 1 {
        data.pass_through();
        return None;
    }
    Some(reps)
}

fn contiguous_groups(len: usize, size: usize) -> Vec<Vec<usize>> {
    (0..len)
        .collect::<Vec<_>>()
        .chunks(size.max(1))
        .map(|c| c.to_vec())
        .collect()
}

// ============================================================================
//  Simple average
// ============================================================================

pub struct Average {
    params: ParameterSet,
}

impl Default for Average {
    fn default() -> Self {
        Self {
            params: ParameterSet::new(),
        }
    }
}

impl Step for Average {
    fn kind(&self) -> StepKind {
        StepKind::Average
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn process(&mut self, data: &mut DataBag) -> Result<StepOutcome, StepError> {
        let mut outcome = StepOutcome::ok();
        let Some(reps) = repetitions(self.kind(), data, &mut outcome) else {
            return Ok(outcome);
        };
        log::info!("Averaging {} repetitions", reps.len());
        data.output = Some(Transients::Svs(vec![Spectrum::mean(&reps)?]));
        Ok(outcome)
    }
}

// ============================================================================
//  Block average
// ============================================================================

pub struct BlockAverage {
    params: ParameterSet,
    diagnostics: Option<Diagnostics>,
}

impl Default for BlockAverage {
    fn default() -> Self {
        Self {
            params: ParameterSet::new()
                .integer("block_length", "Repetitions per block", 2, 1, 1_000_000)
                .integer("block_averages", "Sub-averages per block", 1, 1, 1_000_000),
            diagnostics: None,
        }
    }
}

impl Step for BlockAverage {
    fn kind(&self) -> StepKind {
        StepKind::BlockAverage
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn process(&mut self, data: &mut DataBag) -> Result<StepOutcome, StepError> {
        self.diagnostics = None;
        let mut outcome = StepOutcome::ok();
        let Some(reps) = repetitions(self.kind(), data, &mut outcome) else {
            return Ok(outcome);
        };
        let block_length = self.params.get_usize("block_length")?;
        let block_averages = self.params.get_usize("block_averages")?;

        if reps.len() % block_length != 0 || block_length % block_averages != 0 {
            data.pass_through();
            outcome.warn(format!(
                "{} repetitions cannot be split into blocks of {} with {} sub-averages; passing through",
                reps.len(),
                block_length,
                block_averages
            ));
            return Ok(outcome);
        }

        let sub_length = block_length / block_averages;
        let mut groups = Vec::new();
        let mut output = Vec::new();
        let mut labels = Vec::new();
        for (block, block_start) in (0..reps.len()).step_by(block_length).enumerate() {
            for sub in 0..block_averages {
                let start = block_start + sub * sub_length;
                let members: Vec<usize> = (start..start + sub_length).collect();
                output.push(Spectrum::mean(&reps[start..start + sub_length])?);
                labels.push(format!("block {} / sub {}", block, sub));
                groups.push(members);
            }
        }

        log::info!("Block average: {} → {} spectra", reps.len(), output.len());
        data.labels = labels;
        data.output = Some(Transients::Svs(output));
        self.diagnostics = Some(Diagnostics::Averaging {
            groups,
            weights: Vec::new(),
        });
        Ok(outcome)
    }

    fn diagnostics(&self) -> Option<&Diagnostics> {
        self.diagnostics.as_ref()
    }
}

// ============================================================================
//  S/N²-weighted average
// ============================================================================

/// `max|spectrum| / σ²` with σ the std of the last `noise_proportion` of the FID
pub fn snr_weight(spectrum: &Spectrum, noise_proportion: f64) -> f64 {
    let np = spectrum.np();
    let tail = ((np as f64 * noise_proportion).round() as usize).clamp(1, np);
    let noise = dsp::complex_std(&spectrum.samples()[np - tail..np]);
    let peak = spectrum.spectrum()[..np]
        .iter()
        .map(|v| v.norm())
        .fold(0.0, f64::max);
    peak / (noise * noise)
}

pub struct SnrWeightedAverage {
    params: ParameterSet,
    diagnostics: Option<Diagnostics>,
}

impl Default for SnrWeightedAverage {
    fn default() -> Self {
        Self {
            params: ParameterSet::new()
                .integer("group_length", "Repetitions per group (0 = all)", 0, 0, 1_000_000)
                .float("noise_proportion", "Noise tail fraction", 0.1, 0.001, 1.0),
            diagnostics: None,
        }
    }
}

impl Step for SnrWeightedAverage {
    fn kind(&self) -> StepKind {
        StepKind::SnrWeightedAverage
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn process(&mut self, data: &mut DataBag) -> Result<StepOutcome, StepError> {
        self.diagnostics = None;
        let mut outcome = StepOutcome::ok();
        let Some(reps) = repetitions(self.kind(), data, &mut outcome) else {
            return Ok(outcome);
        };
        let group_length = match self.params.get_usize("group_length")? {
            0 => reps.len(),
            n => n,
        };
        let noise_proportion = self.params.get_float("noise_proportion")?;

        let mut weights: Vec<f64> = reps.iter().map(|s| snr_weight(s, noise_proportion)).collect();
        let groups = contiguous_groups(reps.len(), group_length);
        let mut output = Vec::with_capacity(groups.len());
        for (g, members) in groups.iter().enumerate() {
            let group: Vec<Spectrum> = members.iter().map(|&i| reps[i].clone()).collect();
            let w: Vec<f64> = members.iter().map(|&i| weights[i]).collect();
            if w.iter().all(|v| v.is_finite() && *v > 0.0) {
                output.push(Spectrum::weighted_mean(&group, &w)?);
            } else {
                outcome.warn(format!("Group {} has a zero-noise or empty repetition, using equal weights", g));
                for &i in members {
                    weights[i] = 1.0;
                }
                output.push(Spectrum::mean(&group)?);
            }
        }

        log::info!("S/N²-weighted average: {} → {} spectra", reps.len(), output.len());
        data.output = Some(Transients::Svs(output));
        self.diagnostics = Some(Diagnostics::Averaging { groups, weights });
        Ok(outcome)
    }

    fn diagnostics(&self) -> Option<&Diagnostics> {
        self.diagnostics.as_ref()
    }
}

// ============================================================================
//  Moving average
// ============================================================================

pub struct MovingAverage {
    params: ParameterSet,
}

impl Default for MovingAverage {
    fn default() -> Self {
        Self {
            params: ParameterSet::new().integer("window", "Window length", 4, 1, 1_000_000),
        }
    }
}

impl Step for MovingAverage {
    fn kind(&self) -> StepKind {
        StepKind::MovingAverage
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn process(&mut self, data: &mut DataBag) -> Result<StepOutcome, StepError> {
        let mut outcome = StepOutcome::ok();
        let Some(reps) = repetitions(self.kind(), data, &mut outcome) else {
            return Ok(outcome);
        };
        let window = self.params.get_usize("window")?.min(reps.len());
        let output = reps
            .windows(window)
            .map(Spectrum::mean)
            .collect::<Result<Vec<_>, _>>()?;
        log::info!("Moving average (window {}): {} → {} spectra", window, reps.len(), output.len());
        data.output = Some(Transients::Svs(output));
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::import::Header;
    use crate::data::spectrum::tests::synthetic_fid;
    use crate::steps::parameter::ParameterValue;
    use approx::assert_abs_diff_eq;

    fn scaled(k: f64) -> Spectrum {
        let s = synthetic_fid(32, 0.001, 0.0, 0.1);
        s.inherit(s.samples().iter().map(|v| v * k).collect()).unwrap()
    }

    fn bag(reps: Vec<Spectrum>) -> DataBag {
        DataBag::new(Transients::Svs(reps), None, Header::default())
    }

    #[test]
    fn test_single_input_is_unchanged() {
        let steps: Vec<Box<dyn Step>> = vec![
            Box::new(Average::default()),
            Box::new(BlockAverage::default()),
            Box::new(SnrWeightedAverage::default()),
            Box::new(MovingAverage::default()),
        ];
        for mut step in steps {
            let input = Transients::Svs(vec![scaled(1.0)]);
            let mut data = DataBag::new(input.clone(), None, Header::default());
            step.process(&mut data).unwrap();
            assert_eq!(data.output.unwrap(), input);
        }
    }

    #[test]
    fn test_average_preserves_metadata() {
        let mut data = bag(vec![scaled(1.0), scaled(3.0)]);
        Average::default().process(&mut data).unwrap();
        let out = data.output.unwrap();
        let s = out.first().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(s.te(), 30.0);
        assert_abs_diff_eq!(s.samples()[0].re, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_block_average_labels() {
        let reps = (0..8).map(|k| scaled(k as f64)).collect();
        let mut data = bag(reps);
        let mut step = BlockAverage::default();
        step.set_parameter("block_length", ParameterValue::Integer(4)).unwrap();
        step.set_parameter("block_averages", ParameterValue::Integer(2)).unwrap();
        step.process(&mut data).unwrap();

        let out = data.output.unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(data.labels[3], "block 1 / sub 1");
        // sub-group (6, 7)
        assert_abs_diff_eq!(out.spectra()[3].samples()[0].re, 6.5, epsilon = 1e-12);
    }

    #[test]
    fn test_block_average_remainder_degrades() {
        let mut data = bag((0..5).map(|k| scaled(k as f64)).collect());
        let mut step = BlockAverage::default();
        assert!(step.process(&mut data).unwrap().is_degraded());
        assert_eq!(data.output.unwrap().len(), 5);
    }

    #[test]
    fn test_snr_weighted_prefers_clean_repetition() {
        let clean = synthetic_fid(256, 0.001, 0.0, 0.05);
        // same peak, noisier tail
        let noisy = clean.inherit(
            clean
                .samples()
                .iter()
                .enumerate()
                .map(|(i, v)| if i % 2 == 0 { v + 0.05 } else { v - 0.05 })
                .collect(),
        )
        .unwrap();
        let mut data = bag(vec![clean.clone(), noisy]);
        let mut step = SnrWeightedAverage::default();
        step.process(&mut data).unwrap();
        let Some(Diagnostics::Averaging { weights, .. }) = step.diagnostics() else {
            panic!("missing diagnostics");
        };
        assert!(weights[0] > weights[1]);
        assert_eq!(data.output.unwrap().len(), 1);
    }

    #[test]
    fn test_moving_average_window_count() {
        let mut data = bag((0..6).map(|k| scaled(k as f64)).collect());
        let mut step = MovingAverage::default();
        step.set_parameter("window", ParameterValue::Integer(3)).unwrap();
        step.process(&mut data).unwrap();
        let out = data.output.unwrap();
        assert_eq!(out.len(), 4);
        assert_abs_diff_eq!(out.spectra()[0].samples()[0].re, 1.0, epsilon = 1e-12);
    }
}
