/// Z-score outlier rejection of repetitions

use crate::data::spectrum::Spectrum;
use crate::data::transients::Transients;
use crate::dsp;

use super::parameter::ParameterSet;
use super::{svs_or_pass_through, DataBag, Diagnostics, Step, StepError, StepKind, StepOutcome};

/// Scores within this distance of the threshold count as reaching it
pub const Z_SCORE_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricDomain {
    /// Squared deviation of the FID before a cutoff time
    Time,
    /// Squared deviation of the spectrum magnitude
    Frequency,
}

/// Per-repetition squared deviation from the ensemble mean
pub fn deviation_metric(
    spectra: &[Spectrum],
    domain: MetricDomain,
    cutoff_s: f64,
) -> Result<Vec<f64>, StepError> {
    let mean = Spectrum::mean(spectra)?;
    let metric = match domain {
        MetricDomain::Time => {
            let np = mean.np();
            let n = mean.time_axis().iter().take_while(|t| **t < cutoff_s).count();
            // a zero cutoff means "whole FID"
            let n = if n == 0 { np } else { n };
            spectra
                .iter()
                .map(|s| {
                    s.samples()[..n]
                        .iter()
                        .zip(&mean.samples()[..n])
                        .map(|(a, b)| (a - b).norm_sqr())
                        .sum()
                })
                .collect()
        }
        MetricDomain::Frequency => {
            let reference: Vec<f64> = mean.spectrum().iter().map(|v| v.norm()).collect();
            spectra
                .iter()
                .map(|s| {
                    s.spectrum()
                        .iter()
                        .zip(&reference)
                        .map(|(a, b)| (a.norm() - b).powi(2))
                        .sum()
                })
                .collect()
        }
    };
    Ok(metric)
}

pub struct RemoveBadAverages {
    params: ParameterSet,
    diagnostics: Option<Diagnostics>,
}

impl Default for RemoveBadAverages {
    fn default() -> Self {
        Self {
            params: ParameterSet::new()
                .choice("domain", "Metric domain", "time", &["time", "frequency"])
                .float("cutoff_ms", "Time-domain cutoff (ms)", 400.0, 0.0, 100_000.0)
                .float("threshold", "Z-score threshold", 3.0, 0.0, 100.0),
            diagnostics: None,
        }
    }
}

impl Step for RemoveBadAverages {
    fn kind(&self) -> StepKind {
        StepKind::RemoveBadAverages
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
        let Some(reps) = svs_or_pass_through(&self.kind(), data, &mut outcome) else {
            return Ok(outcome);
        };
        if reps.len() <= 2 {
            log::info!("{} repetition(s), outlier rejection skipped", reps.len());
            data.pass_through();
            return Ok(outcome);
        }

        let domain = match self.params.get_text("domain")? {
            "frequency" => MetricDomain::Frequency,
            _ => MetricDomain::Time,
        };
        let cutoff_s = self.params.get_float("cutoff_ms")? / 1000.0;
        let threshold = self.params.get_float("threshold")?;

        let metric = deviation_metric(&reps, domain, cutoff_s)?;
        let z_scores = dsp::z_scores(&metric);
        let removed: Vec<usize> = z_scores
            .iter()
            .enumerate()
            .filter(|(_, z)| z.abs() >= threshold - Z_SCORE_TOLERANCE)
            .map(|(i, _)| i)
            .collect();

        let kept: Vec<Spectrum> = reps
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !removed.contains(i))
            .map(|(_, s)| s)
            .collect();
        if kept.is_empty() {
            outcome.warn("Every repetition was flagged; keeping all");
            data.pass_through();
        } else {
            log::info!("Removed {} of {} repetitions: {:?}", removed.len(), metric.len(), removed);
            data.output = Some(Transients::Svs(kept));
        }

        self.diagnostics = Some(Diagnostics::BadAverages {
            metric,
            z_scores,
            removed,
        });
        Ok(outcome)
    }

    fn diagnostics(&self) -> Option<&Diagnostics> {
        self.diagnostics.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::import::Header;
    use crate::data::spectrum::tests::synthetic_fid;
    use crate::steps::parameter::ParameterValue;

    #[test]
    fn test_two_repetitions_untouched() {
        let a = synthetic_fid(32, 0.001, 0.0, 0.1);
        let b = a.inherit(a.samples().iter().map(|v| v * 10.0).collect()).unwrap();
        let input = Transients::Svs(vec![a, b]);
        let mut bag = DataBag::new(input.clone(), None, Header::default());
        let mut step = RemoveBadAverages::default();
        step.set_parameter("threshold", ParameterValue::Float(0.0)).unwrap();
        step.process(&mut bag).unwrap();
        assert_eq!(bag.output.unwrap(), input);
    }

    #[test]
    fn test_identical_repetitions_all_pass() {
        let input = Transients::Svs(vec![synthetic_fid(32, 0.001, 0.0, 0.1); 6]);
        let mut bag = DataBag::new(input.clone(), None, Header::default());
        let mut step = RemoveBadAverages::default();
        step.process(&mut bag).unwrap();
        assert_eq!(bag.output.unwrap(), input);
        let Some(Diagnostics::BadAverages { removed, .. }) = step.diagnostics() else {
            panic!("missing diagnostics");
        };
        assert!(removed.is_empty());
    }

    #[test]
    fn test_frequency_domain_flags_outlier() {
        let good = synthetic_fid(64, 0.001, 0.0, 0.1);
        let mut reps = vec![good.clone(); 11];
        reps[4] = good.adjust_frequency(40.0);
        let mut bag = DataBag::new(Transients::Svs(reps), None, Header::default());
        let mut step = RemoveBadAverages::default();
        step.set_parameter("domain", ParameterValue::Text("frequency".into())).unwrap();
        step.process(&mut bag).unwrap();
        assert_eq!(bag.output.unwrap().len(), 10);
        let Some(Diagnostics::BadAverages { removed, .. }) = step.diagnostics() else {
            panic!("missing diagnostics");
        };
        assert_eq!(removed, &vec![4]);
    }
}
