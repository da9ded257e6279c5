/// Ordered processing pipeline
///
/// A pipeline is a plain sequence of steps; graph flattening happens once in
/// [`graph::build_pipeline`] and execution is driven by
/// [`controller::ExecutionController`].

pub mod command;
pub mod controller;
pub mod graph;
pub mod worker;

use crate::steps::{Step, StepKind};

#[derive(Debug, Default)]
pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: Box<dyn Step>) {
        self.steps.push(step);
    }

    pub fn with_step(mut self, step: Box<dyn Step>) -> Self {
        self.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&dyn Step> {
        self.steps.get(index).map(|s| s.as_ref())
    }

    pub fn step_mut(&mut self, index: usize) -> Option<&mut Box<dyn Step>> {
        self.steps.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Step> {
        self.steps.iter().map(|s| s.as_ref())
    }

    pub fn kinds(&self) -> Vec<StepKind> {
        self.steps.iter().map(|s| s.kind()).collect()
    }

    pub fn describe(&self) -> String {
        if self.steps.is_empty() {
            return "(empty)".to_string();
        }
        self.steps
            .iter()
            .map(|s| s.kind().to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

#[cfg(test)]
mod tests {
    use super::controller::{ControllerState, ExecutionController};
    use super::*;
    use crate::data::import::{Header, InputSet};
    use crate::data::spectrum::tests::synthetic_fid;
    use crate::data::spectrum::Spectrum;
    use crate::data::transients::{CsiGrid, Transients};
    use crate::dsp::{self, least_squares};
    use crate::steps::alignment::te_first_order;
    use crate::steps::parameter::ParameterValue;
    use crate::steps::{Diagnostics, StepRegistry};
    use approx::assert_abs_diff_eq;
    use num_complex::Complex64;
    use std::f64::consts::PI;

    fn step(kind: &str, params: &[(&str, ParameterValue)]) -> Box<dyn Step> {
        let mut step = StepRegistry::with_builtin().create(kind).unwrap();
        for (name, value) in params {
            step.set_parameter(name, value.clone()).unwrap();
        }
        step
    }

    fn run(pipeline: Pipeline, data: Transients, wref: Option<Transients>) -> ExecutionController {
        let mut controller = ExecutionController::new(pipeline);
        controller
            .start_with(InputSet {
                data,
                wref,
                header: Header::default(),
                vendor: "synthetic".to_string(),
                sources: Vec::new(),
            })
            .unwrap();
        controller.run_to_end().unwrap();
        assert_eq!(controller.state(), ControllerState::Done);
        controller
    }

    /// Peak frequency (Hz) and height, refined by a parabola through the
    /// largest magnitude and its neighbours
    fn interpolated_peak(s: &Spectrum) -> (f64, f64) {
        let magnitudes: Vec<f64> = s.spectrum().iter().map(|v| v.norm()).collect();
        let i = dsp::argmax(&magnitudes).unwrap();
        assert!(i > 0 && i + 1 < magnitudes.len());
        let (a, b, c) = (magnitudes[i - 1], magnitudes[i], magnitudes[i + 1]);
        let curvature = a - 2.0 * b + c;
        let offset = 0.5 * (a - c) / curvature;
        let bin = 1.0 / (s.np() as f64 * s.dt());
        (s.frequency_axis()[i] + offset * bin, b - 0.25 * (a - c) * offset)
    }

    #[test]
    fn test_pipeline_describe() {
        let p = Pipeline::new()
            .with_step(step("ZeroPadding", &[]))
            .with_step(step("Average", &[]));
        assert_eq!(p.describe(), "ZeroPadding -> Average");
        assert_eq!(p.len(), 2);
        assert!(Pipeline::new().is_empty());
    }

    #[test]
    fn test_scan_metadata_survives_every_step() {
        let base = synthetic_fid(256, 0.0005, 0.0, 0.05);
        let reps: Vec<Spectrum> = (0..4).map(|i| base.adjust_frequency(i as f64 * 0.5)).collect();
        let wref = Transients::Svs(vec![synthetic_fid(256, 0.0005, 0.0, 0.2)]);
        let registry = StepRegistry::with_builtin();
        for kind in StepKind::BUILTIN.iter() {
            let mut p = Pipeline::new();
            p.push(registry.create(kind.as_str()).unwrap());
            let controller = run(p, Transients::Svs(reps.clone()), Some(wref.clone()));
            for s in controller.final_output().unwrap().spectra() {
                assert_eq!(s.f0(), base.f0(), "{}", kind);
                assert_eq!(s.dt(), base.dt(), "{}", kind);
                assert_eq!(s.te(), base.te(), "{}", kind);
                assert_eq!(s.tr(), base.tr(), "{}", kind);
            }
        }
    }

    #[test]
    fn test_scenario_alignment_then_average() {
        let base = synthetic_fid(1024, 0.0005, 0.0, 0.05);
        let shifts = [0.0, 5.0, -5.0, 2.5, -2.5, 4.0, -4.0, 1.0];
        let phases_deg: [f64; 8] = [0.0, 10.0, -10.0, -5.0, 5.0, 7.5, -7.5, 2.5];
        let reps: Vec<Spectrum> = shifts
            .iter()
            .zip(&phases_deg)
            .map(|(f, p)| base.adjust_frequency(*f).adjust_phase(p.to_radians(), 0.0))
            .collect();

        let pipeline = Pipeline::new()
            .with_step(step("ZeroPadding", &[("factor", ParameterValue::Integer(2))]))
            .with_step(step(
                "FreqPhaseAlignment",
                &[("ppm_range", ParameterValue::Vector(vec![3.7, 5.7]))],
            ))
            .with_step(step("Average", &[]));
        let mut controller = run(pipeline, Transients::Svs(reps), None);

        let output = controller.final_output().unwrap();
        assert_eq!(output.len(), 1);
        let averaged = output.first().unwrap();
        assert_eq!(averaged.np(), 3072);

        let aligned: Vec<(f64, f64)> = controller
            .history()
            .data(2)
            .unwrap()
            .spectra()
            .iter()
            .map(interpolated_peak)
            .collect();
        let (f_avg, height_avg) = interpolated_peak(averaged);
        for (f, _) in &aligned {
            assert_abs_diff_eq!(*f, f_avg, epsilon = 0.02);
        }
        let mean_height = aligned.iter().map(|(_, h)| h).sum::<f64>() / aligned.len() as f64;
        assert!(height_avg > 0.995 * mean_height, "{} vs {}", height_avg, mean_height);

        let alignment = controller.history().data(2).unwrap();
        assert_eq!(alignment.len(), 8);
        controller.terminate();
        assert!(controller.history().is_empty());
    }

    #[test]
    fn test_scenario_alignment_diagnostics() {
        let base = synthetic_fid(1024, 0.0005, 0.0, 0.05);
        let shifts = [0.0, 5.0, -5.0, 2.5];
        let reps: Vec<Spectrum> = shifts
            .iter()
            .map(|f| base.adjust_frequency(*f).adjust_phase(0.1, 0.0))
            .collect();
        let mut alignment = step(
            "FreqPhaseAlignment",
            &[("ppm_range", ParameterValue::Vector(vec![3.7, 5.7]))],
        );
        let mut bag = crate::steps::DataBag::new(Transients::Svs(reps), None, Header::default());
        alignment.process(&mut bag).unwrap();
        let Some(Diagnostics::Alignment { shifts_hz, phases_rad, .. }) = alignment.diagnostics() else {
            panic!("missing diagnostics");
        };
        for (fit, truth) in shifts_hz.iter().zip(&shifts) {
            assert_abs_diff_eq!(fit - shifts_hz[0], *truth, epsilon = 0.01);
        }
        for p in phases_rad {
            assert_abs_diff_eq!(*p, phases_rad[0], epsilon = 1e-3);
        }
    }

    /// Std of the unwrapped phase after removing its best-fit line
    fn phase_roughness(s: &Spectrum) -> f64 {
        let phase = dsp::unwrap_phase(&s.samples().iter().map(|v| v.arg()).collect::<Vec<_>>());
        let t = s.time_axis();
        let (slope, intercept) = least_squares::line_fit(&t, &phase);
        let residual: Vec<f64> = t
            .iter()
            .zip(&phase)
            .map(|(t, p)| p - (slope * t + intercept))
            .collect();
        dsp::std_dev(&residual)
    }

    #[test]
    fn test_scenario_eddy_current_correction() {
        let np = 2048;
        let dt = 0.0005;
        let samples: Vec<Complex64> = (0..np)
            .map(|i| {
                let t = i as f64 * dt;
                let drift = 2.0 * PI * 0.2 * t + 3.0 * (1.0 - (-t / 0.15).exp());
                Complex64::from_polar((-t / 0.2).exp(), drift)
            })
            .collect();
        let wref = Spectrum::new(samples, dt, 123.2).unwrap().with_te(30.0);
        let data = Transients::Svs(vec![synthetic_fid(np, dt, 0.0, 0.05)]);

        let pipeline = Pipeline::new().with_step(step(
            "EddyCurrentCorrection",
            &[("gaussian_width", ParameterValue::Integer(5))],
        ));
        let controller = run(pipeline, data, Some(Transients::Svs(vec![wref.clone()])));

        let corrected = controller.history().latest_wref().unwrap().first().unwrap();
        let before = phase_roughness(&wref);
        let after = phase_roughness(corrected);
        assert!(before > 0.1);
        assert!(after < 0.05 * before, "before {} after {}", before, after);
    }

    #[test]
    fn test_scenario_remove_bad_averages() {
        let base = synthetic_fid(1024, 0.0005, 0.0, 0.05);
        let corrupted = [3, 11];
        let reps: Vec<Spectrum> = (0..20)
            .map(|i| {
                if corrupted.contains(&i) {
                    base.inherit(base.samples().iter().map(|v| v * 10.0).collect())
                        .unwrap()
                } else {
                    base.clone()
                }
            })
            .collect();

        let mut remove = step(
            "RemoveBadAverages",
            &[
                ("domain", ParameterValue::Text("time".into())),
                ("threshold", ParameterValue::Float(3.0)),
            ],
        );
        let mut bag = crate::steps::DataBag::new(Transients::Svs(reps.clone()), None, Header::default());
        remove.process(&mut bag).unwrap();
        let Some(Diagnostics::BadAverages { removed, .. }) = remove.diagnostics() else {
            panic!("missing diagnostics");
        };
        assert_eq!(removed, &vec![3, 11]);

        let expected: Vec<Spectrum> = reps
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !corrupted.contains(i))
            .map(|(_, s)| s)
            .collect();
        assert_eq!(bag.output.unwrap(), Transients::Svs(expected));
    }

    #[test]
    fn test_scenario_csi_te_phase_correction() {
        let clean = synthetic_fid(1024, 0.0005, 0.0, 0.05);
        let voxel = clean.adjust_phase(0.3, te_first_order(clean.te()));
        let grid = CsiGrid::new([2, 2, 2], vec![voxel; 8]).unwrap();

        let pipeline = Pipeline::new().with_step(step(
            "TePhaseCorrection",
            &[("ppm_range", ParameterValue::Vector(vec![3.7, 5.7]))],
        ));
        let controller = run(pipeline, Transients::Csi(grid), None);

        let output = controller.final_output().unwrap();
        assert!(output.is_csi());
        let peak_phases: Vec<f64> = output
            .spectra()
            .iter()
            .map(|s| {
                let spec = s.spectrum();
                let magnitudes: Vec<f64> = spec.iter().map(|v| v.norm()).collect();
                spec[dsp::argmax(&magnitudes).unwrap()].arg()
            })
            .collect();
        for p in &peak_phases {
            assert!((p - peak_phases[0]).abs().to_degrees() < 1.0);
        }
    }
}
