/// Frequency and phase alignment by spectral registration
///
/// Every repetition is fitted against a common target with two free
/// parameters (frequency shift, zero-order phase). The residual is the time
/// domain image of the frequency-windowed difference, stacked real/imag,
/// so the fit only sees the chosen ppm range.

use std::f64::consts::PI;

use num_complex::Complex64;

use crate::data::spectrum::{Spectrum, SpectrumError};
use crate::dsp::least_squares::{levenberg_marquardt, LeastSquaresOptions};
use crate::dsp::window::WindowFunction;
use crate::dsp::{self, SpectralTransform};

use super::apodization::apodize;
use super::parameter::ParameterSet;
use super::{svs_or_pass_through, DataBag, Diagnostics, Step, StepError, StepKind, StepOutcome};
use crate::data::transients::Transients;

/// Coarse resolution of the zero-order phase grid search (degrees)
pub const PHASE_GRID_STEP_DEG: f64 = 1.0;
/// Resolution of the refinement pass around the best coarse phase (degrees)
pub const PHASE_REFINE_STEP_DEG: f64 = 0.05;

/// Fitted correction for one repetition. The corrected signal is
/// `s.adjust_frequency(-shift_hz).adjust_phase(-phase_rad, 0)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentFit {
    pub shift_hz: f64,
    pub phase_rad: f64,
    pub cost: f64,
    pub converged: bool,
}

impl AlignmentFit {
    pub fn identity() -> Self {
        Self {
            shift_hz: 0.0,
            phase_rad: 0.0,
            cost: 0.0,
            converged: true,
        }
    }

    pub fn apply(&self, spectrum: &Spectrum) -> Spectrum {
        spectrum
            .adjust_frequency(-self.shift_hz)
            .adjust_phase(-self.phase_rad, 0.0)
    }
}

// ============================================================================
//  Registration core
// ============================================================================

/// A target spectrum prepared for repeated least-squares registration
pub struct SpectralRegistration {
    transform: SpectralTransform,
    target: Vec<Complex64>,
    mask: Vec<bool>,
    time: Vec<f64>,
    options: LeastSquaresOptions,
}

impl SpectralRegistration {
    /// `ppm_range` selects the frequency window the residual is computed over
    pub fn new(target: &Spectrum, ppm_range: (f64, f64)) -> Self {
        let np = target.np();
        Self {
            transform: SpectralTransform::new(np),
            target: target.samples()[..np].to_vec(),
            mask: dsp::range_mask(&target.frequency_axis_ppm(), ppm_range),
            time: target.time_axis(),
            options: LeastSquaresOptions::default(),
        }
    }

    /// Number of spectral points inside the window
    pub fn window_points(&self) -> usize {
        self.mask.iter().filter(|m| **m).count()
    }

    fn residual(&self, samples: &[Complex64], shift_hz: f64, phase_rad: f64) -> Vec<f64> {
        let diff: Vec<Complex64> = samples
            .iter()
            .zip(&self.target)
            .zip(&self.time)
            .map(|((s, target), t)| {
                s * Complex64::from_polar(1.0, -(2.0 * PI * shift_hz * t + phase_rad)) - target
            })
            .collect();
        let windowed: Vec<Complex64> = self
            .transform
            .spectrum(&diff)
            .into_iter()
            .zip(&self.mask)
            .map(|(v, &keep)| if keep { v } else { Complex64::new(0.0, 0.0) })
            .collect();
        let back = self.transform.fid(&windowed);
        back.iter().map(|v| v.re).chain(back.iter().map(|v| v.im)).collect()
    }

    /// Fit one repetition (time-domain samples on the target's grid)
    pub fn fit(&self, samples: &[Complex64], initial: [f64; 2]) -> AlignmentFit {
        if samples.len() != self.target.len() {
            return AlignmentFit {
                converged: false,
                ..AlignmentFit::identity()
            };
        }
        let fit = levenberg_marquardt(
            |p| self.residual(samples, p[0], p[1]),
            &initial,
            &self.options,
        );
        let finite = fit.params.iter().all(|p| p.is_finite());
        AlignmentFit {
            shift_hz: fit.params[0],
            phase_rad: dsp::wrap_angle(fit.params[1]),
            cost: fit.cost,
            converged: fit.converged && finite,
        }
    }
}

// ============================================================================
//  Targets and peak helpers
// ============================================================================

/// Per-sample median of the real and imaginary parts, metadata from the first
pub fn median_target(spectra: &[Spectrum]) -> Result<Spectrum, SpectrumError> {
    let first = spectra.first().ok_or(SpectrumError::Empty)?;
    if spectra.len() == 1 {
        return Ok(first.clone());
    }
    let len = first.samples().len();
    if let Some(bad) = spectra.iter().find(|s| s.samples().len() != len) {
        return Err(SpectrumError::LengthMismatch {
            expected: len,
            got: bad.samples().len(),
        });
    }
    let samples = (0..len)
        .map(|i| {
            let re: Vec<f64> = spectra.iter().map(|s| s.samples()[i].re).collect();
            let im: Vec<f64> = spectra.iter().map(|s| s.samples()[i].im).collect();
            Complex64::new(dsp::median(&re), dsp::median(&im))
        })
        .collect();
    first.inherit(samples)
}

/// Frequency (Hz) of the largest magnitude inside a ppm window
pub fn peak_frequency(spectrum: &Spectrum, ppm_window: (f64, f64)) -> Option<f64> {
    let spec = spectrum.spectrum();
    let mask = dsp::range_mask(&spectrum.frequency_axis_ppm(), ppm_window);
    let freqs = spectrum.frequency_axis();
    let magnitudes: Vec<f64> = spec[..spectrum.np()]
        .iter()
        .zip(&mask)
        .map(|(v, &keep)| if keep { v.norm() } else { f64::NEG_INFINITY })
        .collect();
    dsp::argmax(&magnitudes)
        .filter(|&i| mask[i])
        .map(|i| freqs[i])
}

/// Zero-order phase (rad) maximising the real peak inside a ppm window.
///
/// Exhaustive search over -180°..180° followed by a finer pass around the
/// best coarse angle.
pub fn phase_grid_search(spectrum: &Spectrum, ppm_window: (f64, f64)) -> f64 {
    let spec = spectrum.spectrum();
    let mask = dsp::range_mask(&spectrum.frequency_axis_ppm(), ppm_window);
    let window: Vec<Complex64> = spec[..spectrum.np()]
        .iter()
        .zip(&mask)
        .filter(|(_, keep)| **keep)
        .map(|(v, _)| *v)
        .collect();
    if window.is_empty() {
        return 0.0;
    }
    let coarse_steps = (360.0 / PHASE_GRID_STEP_DEG).round() as i64;
    let coarse = best_phase(
        &window,
        (0..=coarse_steps).map(|k| -180.0 + k as f64 * PHASE_GRID_STEP_DEG),
    );
    let fine_steps = (2.0 * PHASE_GRID_STEP_DEG / PHASE_REFINE_STEP_DEG).round() as i64;
    let fine = best_phase(
        &window,
        (0..=fine_steps).map(|k| coarse - PHASE_GRID_STEP_DEG + k as f64 * PHASE_REFINE_STEP_DEG),
    );
    dsp::wrap_angle(fine.to_radians())
}

/// Candidate angle (degrees) with the largest rotated real value
fn best_phase(window: &[Complex64], candidates: impl Iterator<Item = f64>) -> f64 {
    let mut best = (0.0, f64::NEG_INFINITY);
    for deg in candidates {
        let rot = Complex64::from_polar(1.0, deg.to_radians());
        let score = window
            .iter()
            .map(|v| (v * rot).re)
            .fold(f64::NEG_INFINITY, f64::max);
        if score > best.1 {
            best = (deg, score);
        }
    }
    best.0
}

/// First-order phase (rad/Hz) accumulated over the echo time
pub fn te_first_order(te_ms: f64) -> f64 {
    2.0 * PI * te_ms / 1000.0
}

// ============================================================================
//  Step
// ============================================================================

pub struct FreqPhaseAlignment {
    params: ParameterSet,
    diagnostics: Option<Diagnostics>,
}

impl Default for FreqPhaseAlignment {
    fn default() -> Self {
        Self {
            params: ParameterSet::new()
                .integer("zero_padding", "Zero padding factor (fit only)", 0, 0, 16)
                .choice("window", "Line broadening window", "lorentzian", &["lorentzian", "gaussian"])
                .float("line_broadening", "Line broadening (Hz, fit only)", 0.0, 0.0, 100.0)
                .choice("target", "Target", "median", &["median", "index"])
                .integer("target_index", "Target repetition", 0, 0, 1_000_000)
                .vector("ppm_range", "Fit window (ppm)", &[1.8, 4.2], -100.0, 100.0)
                .choice("nucleus", "Nucleus", "1H", &["1H", "31P"])
                .float("peak_ppm", "Reference peak (ppm)", 0.0, -100.0, 100.0)
                .vector("peak_window", "Peak search window (ppm)", &[-2.0, 2.0], -100.0, 100.0)
                .choice("first_order", "First-order phase", "none", &["none", "te"]),
            diagnostics: None,
        }
    }
}

impl FreqPhaseAlignment {
    fn fit_aid(&self, spectrum: &Spectrum) -> Result<Spectrum, StepError> {
        let window = WindowFunction::from_label(
            self.params.get_text("window")?,
            self.params.get_float("line_broadening")?,
        );
        let padded = spectrum.zero_pad(self.params.get_usize("zero_padding")?);
        apodize(&padded, window)
    }
}

impl Step for FreqPhaseAlignment {
    fn kind(&self) -> StepKind {
        StepKind::FreqPhaseAlignment
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
        if reps.iter().any(|s| s.is_multi_coil()) {
            data.pass_through();
            return Ok(StepOutcome::degraded(
                "Frequency/phase alignment needs coil-combined data; passing through",
            ));
        }

        let phosphorus = self.params.get_text("nucleus")? == "31P";
        let reps = if phosphorus && self.params.get_text("first_order")? == "te" {
            reps.iter()
                .map(|s| s.adjust_phase(0.0, -te_first_order(s.te())))
                .collect()
        } else {
            reps
        };

        let aids = reps
            .iter()
            .map(|s| self.fit_aid(s))
            .collect::<Result<Vec<_>, _>>()?;

        let (mut target, target_index) = match self.params.get_text("target")? {
            "index" => {
                let idx = self.params.get_usize("target_index")?;
                match aids.get(idx) {
                    Some(t) => (t.clone(), Some(idx)),
                    None => {
                        outcome.warn(format!(
                            "Target index {} out of range ({} repetitions), using the median",
                            idx,
                            aids.len()
                        ));
                        (median_target(&aids)?, None)
                    }
                }
            }
            _ => (median_target(&aids)?, None),
        };

        let mut target_shift_hz = 0.0;
        let mut target_phase_rad = 0.0;
        if phosphorus {
            let peak_ppm = self.params.get_float("peak_ppm")?;
            let window = self.params.get_range("peak_window")?;
            let search = (peak_ppm + window.0, peak_ppm + window.1);
            match peak_frequency(&target, search) {
                Some(f) => {
                    target_shift_hz = f - target.ppm_to_hertz(peak_ppm);
                    target = target.adjust_frequency(-target_shift_hz);
                }
                None => outcome.warn("No peak found in the search window, target not shifted"),
            }
            target_phase_rad = phase_grid_search(&target, search);
            target = target.adjust_phase(target_phase_rad, 0.0);
            log::debug!(
                "31P target: shift {:.3} Hz, phase {:.2}°",
                target_shift_hz,
                target_phase_rad.to_degrees()
            );
        }

        let registration = SpectralRegistration::new(&target, self.params.get_range("ppm_range")?);
        if registration.window_points() == 0 {
            data.pass_through();
            outcome.warn("Alignment window contains no spectral points; passing through");
            return Ok(outcome);
        }

        let initial = [target_shift_hz, -target_phase_rad];
        let mut fits = Vec::with_capacity(reps.len());
        for (idx, aid) in aids.iter().enumerate() {
            let fit = registration.fit(aid.samples(), initial);
            if fit.converged {
                fits.push(fit);
            } else {
                outcome.warn(format!("Alignment of repetition {} did not converge, left unchanged", idx));
                fits.push(AlignmentFit {
                    converged: false,
                    ..AlignmentFit::identity()
                });
            }
        }

        let aligned = reps.iter().zip(&fits).map(|(s, fit)| fit.apply(s)).collect();
        data.output = Some(Transients::Svs(aligned));

        log::info!(
            "Aligned {} repetitions (shift range {:.2}..{:.2} Hz)",
            fits.len(),
            fits.iter().map(|f| f.shift_hz).fold(f64::INFINITY, f64::min),
            fits.iter().map(|f| f.shift_hz).fold(f64::NEG_INFINITY, f64::max)
        );
        self.diagnostics = Some(Diagnostics::Alignment {
            target_index,
            target_shift_hz,
            target_phase_rad,
            shifts_hz: fits.iter().map(|f| f.shift_hz).collect(),
            phases_rad: fits.iter().map(|f| f.phase_rad).collect(),
            converged: fits.iter().map(|f| f.converged).collect(),
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
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_registration_recovers_shift_and_phase() {
        let target = synthetic_fid(512, 0.0005, 0.0, 0.05);
        let rep = target.adjust_frequency(3.0).adjust_phase(0.2, 0.0);
        let registration = SpectralRegistration::new(&target, (3.7, 5.7));
        let fit = registration.fit(rep.samples(), [0.0, 0.0]);
        assert!(fit.converged);
        assert_abs_diff_eq!(fit.shift_hz, 3.0, epsilon = 1e-4);
        assert_abs_diff_eq!(fit.phase_rad, 0.2, epsilon = 1e-4);
    }

    #[test]
    fn test_median_target() {
        let a = synthetic_fid(8, 0.001, 0.0, 0.1);
        let scaled = |k: f64| a.inherit(a.samples().iter().map(|v| v * k).collect()).unwrap();
        let target = median_target(&[scaled(1.0), scaled(5.0), scaled(2.0)]).unwrap();
        for (m, v) in target.samples().iter().zip(a.samples()) {
            assert_abs_diff_eq!(m.re, 2.0 * v.re, epsilon = 1e-12);
            assert_abs_diff_eq!(m.im, 2.0 * v.im, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_phase_grid_search() {
        let s = synthetic_fid(512, 0.0005, 0.0, 0.05).adjust_phase(0.7, 0.0);
        let phase = phase_grid_search(&s, (3.7, 5.7));
        assert_abs_diff_eq!(phase, -0.7, epsilon = PHASE_REFINE_STEP_DEG.to_radians());
    }

    #[test]
    fn test_peak_frequency() {
        let s = synthetic_fid(1024, 0.0005, 19.53125, 0.05);
        let f = peak_frequency(&s, (4.0, 5.0)).unwrap();
        assert_abs_diff_eq!(f, 19.53125, epsilon = 1e-9);
    }

    #[test]
    fn test_alignment_step_to_index_target() {
        let base = synthetic_fid(512, 0.0005, 0.0, 0.05);
        let reps = vec![
            base.adjust_frequency(1.0),
            base.clone(),
            base.adjust_frequency(-1.0),
        ];
        let mut bag = DataBag::new(Transients::Svs(reps), None, Header::default());
        let mut step = FreqPhaseAlignment::default();
        step.set_parameter("ppm_range", ParameterValue::Vector(vec![3.7, 5.7]))
            .unwrap();
        step.set_parameter("target", ParameterValue::Text("index".into()))
            .unwrap();
        step.set_parameter("target_index", ParameterValue::Integer(1))
            .unwrap();
        let outcome = step.process(&mut bag).unwrap();
        assert!(!outcome.is_degraded());

        let Some(Diagnostics::Alignment { shifts_hz, .. }) = step.diagnostics() else {
            panic!("missing diagnostics");
        };
        assert_abs_diff_eq!(shifts_hz[0], 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(shifts_hz[1], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(shifts_hz[2], -1.0, epsilon = 1e-4);
        assert_eq!(bag.output.unwrap().len(), 3);
    }

    /// Frequency (Hz) and phase (rad) of the largest spectral magnitude
    fn peak_and_phase(s: &Spectrum) -> (f64, f64) {
        let spec = s.spectrum();
        let magnitudes: Vec<f64> = spec.iter().map(|v| v.norm()).collect();
        let i = dsp::argmax(&magnitudes).unwrap();
        (s.frequency_axis()[i], spec[i].arg())
    }

    fn align_phosphorus(first_order: &str, te_phase: bool) -> (Vec<Spectrum>, FreqPhaseAlignment) {
        let base = synthetic_fid(1024, 0.0005, 0.0, 0.05);
        let reps: Vec<Spectrum> = [0.0, 1.0, -1.0]
            .iter()
            .map(|f| {
                let phase1 = if te_phase { te_first_order(base.te()) } else { 0.0 };
                base.adjust_frequency(*f).adjust_phase(0.5, phase1)
            })
            .collect();
        let mut bag = DataBag::new(Transients::Svs(reps), None, Header::default());
        let mut step = FreqPhaseAlignment::default();
        step.set_parameter("nucleus", ParameterValue::Text("31P".into()))
            .unwrap();
        step.set_parameter("peak_ppm", ParameterValue::Float(4.7))
            .unwrap();
        step.set_parameter("ppm_range", ParameterValue::Vector(vec![3.7, 5.7]))
            .unwrap();
        step.set_parameter("first_order", ParameterValue::Text(first_order.into()))
            .unwrap();
        let outcome = step.process(&mut bag).unwrap();
        assert!(!outcome.is_degraded(), "{:?}", outcome.warnings);
        (bag.output.unwrap().spectra().to_vec(), step)
    }

    #[test]
    fn test_phosphorus_alignment_to_reference_peak() {
        let (aligned, step) = align_phosphorus("none", false);
        let Some(Diagnostics::Alignment { converged, .. }) = step.diagnostics() else {
            panic!("missing diagnostics");
        };
        assert_eq!(converged, &vec![true; 3]);
        for s in &aligned {
            let (f, phase) = peak_and_phase(s);
            assert_abs_diff_eq!(f, s.ppm_to_hertz(4.7), epsilon = 1e-9);
            assert_abs_diff_eq!(phase, 0.0, epsilon = 0.02);
        }
    }

    #[test]
    fn test_phosphorus_alignment_removes_te_phase() {
        let (aligned, step) = align_phosphorus("te", true);
        let Some(Diagnostics::Alignment { converged, shifts_hz, .. }) = step.diagnostics() else {
            panic!("missing diagnostics");
        };
        assert_eq!(converged, &vec![true; 3]);
        assert_abs_diff_eq!(shifts_hz[1] - shifts_hz[0], 1.0, epsilon = 0.01);
        assert_abs_diff_eq!(shifts_hz[2] - shifts_hz[0], -1.0, epsilon = 0.01);
        for s in &aligned {
            let (f, phase) = peak_and_phase(s);
            assert_abs_diff_eq!(f, s.ppm_to_hertz(4.7), epsilon = 1e-9);
            assert_abs_diff_eq!(phase, 0.0, epsilon = 0.02);
        }
    }

    #[test]
    fn test_empty_window_degrades() {
        let reps = vec![synthetic_fid(64, 0.001, 0.0, 0.1); 3];
        let mut bag = DataBag::new(Transients::Svs(reps), None, Header::default());
        let mut step = FreqPhaseAlignment::default();
        step.set_parameter("ppm_range", ParameterValue::Vector(vec![90.0, 91.0]))
            .unwrap();
        assert!(step.process(&mut bag).unwrap().is_degraded());
    }
}
