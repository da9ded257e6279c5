/// Echo-time based phase correction for ³¹P data
///
/// The first-order phase accumulated over TE is removed once, globally.
/// The remaining frequency and zero-order phase differences are then fitted
/// against a single target: the repetition median for single-voxel data,
/// the voxel with the largest real spectral area for CSI.

use rayon::prelude::*;

use crate::data::spectrum::Spectrum;
use crate::data::transients::Transients;

use super::alignment::{median_target, te_first_order, AlignmentFit, SpectralRegistration};
use super::parameter::ParameterSet;
use super::{DataBag, Diagnostics, Step, StepError, StepKind, StepOutcome};

/// Index of the spectrum with the largest `Σ Re(spectrum)`
pub fn largest_real_area(spectra: &[Spectrum]) -> Option<usize> {
    let areas: Vec<f64> = spectra
        .iter()
        .map(|s| s.spectrum()[..s.np()].iter().map(|v| v.re).sum())
        .collect();
    crate::dsp::argmax(&areas)
}

pub struct TePhaseCorrection {
    params: ParameterSet,
    diagnostics: Option<Diagnostics>,
}

impl Default for TePhaseCorrection {
    fn default() -> Self {
        Self {
            params: ParameterSet::new()
                .choice("te_source", "Echo time from", "header", &["header", "manual"])
                .float("te_ms", "Echo time (ms)", 0.0, 0.0, 10_000.0)
                .vector("ppm_range", "Fit window (ppm)", &[-20.0, 10.0], -100.0, 100.0),
            diagnostics: None,
        }
    }
}

impl TePhaseCorrection {
    fn echo_time(&self, data: &DataBag) -> Result<f64, StepError> {
        if self.params.get_text("te_source")? == "manual" {
            return Ok(self.params.get_float("te_ms")?);
        }
        Ok(data
            .header
            .te_ms
            .or_else(|| data.input.first().map(|s| s.te()))
            .unwrap_or(0.0))
    }
}

impl Step for TePhaseCorrection {
    fn kind(&self) -> StepKind {
        StepKind::TePhaseCorrection
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
        if data.input.has_multi_coil() {
            data.pass_through();
            return Ok(StepOutcome::degraded(
                "TE phase correction needs coil-combined data; passing through",
            ));
        }

        let te_ms = self.echo_time(data)?;
        let first_order = te_first_order(te_ms);
        let phased: Vec<Spectrum> = data
            .input
            .spectra()
            .iter()
            .map(|s| s.adjust_phase(0.0, -first_order))
            .collect();

        let (target, target_index) = match &data.input {
            Transients::Svs(_) => (median_target(&phased)?, None),
            Transients::Csi(_) => {
                let idx = largest_real_area(&phased).unwrap_or(0);
                (phased[idx].clone(), Some(idx))
            }
        };

        let registration = SpectralRegistration::new(&target, self.params.get_range("ppm_range")?);
        if registration.window_points() == 0 {
            outcome.warn("Fit window contains no spectral points; only the TE phase was applied");
            data.output = Some(data.input.with_spectra(phased)?);
            return Ok(outcome);
        }

        // voxels (or repetitions) are independent
        let fits: Vec<AlignmentFit> = phased
            .par_iter()
            .map(|s| registration.fit(s.samples(), [0.0, 0.0]))
            .collect();

        let mut corrected = Vec::with_capacity(phased.len());
        for (idx, (spectrum, fit)) in phased.iter().zip(&fits).enumerate() {
            if fit.converged {
                corrected.push(fit.apply(spectrum));
            } else {
                outcome.warn(format!("Alignment of spectrum {} did not converge, TE phase only", idx));
                corrected.push(spectrum.clone());
            }
        }

        log::info!(
            "TE phase correction: TE {:.2} ms, first order {:.4} rad/Hz, {} spectra",
            te_ms,
            first_order,
            corrected.len()
        );
        data.output = Some(data.input.with_spectra(corrected)?);
        self.diagnostics = Some(Diagnostics::TePhase {
            te_ms,
            first_order_rad: first_order,
            target_index,
            shifts_hz: fits.iter().map(|f| if f.converged { f.shift_hz } else { 0.0 }).collect(),
            phases_rad: fits.iter().map(|f| if f.converged { f.phase_rad } else { 0.0 }).collect(),
            converged: fits.iter().map(|f| f.converged).collect(),
        });
        Ok(outcome)
    }

    fn diagnostics(&self) -> Option<&Diagnostics> {
        self.diagnostics.as_ref()
    }
}
