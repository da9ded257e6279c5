/// Eddy-current correction from the water reference phase
///
/// The smoothed, unwrapped water phase minus its early linear trend is
/// removed from every FID by a time-domain multiplication.

use num_complex::Complex64;

use crate::data::spectrum::Spectrum;
use crate::data::transients::Transients;
use crate::dsp::{self, least_squares};

use super::parameter::ParameterSet;
use super::{DataBag, Diagnostics, Step, StepError, StepKind, StepOutcome};

/// Fraction of the smoothed phase used for the linear baseline
pub const LINEAR_FIT_FRACTION: f64 = 0.1;

/// Correction factors derived from one water reference
#[derive(Debug, Clone)]
pub struct EccCorrection {
    pub factors: Vec<Complex64>,
    pub raw_phase: Vec<f64>,
    pub smoothed_phase: Vec<f64>,
    pub slope: f64,
    pub intercept: f64,
}

impl EccCorrection {
    pub fn from_reference(wref: &Spectrum, width: usize) -> Self {
        let np = wref.np();
        let raw_phase = dsp::unwrap_phase(
            &wref.samples()[..np].iter().map(|v| v.arg()).collect::<Vec<_>>(),
        );
        let smoothed_phase = dsp::convolve_same(&raw_phase, &dsp::gaussian_kernel(width));

        let time = wref.time_axis();
        let n_fit = ((np as f64 * LINEAR_FIT_FRACTION) as usize).clamp(2.min(np), np);
        let (slope, intercept) = least_squares::line_fit(&time[..n_fit], &smoothed_phase[..n_fit]);

        let factors = time
            .iter()
            .zip(&smoothed_phase)
            .map(|(t, p)| Complex64::from_polar(1.0, -(p - (slope * t + intercept))))
            .collect();
        Self {
            factors,
            raw_phase,
            smoothed_phase,
            slope,
            intercept,
        }
    }

    pub fn apply(&self, spectrum: &Spectrum) -> Result<Spectrum, StepError> {
        let np = spectrum.np();
        if np != self.factors.len() {
            return Err(StepError::Invalid(format!(
                "eddy-current factors have {} points, spectrum has {}",
                self.factors.len(),
                np
            )));
        }
        let samples = spectrum
            .samples()
            .iter()
            .enumerate()
            .map(|(i, v)| v * self.factors[i % np])
            .collect();
        Ok(spectrum.inherit(samples)?)
    }
}

pub struct EddyCurrentCorrection {
    params: ParameterSet,
    diagnostics: Option<Diagnostics>,
}

impl Default for EddyCurrentCorrection {
    fn default() -> Self {
        Self {
            params: ParameterSet::new().integer("gaussian_width", "Smoothing width (points)", 5, 1, 1024),
            diagnostics: None,
        }
    }
}

impl Step for EddyCurrentCorrection {
    fn kind(&self) -> StepKind {
        StepKind::EddyCurrentCorrection
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn process(&mut self, data: &mut DataBag) -> Result<StepOutcome, StepError> {
        self.diagnostics = None;
        let width = self.params.get_usize("gaussian_width")?;
        let Some(wref) = data.wref.clone() else {
            data.pass_through();
            return Ok(StepOutcome::degraded(
                "No water reference, eddy-current correction skipped",
            ));
        };

        let np = data.input.first().map(|s| s.np()).unwrap_or(0);
        if wref.first().map(|s| s.np()) != Some(np) {
            data.pass_through();
            return Ok(StepOutcome::degraded(format!(
                "Water reference length differs from the data ({} points), eddy-current correction skipped",
                np
            )));
        }

        // Voxel-wise correction when the reference is a matching grid
        if let (Transients::Csi(grid), Transients::Csi(wgrid)) = (&data.input, &wref) {
            if grid.dims() == wgrid.dims() {
                let mut voxels = Vec::with_capacity(grid.voxels().len());
                let mut wvoxels = Vec::with_capacity(grid.voxels().len());
                let mut slopes = Vec::with_capacity(grid.voxels().len());
                let mut intercepts = Vec::with_capacity(grid.voxels().len());
                for (voxel, wvoxel) in grid.voxels().iter().zip(wgrid.voxels()) {
                    let ecc = EccCorrection::from_reference(wvoxel, width);
                    voxels.push(ecc.apply(voxel)?);
                    wvoxels.push(ecc.apply(wvoxel)?);
                    slopes.push(ecc.slope);
                    intercepts.push(ecc.intercept);
                }
                data.output = Some(Transients::Csi(grid.with_voxels(voxels)?));
                data.wref_output = Some(Transients::Csi(wgrid.with_voxels(wvoxels)?));
                log::debug!("ECC applied voxel-wise over a {:?} grid", grid.dims());
                self.diagnostics = Some(Diagnostics::EddyCurrentGrid {
                    dims: grid.dims(),
                    slopes,
                    intercepts,
                });
                return Ok(StepOutcome::ok());
            }
        }

        let ecc = EccCorrection::from_reference(&wref.reference()?, width);
        log::debug!(
            "ECC linear trend: slope {:.4} rad/s, intercept {:.4} rad",
            ecc.slope,
            ecc.intercept
        );
        data.output = Some(data.input.map_spectra(|s| ecc.apply(s))?);
        data.wref_output = Some(wref.map_spectra(|s| ecc.apply(s))?);
        self.diagnostics = Some(Diagnostics::EddyCurrent {
            raw_phase: ecc.raw_phase,
            smoothed_phase: ecc.smoothed_phase,
            slope: ecc.slope,
            intercept: ecc.intercept,
        });
        Ok(StepOutcome::ok())
    }

    fn diagnostics(&self) -> Option<&Diagnostics> {
        self.diagnostics.as_ref()
    }
}
