/// Quality matrix: SNR per repetition and water linewidth
///
/// Diagnostics only. The signal stream always passes through unchanged.

use crate::data::spectrum::Spectrum;
use crate::data::transients::Transients;
use crate::dsp::{self, least_squares};

use super::alignment::phase_grid_search;
use super::parameter::ParameterSet;
use super::{DataBag, Diagnostics, Step, StepError, StepKind, StepOutcome, WaterLinewidth};

/// Peak of the real spectrum in `signal_ppm` over the std of the detrended
/// real spectrum in `noise_ppm`.
pub fn snr(spectrum: &Spectrum, signal_ppm: (f64, f64), noise_ppm: (f64, f64), order: usize) -> f64 {
    let np = spectrum.np();
    let spec = spectrum.spectrum();
    let ppm = spectrum.frequency_axis_ppm();

    let signal_mask = dsp::range_mask(&ppm, signal_ppm);
    let peak = spec[..np]
        .iter()
        .zip(&signal_mask)
        .filter(|(_, keep)| **keep)
        .map(|(v, _)| v.re)
        .fold(f64::NEG_INFINITY, f64::max);

    let noise_mask = dsp::range_mask(&ppm, noise_ppm);
    let (xs, ys): (Vec<f64>, Vec<f64>) = ppm
        .iter()
        .zip(&spec[..np])
        .zip(&noise_mask)
        .filter(|(_, keep)| **keep)
        .map(|((x, v), _)| (*x, v.re))
        .unzip();
    if xs.len() < 2 || !peak.is_finite() {
        return 0.0;
    }
    let trend = dsp::polyfit_trend(&xs, &ys, order);
    let detrended: Vec<f64> = ys.iter().zip(&trend).map(|(y, t)| y - t).collect();
    let noise = dsp::std_dev(&detrended);
    if noise > 0.0 {
        peak / noise
    } else {
        f64::INFINITY
    }
}

/// Gaussian fit of the phased water peak (real part)
pub fn water_linewidth(wref: &Spectrum, water_ppm: (f64, f64)) -> Option<WaterLinewidth> {
    let phased = wref.adjust_phase(phase_grid_search(wref, water_ppm), 0.0);
    let np = phased.np();
    let spec = phased.spectrum();
    let mask = dsp::range_mask(&phased.frequency_axis_ppm(), water_ppm);
    let (xs, ys): (Vec<f64>, Vec<f64>) = phased
        .frequency_axis()
        .into_iter()
        .zip(&spec[..np])
        .zip(&mask)
        .filter(|(_, keep)| **keep)
        .map(|((f, v), _)| (f, v.re))
        .unzip();
    let fit = least_squares::fit_gaussian(&xs, &ys)?;
    if !fit.converged {
        return None;
    }
    let fwhm_hz = fit.fwhm();
    Some(WaterLinewidth {
        fwhm_hz,
        fwhm_ppm: fwhm_hz / wref.f0(),
        fit,
    })
}

pub struct QualityMatrix {
    params: ParameterSet,
    diagnostics: Option<Diagnostics>,
}

impl Default for QualityMatrix {
    fn default() -> Self {
        Self {
            params: ParameterSet::new()
                .vector("signal_range", "Metabolite window (ppm)", &[1.9, 2.1], -100.0, 100.0)
                .vector("noise_range", "Noise window (ppm)", &[-2.0, 0.0], -100.0, 100.0)
                .integer("detrend_order", "Noise detrend order", 2, 0, 8)
                .vector("water_range", "Water window (ppm)", &[3.7, 5.7], -100.0, 100.0),
            diagnostics: None,
        }
    }
}

impl QualityMatrix {
    fn snr_all(&self, data: &Transients) -> Result<Vec<f64>, StepError> {
        let signal = self.params.get_range("signal_range")?;
        let noise = self.params.get_range("noise_range")?;
        let order = self.params.get_usize("detrend_order")?;
        Ok(data
            .spectra()
            .iter()
            .map(|s| snr(s, signal, noise, order))
            .collect())
    }
}

impl Step for QualityMatrix {
    fn kind(&self) -> StepKind {
        StepKind::QualityMatrix
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
        data.pass_through();

        let snr = self.snr_all(&data.input)?;
        let baseline_snr = match &data.baseline {
            Some(b) => self.snr_all(b)?,
            None => Vec::new(),
        };

        let water = match data.wref_reference() {
            Some(reference) => {
                let reference = reference?;
                let fit = water_linewidth(&reference, self.params.get_range("water_range")?);
                match &fit {
                    Some(w) => log::info!("Water FWHM {:.2} Hz ({:.4} ppm)", w.fwhm_hz, w.fwhm_ppm),
                    None => outcome.warn("Water peak fit did not converge"),
                }
                fit
            }
            None => None,
        };

        log::info!(
            "SNR: mean {:.1} over {} spectra",
            dsp::mean(&snr),
            snr.len()
        );
        self.diagnostics = Some(Diagnostics::Quality {
            snr,
            baseline_snr,
            water,
        });
        Ok(outcome)
    }

    fn diagnostics(&self) -> Option<&Diagnostics> {
        self.diagnostics.as_ref()
    }
}
