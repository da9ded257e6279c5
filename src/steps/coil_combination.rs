/// Adaptive coil combination
///
/// Coil sensitivities are the dominant eigenvector of the coil covariance
/// of a reference signal (water reference if it has coils, otherwise the
/// repetition average), found by a fixed number of power iterations.

use num_complex::Complex64;

use crate::data::spectrum::Spectrum;
use crate::data::transients::Transients;

use super::parameter::ParameterSet;
use super::{DataBag, Diagnostics, Step, StepError, StepKind, StepOutcome};

/// Power iterations used for the sensitivity estimate
pub const POWER_ITERATIONS: usize = 2;

/// Per-coil weights plus the global phase that makes the combined
/// reference start real and positive.
#[derive(Debug, Clone, PartialEq)]
pub struct CoilWeights {
    /// conj(csm) per coil
    pub weights: Vec<Complex64>,
    pub phase: Complex64,
    pub norm: f64,
}

impl CoilWeights {
    /// Estimate weights from a multi-coil reference spectrum
    pub fn estimate(reference: &Spectrum) -> Self {
        let coils = reference.coils();
        let np = reference.np();

        // s = data / sqrt(Σ data·conj(data))
        let energy: f64 = reference.samples().iter().map(|v| v.norm_sqr()).sum();
        let scale = 1.0 / energy.sqrt().max(f64::EPSILON);

        // R = Σ_t s(t)·s(t)ᴴ
        let mut r = vec![Complex64::new(0.0, 0.0); coils * coils];
        for t in 0..np {
            for a in 0..coils {
                let sa = reference.coil(a)[t] * scale;
                for b in 0..coils {
                    let sb = reference.coil(b)[t] * scale;
                    r[a * coils + b] += sa * sb.conj();
                }
            }
        }

        let mut v = vec![Complex64::new(1.0, 0.0); coils];
        for _ in 0..POWER_ITERATIONS {
            let next: Vec<Complex64> = (0..coils)
                .map(|a| (0..coils).map(|b| r[a * coils + b] * v[b]).sum())
                .collect();
            let norm = next.iter().map(|x| x.norm_sqr()).sum::<f64>().sqrt().max(f64::EPSILON);
            v = next.into_iter().map(|x| x / norm).collect();
        }

        // Remove the arbitrary global phase: coil 0 becomes real
        let rotation = Complex64::from_polar(1.0, -v[0].arg());
        let csm: Vec<Complex64> = v.iter().map(|x| x * rotation).collect();
        let weights: Vec<Complex64> = csm.iter().map(|x| x.conj()).collect();
        let norm = csm.iter().map(|x| x.norm_sqr()).sum::<f64>().max(f64::EPSILON);

        let mut combined = Self {
            weights,
            phase: Complex64::new(1.0, 0.0),
            norm,
        };
        let first = combined.combine_point(reference, 0);
        combined.phase = Complex64::from_polar(1.0, -first.arg());
        combined
    }

    fn combine_point(&self, spectrum: &Spectrum, t: usize) -> Complex64 {
        self.weights
            .iter()
            .enumerate()
            .map(|(c, w)| w * spectrum.coil(c)[t])
            .sum::<Complex64>()
            / self.norm
    }

    /// Σ conj(csm)·signal·phase / Σ|csm|²
    pub fn apply(&self, spectrum: &Spectrum) -> Result<Spectrum, StepError> {
        if spectrum.coils() != self.weights.len() {
            return Err(StepError::Invalid(format!(
                "spectrum has {} coils, weights were estimated for {}",
                spectrum.coils(),
                self.weights.len()
            )));
        }
        let samples = (0..spectrum.np())
            .map(|t| self.combine_point(spectrum, t) * self.phase)
            .collect();
        Ok(spectrum.inherit_combined(samples)?)
    }
}

/// Combine a reference whose coils do not match the data using weights
/// estimated from the reference itself
fn combine_with_own_weights(reference: &Spectrum) -> Result<Spectrum, StepError> {
    if reference.coils() < 2 {
        return Ok(reference.clone());
    }
    CoilWeights::estimate(reference).apply(reference)
}

/// Average every `shots` consecutive spectra. A trailing partial group is
/// averaged on its own.
pub fn block_average(spectra: &[Spectrum], shots: usize) -> Result<Vec<Spectrum>, StepError> {
    if shots <= 1 {
        return Ok(spectra.to_vec());
    }
    spectra
        .chunks(shots)
        .map(|group| Spectrum::mean(group).map_err(StepError::from))
        .collect()
}

pub struct CoilCombination {
    params: ParameterSet,
    diagnostics: Option<Diagnostics>,
}

impl Default for CoilCombination {
    fn default() -> Self {
        Self {
            params: ParameterSet::new().integer(
                "shots_per_measurement",
                "Shots per measurement (0 = from header)",
                0,
                0,
                1024,
            ),
            diagnostics: None,
        }
    }
}

impl CoilCombination {
    fn shots(&self, data: &Transients) -> Result<usize, StepError> {
        let shots = self.params.get_usize("shots_per_measurement")?;
        if shots > 0 {
            return Ok(shots);
        }
        Ok(data
            .first()
            .and_then(|s| s.averages_per_repetition())
            .unwrap_or(1)
            .max(1))
    }

    fn combine_svs(
        &mut self,
        list: &[Spectrum],
        wref: Option<&Transients>,
        shots: usize,
        outcome: &mut StepOutcome,
    ) -> Result<(Vec<Spectrum>, Option<Transients>), StepError> {
        let wref_coils = wref.filter(|w| w.first().map(|s| s.coils()) == list.first().map(|s| s.coils()));
        if wref.is_some() && wref_coils.is_none() {
            outcome.warn("Water reference coil count differs from the data; using the data average");
        }
        let reference = match wref_coils {
            Some(w) => w.reference()?,
            None => Spectrum::mean(list)?,
        };
        let weights = CoilWeights::estimate(&reference);

        let combined = list
            .iter()
            .map(|s| weights.apply(s))
            .collect::<Result<Vec<_>, _>>()?;
        if shots > 1 && list.len() % shots != 0 {
            outcome.warn(format!(
                "{} repetitions do not split into groups of {}; last group is partial",
                list.len(),
                shots
            ));
        }
        let output = block_average(&combined, shots)?;

        let wref_output = match (wref, wref_coils) {
            (_, Some(Transients::Svs(w))) => {
                let combined = w
                    .iter()
                    .map(|s| weights.apply(s))
                    .collect::<Result<Vec<_>, _>>()?;
                Some(Transients::Svs(block_average(&combined, shots)?))
            }
            (Some(Transients::Svs(w)), None) => {
                outcome.warn("Water reference combined with its own coil weights");
                let combined = w
                    .iter()
                    .map(combine_with_own_weights)
                    .collect::<Result<Vec<_>, _>>()?;
                Some(Transients::Svs(block_average(&combined, shots)?))
            }
            (Some(Transients::Csi(_)), _) => {
                outcome.warn("Water reference is a CSI grid, left uncombined for single-voxel data");
                None
            }
            (None, _) => None,
            // wref_coils is wref filtered, so it can never differ in variant from wref.
            (Some(Transients::Svs(_)), Some(Transients::Csi(_))) => unreachable!(),
        };

        self.diagnostics = Some(Diagnostics::CoilCombination {
            weights: weights.weights.clone(),
            shots_per_measurement: shots,
        });
        Ok((output, wref_output))
    }
}

impl Step for CoilCombination {
    fn kind(&self) -> StepKind {
        StepKind::CoilCombination
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn process(&mut self, data: &mut DataBag) -> Result<StepOutcome, StepError> {
        self.diagnostics = None;
        if !data.input.has_multi_coil() {
            log::info!("Single-channel data, coil combination skipped");
            data.pass_through();
            return Ok(StepOutcome::ok());
        }

        let mut outcome = StepOutcome::ok();
        let output = match &data.input {
            Transients::Svs(list) => {
                let shots = self.shots(&data.input)?;
                let (combined, wref_output) =
                    self.combine_svs(list, data.wref.as_ref(), shots, &mut outcome)?;
                data.wref_output = wref_output;
                Transients::Svs(combined)
            }
            Transients::Csi(grid) => {
                // Each voxel is its own reference
                let wref_voxels = match &data.wref {
                    Some(Transients::Csi(w)) if w.dims() == grid.dims() => Some(w.voxels()),
                    Some(_) => {
                        outcome.warn("Water reference shape differs from the CSI grid, left uncombined");
                        None
                    }
                    None => None,
                };
                let mut voxels = Vec::with_capacity(grid.voxels().len());
                let mut wref_out = Vec::new();
                let mut self_weighted = 0;
                for (idx, voxel) in grid.voxels().iter().enumerate() {
                    let reference = wref_voxels
                        .map(|w| &w[idx])
                        .filter(|w| w.coils() == voxel.coils())
                        .unwrap_or(voxel);
                    let weights = CoilWeights::estimate(reference);
                    voxels.push(weights.apply(voxel)?);
                    if let Some(w) = wref_voxels {
                        if w[idx].coils() == voxel.coils() {
                            wref_out.push(weights.apply(&w[idx])?);
                        } else {
                            wref_out.push(combine_with_own_weights(&w[idx])?);
                            self_weighted += 1;
                        }
                    }
                }
                if self_weighted > 0 {
                    outcome.warn(format!(
                        "{} water reference voxel(s) combined with their own coil weights",
                        self_weighted
                    ));
                }
                if let Some(Transients::Csi(w)) = &data.wref {
                    if wref_out.len() == grid.voxels().len() {
                        data.wref_output = Some(Transients::Csi(w.with_voxels(wref_out)?));
                    }
                }
                Transients::Csi(grid.with_voxels(voxels)?)
            }
        };

        log::info!("Coil combination: {}", output.describe());
        outcome.baseline = Some(output.clone());
        data.output = Some(output);
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
    use crate::data::spectrum::AVERAGES_PER_REPETITION;
    use approx::assert_abs_diff_eq;

    fn sensitivities() -> Vec<Complex64> {
        vec![
            Complex64::from_polar(1.0, 0.3),
            Complex64::from_polar(0.5, -1.2),
            Complex64::from_polar(0.8, 2.0),
            Complex64::from_polar(0.2, 0.7),
        ]
    }

    fn multi_coil(fid: &Spectrum, csm: &[Complex64]) -> Spectrum {
        let data = csm
            .iter()
            .flat_map(|c| fid.samples().iter().map(move |v| v * c))
            .collect();
        Spectrum::multi_coil(data, csm.len(), fid.dt(), fid.f0())
            .unwrap()
            .with_te(fid.te())
    }

    #[test]
    fn test_combination_recovers_signal() {
        let fid = synthetic_fid(128, 0.001, 12.0, 0.05);
        let csm = sensitivities();
        let norm: f64 = csm.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
        let input = Transients::Svs(vec![multi_coil(&fid, &csm); 2]);
        let mut bag = DataBag::new(input, None, Header::default());

        let mut step = CoilCombination::default();
        let outcome = step.process(&mut bag).unwrap();
        assert!(outcome.baseline.is_some());

        let out = bag.output.unwrap();
        assert_eq!(out.len(), 2);
        let combined = out.first().unwrap();
        assert_eq!(combined.coils(), 1);
        assert_eq!(combined.te(), fid.te());
        for (a, b) in combined.samples().iter().zip(fid.samples()) {
            assert_abs_diff_eq!(a.re, b.re * norm, epsilon = 1e-9);
            assert_abs_diff_eq!(a.im, b.im * norm, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_single_channel_is_pass_through() {
        let fid = synthetic_fid(64, 0.001, 0.0, 0.1);
        let input = Transients::Svs(vec![fid]);
        let mut bag = DataBag::new(input.clone(), None, Header::default());
        let outcome = CoilCombination::default().process(&mut bag).unwrap();
        assert_eq!(bag.output.unwrap(), input);
        assert!(outcome.baseline.is_none());
    }

    #[test]
    fn test_shots_from_metadata() {
        let fid = synthetic_fid(64, 0.001, 0.0, 0.1);
        let rep = multi_coil(&fid, &sensitivities())
            .with_metadata(AVERAGES_PER_REPETITION, serde_json::json!(2));
        let wref = Transients::Svs(vec![rep.clone(); 2]);
        let mut bag = DataBag::new(Transients::Svs(vec![rep; 4]), Some(wref), Header::default());
        CoilCombination::default().process(&mut bag).unwrap();
        assert_eq!(bag.output.unwrap().len(), 2);
        assert_eq!(bag.wref_output.unwrap().len(), 1);
    }

    #[test]
    fn test_mismatched_wref_is_combined_on_its_own() {
        let fid = synthetic_fid(64, 0.001, 0.0, 0.1);
        let csm = sensitivities();
        let data = Transients::Svs(vec![multi_coil(&fid, &csm); 2]);
        let wref = Transients::Svs(vec![multi_coil(&synthetic_fid(64, 0.001, 0.0, 0.2), &csm[..2])]);
        let mut bag = DataBag::new(data, Some(wref), Header::default());

        let outcome = CoilCombination::default().process(&mut bag).unwrap();
        assert!(outcome.is_degraded());
        assert!(outcome
            .warnings
            .iter()
            .any(|w| w.contains("own coil weights")));
        let combined = bag.wref_output.unwrap();
        assert_eq!(combined.len(), 1);
        assert_eq!(combined.first().unwrap().coils(), 1);
        assert_eq!(bag.output.unwrap().first().unwrap().coils(), 1);
    }

    #[test]
    fn test_block_average_partial_group() {
        let fid = synthetic_fid(16, 0.001, 0.0, 0.1);
        let out = block_average(&vec![fid; 5], 2).unwrap();
        assert_eq!(out.len(), 3);
    }
}
