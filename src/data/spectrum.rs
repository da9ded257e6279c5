use std::collections::BTreeMap;
use std::f64::consts::PI;

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dsp;

/// Default chemical-shift reference for ¹H (water at 4.7 ppm)
pub const DEFAULT_PPM0: f64 = 4.7;

/// Metadata key carrying the number of averages folded into one repetition
pub const AVERAGES_PER_REPETITION: &str = "averages_per_repetition";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpectrumError {
    #[error("Spectrum has no samples")]
    Empty,
    #[error("{len} samples cannot be split across {coils} coils")]
    CoilMismatch { len: usize, coils: usize },
    #[error("Sample count mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },
}

/// One FID acquisition (or a derived signal) with its scan metadata.
///
/// Samples are time-domain. Multi-coil data is stored coil-major: coil `c`
/// occupies `data[c * np .. (c + 1) * np]`. Every transform returns a new
/// value; the receiver is never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    data: Vec<Complex64>,
    coils: usize,
    /// Dwell time (s)
    dt: f64,
    /// Centre frequency (MHz)
    f0: f64,
    /// Echo time (ms)
    te: f64,
    /// Repetition time (ms)
    tr: Option<f64>,
    /// Chemical shift of 0 Hz (ppm)
    ppm0: f64,
    /// Voxel-to-scanner affine
    transform: Option<[[f64; 4]; 4]>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

impl Spectrum {
    /// Single-channel spectrum. Fails on empty data.
    pub fn new(data: Vec<Complex64>, dt: f64, f0: f64) -> Result<Self, SpectrumError> {
        if data.is_empty() {
            return Err(SpectrumError::Empty);
        }
        Ok(Self {
            data,
            coils: 1,
            dt,
            f0,
            te: 0.0,
            tr: None,
            ppm0: DEFAULT_PPM0,
            transform: None,
            metadata: BTreeMap::new(),
        })
    }

    /// Multi-coil spectrum from coil-major samples.
    pub fn multi_coil(
        data: Vec<Complex64>,
        coils: usize,
        dt: f64,
        f0: f64,
    ) -> Result<Self, SpectrumError> {
        let mut s = Self::new(data, dt, f0)?;
        s.check_coils(s.data.len(), coils)?;
        s.coils = coils;
        Ok(s)
    }

    pub fn with_te(mut self, te_ms: f64) -> Self {
        self.te = te_ms;
        self
    }

    pub fn with_tr(mut self, tr_ms: f64) -> Self {
        self.tr = Some(tr_ms);
        self
    }

    pub fn with_ppm0(mut self, ppm0: f64) -> Self {
        self.ppm0 = ppm0;
        self
    }

    pub fn with_transform(mut self, transform: [[f64; 4]; 4]) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Re-check the invariants of a deserialized value
    pub fn validate(&self) -> Result<(), SpectrumError> {
        self.check_coils(self.data.len(), self.coils)
    }

    fn check_coils(&self, len: usize, coils: usize) -> Result<(), SpectrumError> {
        if len == 0 {
            return Err(SpectrumError::Empty);
        }
        if coils == 0 || len % coils != 0 {
            return Err(SpectrumError::CoilMismatch { len, coils });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    //  Accessors
    // ---------------------------------------------------------------------

    /// All samples, coil-major
    pub fn samples(&self) -> &[Complex64] {
        &self.data
    }

    /// Samples of one coil
    pub fn coil(&self, index: usize) -> &[Complex64] {
        let np = self.np();
        &self.data[index * np..(index + 1) * np]
    }

    pub fn coils(&self) -> usize {
        self.coils
    }

    pub fn is_multi_coil(&self) -> bool {
        self.coils > 1
    }

    /// Points per coil
    pub fn np(&self) -> usize {
        self.data.len() / self.coils.max(1)
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn f0(&self) -> f64 {
        self.f0
    }

    pub fn te(&self) -> f64 {
        self.te
    }

    pub fn tr(&self) -> Option<f64> {
        self.tr
    }

    pub fn ppm0(&self) -> f64 {
        self.ppm0
    }

    pub fn transform(&self) -> Option<&[[f64; 4]; 4]> {
        self.transform.as_ref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    /// Averages folded into each repetition, from the scanner header
    pub fn averages_per_repetition(&self) -> Option<usize> {
        self.metadata
            .get(AVERAGES_PER_REPETITION)
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
    }

    // ---------------------------------------------------------------------
    //  Axes
    // ---------------------------------------------------------------------

    pub fn time_axis(&self) -> Vec<f64> {
        (0..self.np()).map(|i| i as f64 * self.dt).collect()
    }

    /// FFT-shifted frequency axis (Hz)
    pub fn frequency_axis(&self) -> Vec<f64> {
        dsp::frequency_axis(self.np(), self.dt)
    }

    pub fn frequency_axis_ppm(&self) -> Vec<f64> {
        self.frequency_axis()
            .into_iter()
            .map(|f| self.hertz_to_ppm(f))
            .collect()
    }

    pub fn hertz_to_ppm(&self, hz: f64) -> f64 {
        self.ppm0 - hz / self.f0
    }

    pub fn ppm_to_hertz(&self, ppm: f64) -> f64 {
        (self.ppm0 - ppm) * self.f0
    }

    /// Frequency-domain data, FFT-shifted, per coil
    pub fn spectrum(&self) -> Vec<Complex64> {
        let transform = dsp::SpectralTransform::new(self.np());
        self.data
            .chunks(self.np())
            .flat_map(|coil| transform.spectrum(coil))
            .collect()
    }

    // ---------------------------------------------------------------------
    //  Transforms (all return new values)
    // ---------------------------------------------------------------------

    /// Replace the samples, keeping every piece of scan metadata.
    ///
    /// The new sample count must still split evenly across the coils.
    pub fn inherit(&self, samples: Vec<Complex64>) -> Result<Spectrum, SpectrumError> {
        self.check_coils(samples.len(), self.coils)?;
        Ok(Spectrum {
            data: samples,
            ..self.clone_metadata()
        })
    }

    /// Like [`Spectrum::inherit`] but the result is single-channel
    pub fn inherit_combined(&self, samples: Vec<Complex64>) -> Result<Spectrum, SpectrumError> {
        if samples.is_empty() {
            return Err(SpectrumError::Empty);
        }
        Ok(Spectrum {
            data: samples,
            coils: 1,
            ..self.clone_metadata()
        })
    }

    fn clone_metadata(&self) -> Spectrum {
        Spectrum {
            data: Vec::new(),
            coils: self.coils,
            dt: self.dt,
            f0: self.f0,
            te: self.te,
            tr: self.tr,
            ppm0: self.ppm0,
            transform: self.transform,
            metadata: self.metadata.clone(),
        }
    }

    /// Shift every line by `shift_hz` (time-domain complex exponential ramp)
    pub fn adjust_frequency(&self, shift_hz: f64) -> Spectrum {
        let np = self.np();
        let data = self
            .data
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let t = (i % np) as f64 * self.dt;
                v * Complex64::from_polar(1.0, 2.0 * PI * shift_hz * t)
            })
            .collect();
        Spectrum {
            data,
            ..self.clone_metadata()
        }
    }

    /// Zero- and first-order phase correction about 0 Hz
    pub fn adjust_phase(&self, zero_order: f64, first_order: f64) -> Spectrum {
        self.adjust_phase_about(zero_order, first_order, 0.0)
    }

    /// Multiply the spectrum by `exp(i(φ0 + φ1·(f − fixed_frequency)))`
    pub fn adjust_phase_about(
        &self,
        zero_order: f64,
        first_order: f64,
        fixed_frequency: f64,
    ) -> Spectrum {
        if first_order == 0.0 {
            let rotation = Complex64::from_polar(1.0, zero_order);
            return Spectrum {
                data: self.data.iter().map(|v| v * rotation).collect(),
                ..self.clone_metadata()
            };
        }
        let np = self.np();
        let transform = dsp::SpectralTransform::new(np);
        let freqs = self.frequency_axis();
        let data = self
            .data
            .chunks(np)
            .flat_map(|coil| {
                let spec: Vec<Complex64> = transform
                    .spectrum(coil)
                    .iter()
                    .zip(&freqs)
                    .map(|(v, f)| {
                        v * Complex64::from_polar(
                            1.0,
                            zero_order + first_order * (f - fixed_frequency),
                        )
                    })
                    .collect();
                transform.fid(&spec)
            })
            .collect();
        Spectrum {
            data,
            ..self.clone_metadata()
        }
    }

    /// Append `factor × np` zeros to every coil
    pub fn zero_pad(&self, factor: usize) -> Spectrum {
        if factor == 0 {
            return self.clone();
        }
        let np = self.np();
        let data = self
            .data
            .chunks(np)
            .flat_map(|coil| {
                coil.iter()
                    .cloned()
                    .chain(std::iter::repeat(Complex64::new(0.0, 0.0)).take(factor * np))
            })
            .collect();
        Spectrum {
            data,
            ..self.clone_metadata()
        }
    }

    /// Element-wise mean of several spectra, metadata from the first
    pub fn mean(spectra: &[Spectrum]) -> Result<Spectrum, SpectrumError> {
        let first = spectra.first().ok_or(SpectrumError::Empty)?;
        if spectra.len() == 1 {
            return Ok(first.clone());
        }
        let weights = vec![1.0; spectra.len()];
        Spectrum::weighted_mean(spectra, &weights)
    }

    /// `Σ wᵢ·sᵢ / Σ wᵢ`, metadata from the first
    pub fn weighted_mean(spectra: &[Spectrum], weights: &[f64]) -> Result<Spectrum, SpectrumError> {
        let first = spectra.first().ok_or(SpectrumError::Empty)?;
        let len = first.data.len();
        let mut acc = vec![Complex64::new(0.0, 0.0); len];
        let mut total = 0.0;
        for (s, &w) in spectra.iter().zip(weights) {
            if s.data.len() != len {
                return Err(SpectrumError::LengthMismatch {
                    expected: len,
                    got: s.data.len(),
                });
            }
            for (a, v) in acc.iter_mut().zip(&s.data) {
                *a += v * w;
            }
            total += w;
        }
        let scale = if total != 0.0 { 1.0 / total } else { 0.0 };
        first.inherit(acc.into_iter().map(|v| v * scale).collect())
    }
}
