/// Numerical building blocks shared by the processing steps
///
/// FFT conventions follow the usual MRS tooling: `fft` is unnormalised,
/// `ifft` divides by N, and spectra are stored FFT-shifted so that 0 Hz
/// sits at index N/2.

pub mod least_squares;
pub mod window;

use std::f64::consts::PI;
use std::sync::Arc;

use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};

// =========================================================================
//  Fourier transforms
// =========================================================================

/// Cached forward/inverse plans for one transform length.
///
/// The least-squares residuals call the transform hundreds of times for the
/// same length, so the plans are built once per fit.
pub struct SpectralTransform {
    len: usize,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl SpectralTransform {
    pub fn new(len: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            len,
            forward: planner.plan_fft_forward(len),
            inverse: planner.plan_fft_inverse(len),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Time domain → FFT-shifted spectrum
    pub fn spectrum(&self, fid: &[Complex64]) -> Vec<Complex64> {
        let mut buffer = fid.to_vec();
        self.forward.process(&mut buffer);
        fftshift(&buffer)
    }

    /// FFT-shifted spectrum → time domain (normalised by 1/N)
    pub fn fid(&self, spectrum: &[Complex64]) -> Vec<Complex64> {
        let mut buffer = ifftshift(spectrum);
        self.inverse.process(&mut buffer);
        let scale = 1.0 / self.len.max(1) as f64;
        for v in buffer.iter_mut() {
            *v *= scale;
        }
        buffer
    }
}

/// Unnormalised forward FFT
pub fn fft(data: &[Complex64]) -> Vec<Complex64> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut buffer = data.to_vec();
    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(buffer.len()).process(&mut buffer);
    buffer
}

/// Inverse FFT normalised by 1/N
pub fn ifft(data: &[Complex64]) -> Vec<Complex64> {
    if data.is_empty() {
        return Vec::new();
    }
    let n = data.len();
    let mut buffer = data.to_vec();
    let mut planner = FftPlanner::new();
    planner.plan_fft_inverse(n).process(&mut buffer);
    let scale = 1.0 / n as f64;
    for v in buffer.iter_mut() {
        *v *= scale;
    }
    buffer
}

/// Move the zero-frequency bin to the centre (index N/2)
pub fn fftshift<T: Clone>(data: &[T]) -> Vec<T> {
    let n = data.len();
    let half = n / 2;
    (0..n).map(|i| data[(i + n - half) % n].clone()).collect()
}

/// Inverse of [`fftshift`]
pub fn ifftshift<T: Clone>(data: &[T]) -> Vec<T> {
    let n = data.len();
    let half = n / 2;
    (0..n).map(|i| data[(i + half) % n].clone()).collect()
}

/// FFT-shifted frequency axis in Hz for `n` points sampled every `dt` seconds
pub fn frequency_axis(n: usize, dt: f64) -> Vec<f64> {
    if n == 0 || dt <= 0.0 {
        return Vec::new();
    }
    let span = n as f64 * dt;
    let half = (n / 2) as f64;
    (0..n).map(|k| (k as f64 - half) / span).collect()
}

// =========================================================================
//  Phase handling
// =========================================================================

/// Remove 2π discontinuities from a phase trajectory
pub fn unwrap_phase(phases: &[f64]) -> Vec<f64> {
    if phases.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(phases.len());
    out.push(phases[0]);
    for i in 1..phases.len() {
        let mut d = phases[i] - phases[i - 1];
        while d > PI {
            d -= 2.0 * PI;
        }
        while d < -PI {
            d += 2.0 * PI;
        }
        out.push(out[i - 1] + d);
    }
    out
}

/// Wrap an angle into (-π, π]
pub fn wrap_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a > PI {
        a -= 2.0 * PI;
    } else if a <= -PI {
        a += 2.0 * PI;
    }
    a
}

// =========================================================================
//  Smoothing
// =========================================================================

/// `exp(-x²)` sampled at `width` points over [-3, 3], normalised to sum 1.
pub fn gaussian_kernel(width: usize) -> Vec<f64> {
    if width <= 1 {
        return vec![1.0];
    }
    let step = 6.0 / (width - 1) as f64;
    let raw: Vec<f64> = (0..width)
        .map(|i| {
            let x = -3.0 + i as f64 * step;
            (-x * x).exp()
        })
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.into_iter().map(|v| v / sum).collect()
}

/// Discrete convolution returning the central `signal.len()` samples.
///
/// Samples outside the signal are treated as zero, so the first and last
/// `kernel.len() / 2` outputs carry the usual edge roll-off.
pub fn convolve_same(signal: &[f64], kernel: &[f64]) -> Vec<f64> {
    let n = signal.len();
    let m = kernel.len();
    if n == 0 || m == 0 {
        return signal.to_vec();
    }
    let start = (m - 1) / 2;
    (0..n)
        .map(|i| {
            // full-convolution index i + start
            let full = i + start;
            let mut acc = 0.0;
            for (j, &k) in kernel.iter().enumerate() {
                if full >= j && full - j < n {
                    acc += signal[full - j] * k;
                }
            }
            acc
        })
        .collect()
}

// =========================================================================
//  Statistics
// =========================================================================

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Standard deviation of complex samples: sqrt(mean(|x - mean(x)|²))
pub fn complex_std(values: &[Complex64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m: Complex64 = values.iter().sum::<Complex64>() / values.len() as f64;
    (values.iter().map(|v| (v - m).norm_sqr()).sum::<f64>() / values.len() as f64).sqrt()
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    }
}

/// `(value - mean) / std` for every value. Zero variance yields all zeros.
pub fn z_scores(values: &[f64]) -> Vec<f64> {
    let m = mean(values);
    let s = std_dev(values);
    if s <= 1e-12 * m.abs().max(f64::MIN_POSITIVE) {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v - m) / s).collect()
}

/// Index of the largest value (first one on ties)
pub fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Least-squares polynomial fit; returns the trend evaluated at `xs`.
pub fn polyfit_trend(xs: &[f64], ys: &[f64], order: usize) -> Vec<f64> {
    let n = xs.len().min(ys.len());
    if n == 0 {
        return Vec::new();
    }
    let order = order.min(n.saturating_sub(1));
    // Rescale x to [-1, 1] for conditioning
    let lo = xs[..n].iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = xs[..n].iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let span = if hi > lo { hi - lo } else { 1.0 };
    let scaled: Vec<f64> = xs[..n].iter().map(|x| 2.0 * (x - lo) / span - 1.0).collect();

    let dim = order + 1;
    let mut ata = vec![0.0; dim * dim];
    let mut aty = vec![0.0; dim];
    for i in 0..n {
        let mut xpow = vec![1.0; dim];
        for j in 1..dim {
            xpow[j] = xpow[j - 1] * scaled[i];
        }
        for r in 0..dim {
            for c in 0..dim {
                ata[r * dim + c] += xpow[r] * xpow[c];
            }
            aty[r] += xpow[r] * ys[i];
        }
    }
    let coeffs = least_squares::solve_linear_system(&mut ata, &mut aty, dim);
    scaled
        .iter()
        .map(|&x| {
            let mut val = 0.0;
            let mut xp = 1.0;
            for &c in &coeffs {
                val += c * xp;
                xp *= x;
            }
            val
        })
        .collect()
}

/// Boolean mask selecting `low < value < high` (bounds may be given in either order)
pub fn range_mask(axis: &[f64], bounds: (f64, f64)) -> Vec<bool> {
    let (lo, hi) = if bounds.0 <= bounds.1 {
        bounds
    } else {
        (bounds.1, bounds.0)
    };
    axis.iter().map(|&v| v > lo && v < hi).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_fft_roundtrip_and_shift() {
        let data: Vec<Complex64> = (0..8)
            .map(|i| Complex64::new(i as f64, -(i as f64) * 0.5))
            .collect();
        let back = ifft(&fft(&data));
        for (a, b) in data.iter().zip(back.iter()) {
            assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-12);
            assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-12);
        }
        let shifted = fftshift(&[0, 1, 2, 3, 4]);
        assert_eq!(shifted, vec![3, 4, 0, 1, 2]);
        assert_eq!(ifftshift(&shifted), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_frequency_axis_contains_zero_at_centre() {
        let axis = frequency_axis(8, 0.001);
        assert_eq!(axis[4], 0.0);
        assert_abs_diff_eq!(axis[0], -500.0, epsilon = 1e-9);
    }

    #[test]
    fn test_unwrap_removes_jumps() {
        let wrapped: Vec<f64> = (0..50).map(|i| wrap_angle(i as f64 * 0.4)).collect();
        let unwrapped = unwrap_phase(&wrapped);
        for (i, v) in unwrapped.iter().enumerate() {
            assert_abs_diff_eq!(*v, i as f64 * 0.4, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_gaussian_kernel_normalised_and_symmetric() {
        let k = gaussian_kernel(7);
        assert_abs_diff_eq!(k.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(k[0], k[6], epsilon = 1e-15);
        assert!(k[3] > k[2]);
    }

    #[test]
    fn test_convolve_same_keeps_length() {
        let signal = vec![1.0; 10];
        let out = convolve_same(&signal, &[0.25, 0.5, 0.25]);
        assert_eq!(out.len(), 10);
        assert_abs_diff_eq!(out[5], 1.0, epsilon = 1e-12);
        // zero padding outside bounds
        assert_abs_diff_eq!(out[0], 0.75, epsilon = 1e-12);
    }

    #[test]
    fn test_z_scores_zero_variance() {
        assert_eq!(z_scores(&[2.0, 2.0, 2.0]), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_polyfit_recovers_quadratic() {
        let xs: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 1.0 + 2.0 * x - 0.5 * x * x).collect();
        let trend = polyfit_trend(&xs, &ys, 2);
        for (a, b) in ys.iter().zip(trend.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
    }
}
