/// Apodization windows
///
/// Both windows are parameterised by a linewidth-equivalent factor in Hz,
/// so a factor of 5 broadens a line by roughly 5 Hz either way.

use std::f64::consts::PI;

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Available window functions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WindowFunction {
    /// `exp(-t·π·lb)`
    Lorentzian { lb_hz: f64 },
    /// `exp(-(t·π·lb / (2·sqrt(ln 2)))²)`
    Gaussian { lb_hz: f64 },
    /// No apodization
    None,
}

impl std::fmt::Display for WindowFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowFunction::Lorentzian { lb_hz } => write!(f, "Lorentzian (LB={:.2} Hz)", lb_hz),
            WindowFunction::Gaussian { lb_hz } => write!(f, "Gaussian (LB={:.2} Hz)", lb_hz),
            WindowFunction::None => write!(f, "None"),
        }
    }
}

impl WindowFunction {
    /// Build a window from a choice label ("lorentzian" / "gaussian")
    pub fn from_label(label: &str, lb_hz: f64) -> Self {
        if lb_hz == 0.0 {
            return WindowFunction::None;
        }
        match label.to_ascii_lowercase().as_str() {
            "gaussian" => WindowFunction::Gaussian { lb_hz },
            _ => WindowFunction::Lorentzian { lb_hz },
        }
    }

    /// Window weight at time `t` (seconds)
    pub fn weight(&self, t: f64) -> f64 {
        match *self {
            WindowFunction::Lorentzian { lb_hz } => (-t * PI * lb_hz).exp(),
            WindowFunction::Gaussian { lb_hz } => {
                let arg = t * PI * lb_hz / (2.0 * std::f64::consts::LN_2.sqrt());
                (-arg * arg).exp()
            }
            WindowFunction::None => 1.0,
        }
    }

    /// Window sampled on `n` points spaced `dt` apart
    pub fn samples(&self, n: usize, dt: f64) -> Vec<f64> {
        (0..n).map(|i| self.weight(i as f64 * dt)).collect()
    }

    /// Multiply an FID by the window. Returns the input unchanged for `None`.
    pub fn apply(&self, fid: &[Complex64], dt: f64) -> Vec<Complex64> {
        if *self == WindowFunction::None {
            return fid.to_vec();
        }
        fid.iter()
            .enumerate()
            .map(|(i, v)| v * self.weight(i as f64 * dt))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_lorentzian_weight() {
        let w = WindowFunction::Lorentzian { lb_hz: 2.0 };
        assert_abs_diff_eq!(w.weight(0.0), 1.0);
        assert_abs_diff_eq!(w.weight(0.5), (-PI).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_gaussian_weight() {
        let w = WindowFunction::Gaussian { lb_hz: 4.0 };
        let t = 0.1;
        let expected = (-(t * PI * 4.0 / (2.0 * std::f64::consts::LN_2.sqrt())).powi(2)).exp();
        assert_abs_diff_eq!(w.weight(t), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_factor_is_identity() {
        assert_eq!(WindowFunction::from_label("gaussian", 0.0), WindowFunction::None);
        let fid = vec![Complex64::new(1.0, 2.0); 4];
        assert_eq!(WindowFunction::None.apply(&fid, 0.001), fid);
    }
}
