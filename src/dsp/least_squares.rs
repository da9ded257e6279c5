/// Small dense least-squares solvers
///
/// The alignment and quality steps only ever fit a handful of parameters,
/// so a Levenberg–Marquardt loop over a finite-difference Jacobian and a
/// dense normal-equation solve is all that is needed.

/// Options for [`levenberg_marquardt`]
#[derive(Debug, Clone)]
pub struct LeastSquaresOptions {
    pub max_iterations: usize,
    /// Stop when the relative cost reduction of an accepted step falls below this
    pub ftol: f64,
    /// Stop when the relative step length falls below this
    pub xtol: f64,
    pub initial_lambda: f64,
}

impl Default for LeastSquaresOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            ftol: 1e-12,
            xtol: 1e-12,
            initial_lambda: 1e-3,
        }
    }
}

/// Outcome of a least-squares fit
#[derive(Debug, Clone)]
pub struct LeastSquaresFit {
    pub params: Vec<f64>,
    /// Half the sum of squared residuals at `params`
    pub cost: f64,
    pub iterations: usize,
    pub converged: bool,
}

const MAX_LAMBDA: f64 = 1e16;

fn half_sum_squares(r: &[f64]) -> f64 {
    0.5 * r.iter().map(|v| v * v).sum::<f64>()
}

/// Minimise `0.5 * |residual(x)|²` starting from `initial`.
///
/// Non-finite residuals are treated as rejected steps; a fit whose starting
/// point is already non-finite returns immediately with `converged = false`.
pub fn levenberg_marquardt<F>(
    mut residual: F,
    initial: &[f64],
    options: &LeastSquaresOptions,
) -> LeastSquaresFit
where
    F: FnMut(&[f64]) -> Vec<f64>,
{
    let p = initial.len();
    let mut x = initial.to_vec();
    let mut r = residual(&x);
    let mut cost = half_sum_squares(&r);

    if !cost.is_finite() || p == 0 {
        return LeastSquaresFit {
            params: x,
            cost,
            iterations: 0,
            converged: p == 0 && cost.is_finite(),
        };
    }

    let mut lambda = options.initial_lambda;
    let mut iterations = 0;
    let mut converged = false;

    while iterations < options.max_iterations {
        iterations += 1;
        if cost <= f64::MIN_POSITIVE {
            converged = true;
            break;
        }

        // forward-difference Jacobian, one column per parameter
        let m = r.len();
        let mut jac = vec![0.0; m * p];
        for j in 0..p {
            let h = 1e-7 * x[j].abs().max(1.0);
            let mut xh = x.clone();
            xh[j] += h;
            let rh = residual(&xh);
            for i in 0..m.min(rh.len()) {
                jac[i * p + j] = (rh[i] - r[i]) / h;
            }
        }

        let mut jtj = vec![0.0; p * p];
        let mut jtr = vec![0.0; p];
        for i in 0..m {
            for a in 0..p {
                let ja = jac[i * p + a];
                jtr[a] += ja * r[i];
                for b in 0..p {
                    jtj[a * p + b] += ja * jac[i * p + b];
                }
            }
        }

        let gradient_norm = jtr.iter().map(|g| g.abs()).fold(0.0, f64::max);
        if gradient_norm <= 1e-15 * cost.max(1.0) {
            converged = true;
            break;
        }

        let mut accepted = false;
        while lambda < MAX_LAMBDA {
            let mut a = jtj.clone();
            for d in 0..p {
                a[d * p + d] += lambda * jtj[d * p + d].max(1e-12);
            }
            let mut b: Vec<f64> = jtr.iter().map(|g| -g).collect();
            let delta = solve_linear_system(&mut a, &mut b, p);
            let candidate: Vec<f64> = x.iter().zip(&delta).map(|(xi, di)| xi + di).collect();
            let r_new = residual(&candidate);
            let cost_new = half_sum_squares(&r_new);

            if cost_new.is_finite() && cost_new < cost {
                let reduction = (cost - cost_new) / cost;
                let step = delta.iter().map(|d| d * d).sum::<f64>().sqrt();
                let size = x.iter().map(|v| v * v).sum::<f64>().sqrt();
                x = candidate;
                r = r_new;
                cost = cost_new;
                lambda = (lambda / 10.0).max(1e-15);
                accepted = true;
                if reduction < options.ftol || step < options.xtol * (size + options.xtol) {
                    converged = true;
                }
                break;
            }
            lambda *= 10.0;
        }

        if !accepted {
            // no downhill step left: sitting in a minimum
            converged = true;
            break;
        }
        if converged {
            break;
        }
    }

    log::debug!(
        "Levenberg-Marquardt: {} iterations, cost {:.3e}, converged={}",
        iterations,
        cost,
        converged
    );

    LeastSquaresFit {
        params: x,
        cost,
        iterations,
        converged,
    }
}

/// Solve Ax = b in-place via Gaussian elimination with partial pivoting.
/// Singular pivots yield a zero component rather than an error.
pub fn solve_linear_system(a: &mut [f64], b: &mut [f64], n: usize) -> Vec<f64> {
    for col in 0..n {
        let mut max_row = col;
        let mut max_val = a[col * n + col].abs();
        for row in (col + 1)..n {
            let v = a[row * n + col].abs();
            if v > max_val {
                max_val = v;
                max_row = row;
            }
        }
        if max_row != col {
            for c in 0..n {
                a.swap(col * n + c, max_row * n + c);
            }
            b.swap(col, max_row);
        }
        let pivot = a[col * n + col];
        if pivot.abs() < 1e-300 {
            continue;
        }
        for row in (col + 1)..n {
            let factor = a[row * n + col] / pivot;
            for c in col..n {
                let v = a[col * n + c];
                a[row * n + c] -= factor * v;
            }
            let bv = b[col];
            b[row] -= factor * bv;
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let pivot = a[row * n + row];
        if pivot.abs() < 1e-300 {
            continue;
        }
        let mut s = b[row];
        for c in (row + 1)..n {
            s -= a[row * n + c] * x[c];
        }
        x[row] = s / pivot;
    }
    x
}

/// Ordinary least-squares line `y = slope * x + intercept`
pub fn line_fit(xs: &[f64], ys: &[f64]) -> (f64, f64) {
    let n = xs.len().min(ys.len());
    if n == 0 {
        return (0.0, 0.0);
    }
    let mx = xs[..n].iter().sum::<f64>() / n as f64;
    let my = ys[..n].iter().sum::<f64>() / n as f64;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for i in 0..n {
        sxy += (xs[i] - mx) * (ys[i] - my);
        sxx += (xs[i] - mx).powi(2);
    }
    if sxx <= 0.0 {
        return (0.0, my);
    }
    let slope = sxy / sxx;
    (slope, my - slope * mx)
}

/// Gaussian peak `amplitude * exp(-(x - center)² / (2σ²)) + offset`
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GaussianFit {
    pub amplitude: f64,
    pub center: f64,
    pub sigma: f64,
    pub offset: f64,
    pub converged: bool,
}

impl GaussianFit {
    /// Full width at half maximum, in the units of `x`
    pub fn fwhm(&self) -> f64 {
        2.0 * (2.0 * std::f64::consts::LN_2).sqrt() * self.sigma.abs()
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        let sigma = self.sigma.abs().max(f64::MIN_POSITIVE);
        self.amplitude * (-(x - self.center).powi(2) / (2.0 * sigma * sigma)).exp() + self.offset
    }
}

/// Fit a single Gaussian peak to `(xs, ys)`. Returns `None` for fewer than
/// four points or a flat profile.
pub fn fit_gaussian(xs: &[f64], ys: &[f64]) -> Option<GaussianFit> {
    let n = xs.len().min(ys.len());
    if n < 4 {
        return None;
    }
    let (imax, ymax) = ys[..n]
        .iter()
        .cloned()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best });
    let ymin = ys[..n].iter().cloned().fold(f64::INFINITY, f64::min);
    if !(ymax > ymin) {
        return None;
    }

    // half-maximum crossing gives the starting width
    let half = ymin + 0.5 * (ymax - ymin);
    let mut lo = imax;
    while lo > 0 && ys[lo] > half {
        lo -= 1;
    }
    let mut hi = imax;
    while hi + 1 < n && ys[hi] > half {
        hi += 1;
    }
    let width = (xs[hi] - xs[lo]).abs().max((xs[1] - xs[0]).abs());
    let sigma0 = width / (2.0 * (2.0 * std::f64::consts::LN_2).sqrt());

    let initial = [ymax - ymin, xs[imax], sigma0, ymin];
    let fit = levenberg_marquardt(
        |p| {
            let model = GaussianFit {
                amplitude: p[0],
                center: p[1],
                sigma: p[2],
                offset: p[3],
                converged: false,
            };
            (0..n).map(|i| model.evaluate(xs[i]) - ys[i]).collect()
        },
        &initial,
        &LeastSquaresOptions::default(),
    );

    Some(GaussianFit {
        amplitude: fit.params[0],
        center: fit.params[1],
        sigma: fit.params[2].abs(),
        offset: fit.params[3],
        converged: fit.converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_lm_fits_exponential() {
        let xs: Vec<f64> = (0..40).map(|i| i as f64 * 0.1).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 2.5 * (-0.7 * x).exp()).collect();
        let fit = levenberg_marquardt(
            |p| xs.iter().zip(&ys).map(|(x, y)| p[0] * (-p[1] * x).exp() - y).collect(),
            &[1.0, 0.2],
            &LeastSquaresOptions::default(),
        );
        assert!(fit.converged);
        assert_abs_diff_eq!(fit.params[0], 2.5, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.params[1], 0.7, epsilon = 1e-6);
    }

    #[test]
    fn test_lm_zero_residual_returns_immediately() {
        let fit = levenberg_marquardt(|p| vec![p[0] - 1.0], &[1.0], &LeastSquaresOptions::default());
        assert!(fit.converged);
        assert_eq!(fit.params, vec![1.0]);
        assert_eq!(fit.iterations, 1);
    }

    #[test]
    fn test_line_fit() {
        let xs = [0.0, 1.0, 2.0, 3.0];
        let ys = [1.0, 3.0, 5.0, 7.0];
        let (slope, intercept) = line_fit(&xs, &ys);
        assert_abs_diff_eq!(slope, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(intercept, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_gaussian_fit_recovers_width() {
        let truth = GaussianFit {
            amplitude: 10.0,
            center: 4.7,
            sigma: 0.05,
            offset: 0.3,
            converged: true,
        };
        let xs: Vec<f64> = (0..200).map(|i| 4.2 + i as f64 * 0.005).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| truth.evaluate(x)).collect();
        let fit = fit_gaussian(&xs, &ys).unwrap();
        assert_abs_diff_eq!(fit.center, 4.7, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.fwhm(), truth.fwhm(), epsilon = 1e-6);
    }

    #[test]
    fn test_gaussian_fit_rejects_flat() {
        assert!(fit_gaussian(&[0.0, 1.0, 2.0, 3.0], &[1.0; 4]).is_none());
    }
}
