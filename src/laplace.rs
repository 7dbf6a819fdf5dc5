//! Local-approximation (Laplace-type) optimizer: finds a mode of a
//! log-density and a Gaussian approximation around it.

use anyhow::{bail, Context, Result};
use faer::Mat;
use rand_chacha::ChaCha8Rng;

use crate::density::LogpFunc;
use crate::math::{multivariate_normal_draws, sym_inverse_psd};

#[derive(Clone, Copy, Debug)]
pub struct LaplaceOptions {
    /// Maximum number of ascent iterations.
    pub max_iter: usize,
    /// Stop once the gradient infinity-norm falls below this.
    pub grad_tol: f64,
    /// Number of Gaussian samples drawn around the mode.
    pub n_sample: usize,
    /// Finite-difference step for gradients and the Hessian.
    pub fd_step: f64,
}

impl Default for LaplaceOptions {
    fn default() -> Self {
        Self {
            max_iter: 500,
            grad_tol: 1e-6,
            n_sample: 1000,
            fd_step: 1e-5,
        }
    }
}

/// Mode, value, local covariance and Gaussian samples, all in
/// transformed coordinates.
#[derive(Clone, Debug)]
pub struct LaplaceResult {
    pub x_max: Vec<f64>,
    pub f_max: f64,
    pub cov: Mat<f64>,
    pub samples: Vec<Vec<f64>>,
}

pub struct Laplace {
    options: LaplaceOptions,
}

impl Laplace {
    pub fn new(options: LaplaceOptions) -> Self {
        Self { options }
    }

    /// Gradient ascent with backtracking line search, then a
    /// finite-difference Hessian at the mode. The covariance is the
    /// (eigenvalue-floored) inverse of the negative Hessian.
    pub fn run(
        &self,
        f: &dyn LogpFunc,
        x_0: &[f64],
        rng: &mut ChaCha8Rng,
    ) -> Result<LaplaceResult> {
        let opts = &self.options;
        let mut x = x_0.to_vec();
        let mut fx = f.logp(&x)?;
        if !fx.is_finite() {
            bail!("log density is not finite at the optimizer starting point");
        }

        for _ in 0..opts.max_iter {
            let grad = self.gradient(f, &x)?;
            let gnorm = grad.iter().fold(0f64, |acc, g| acc.max(g.abs()));
            if gnorm < opts.grad_tol {
                break;
            }
            let mut alpha = 1.0 / gnorm.max(1.0);
            let mut improved = false;
            for _ in 0..40 {
                let candidate: Vec<f64> =
                    x.iter().zip(grad.iter()).map(|(xi, g)| xi + alpha * g).collect();
                let fc = f.logp(&candidate)?;
                if fc.is_finite() && fc > fx {
                    x = candidate;
                    fx = fc;
                    improved = true;
                    break;
                }
                alpha *= 0.5;
            }
            if !improved {
                break;
            }
        }

        let hessian = self.hessian(f, &x)?;
        let neg_hessian = -(&hessian);
        let cov = sym_inverse_psd(&neg_hessian)
            .context("Could not invert the Hessian at the mode")?;
        let samples = multivariate_normal_draws(&x, &cov, opts.n_sample, rng)
            .context("Could not factor the local covariance")?;

        Ok(LaplaceResult {
            x_max: x,
            f_max: fx,
            cov,
            samples,
        })
    }

    fn gradient(&self, f: &dyn LogpFunc, x: &[f64]) -> Result<Vec<f64>> {
        if let Some(grad) = f.grad(x) {
            return Ok(grad);
        }
        let h = self.options.fd_step;
        let mut grad = vec![0f64; x.len()];
        let mut probe = x.to_vec();
        for i in 0..x.len() {
            probe[i] = x[i] + h;
            let plus = f.logp(&probe)?;
            probe[i] = x[i] - h;
            let minus = f.logp(&probe)?;
            probe[i] = x[i];
            grad[i] = (plus - minus) / (2.0 * h);
        }
        Ok(grad)
    }

    /// Central-difference Hessian from gradient evaluations, symmetrized.
    fn hessian(&self, f: &dyn LogpFunc, x: &[f64]) -> Result<Mat<f64>> {
        let dim = x.len();
        let h = self.options.fd_step.sqrt();
        let mut columns: Vec<Vec<f64>> = Vec::with_capacity(dim);
        let mut probe = x.to_vec();
        for i in 0..dim {
            probe[i] = x[i] + h;
            let plus = self.gradient(f, &probe)?;
            probe[i] = x[i] - h;
            let minus = self.gradient(f, &probe)?;
            probe[i] = x[i];
            columns.push(
                plus.iter()
                    .zip(minus.iter())
                    .map(|(p, m)| (p - m) / (2.0 * h))
                    .collect(),
            );
        }
        Ok(Mat::from_fn(dim, dim, |r, c| {
            0.5 * (columns[c][r] + columns[r][c])
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    struct Quadratic {
        mu: Vec<f64>,
    }

    impl LogpFunc for Quadratic {
        fn dim(&self) -> usize {
            self.mu.len()
        }

        fn logp(&self, x: &[f64]) -> Result<f64> {
            Ok(self
                .mu
                .iter()
                .zip(x.iter())
                .map(|(m, xi)| -0.5 * (xi - m) * (xi - m))
                .sum())
        }

        fn grad(&self, x: &[f64]) -> Option<Vec<f64>> {
            Some(self.mu.iter().zip(x.iter()).map(|(m, xi)| m - xi).collect())
        }
    }

    #[test]
    fn finds_the_gaussian_mode() {
        let f = Quadratic {
            mu: vec![1.5, -0.5],
        };
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let result = Laplace::new(LaplaceOptions::default())
            .run(&f, &[4.0, 4.0], &mut rng)
            .unwrap();
        assert_abs_diff_eq!(result.x_max[0], 1.5, epsilon = 1e-4);
        assert_abs_diff_eq!(result.x_max[1], -0.5, epsilon = 1e-4);
        assert_abs_diff_eq!(result.f_max, 0.0, epsilon = 1e-8);
        // unit covariance at the mode
        let var = *result.cov.col(0).iter().next().unwrap();
        assert_abs_diff_eq!(var, 1.0, epsilon = 1e-3);
        assert_eq!(result.samples.len(), 1000);
    }

    #[test]
    fn rejects_non_finite_start() {
        struct Bad;
        impl LogpFunc for Bad {
            fn dim(&self) -> usize {
                1
            }
            fn logp(&self, _x: &[f64]) -> Result<f64> {
                Ok(f64::NEG_INFINITY)
            }
        }
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(Laplace::new(LaplaceOptions::default())
            .run(&Bad, &[0.0], &mut rng)
            .is_err());
    }
}
