//! Trainable surrogate models approximating the true log-density.

use anyhow::{bail, Result};
use faer::Mat;

use crate::density::EvalRecord;
use crate::math::{matvec, sym_pseudo_inverse};

/// Capability required of every element of a step's surrogate list.
///
/// Surrogates predict the transformed-coordinate log-density and are
/// refit from batches of true evaluations as the pipeline progresses.
pub trait Surrogate: Send + Sync {
    /// Number of free parameters. Evaluation budgets are multiples of the
    /// largest `n_param` in a step's surrogate list.
    fn n_param(&self) -> usize;

    /// Fit the surrogate on true-density evaluation records.
    fn fit(&mut self, records: &[EvalRecord]) -> Result<()>;

    /// Predicted log-density in transformed coordinates.
    fn logp_trans(&self, x_trans: &[f64]) -> f64;

    fn boxed_clone(&self) -> Box<dyn Surrogate>;
}

impl Clone for Box<dyn Surrogate> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// Order-2 polynomial surrogate: exact for Gaussian targets.
///
/// Fit by least squares over the feature vector
/// `[1, x_1..x_d, x_i x_j for i <= j]`, solving the normal equations with
/// a symmetric pseudo-inverse so rank-deficient batches still produce the
/// minimum-norm solution.
#[derive(Clone, Debug)]
pub struct QuadraticSurrogate {
    dim: usize,
    coeffs: Option<Vec<f64>>,
}

impl QuadraticSurrogate {
    pub fn new(dim: usize) -> Self {
        Self { dim, coeffs: None }
    }

    pub fn is_fitted(&self) -> bool {
        self.coeffs.is_some()
    }

    fn features(&self, x: &[f64]) -> Vec<f64> {
        let mut feats = Vec::with_capacity(self.n_param());
        feats.push(1.0);
        feats.extend_from_slice(x);
        for i in 0..self.dim {
            for j in i..self.dim {
                feats.push(x[i] * x[j]);
            }
        }
        feats
    }
}

impl Surrogate for QuadraticSurrogate {
    fn n_param(&self) -> usize {
        1 + self.dim + self.dim * (self.dim + 1) / 2
    }

    fn fit(&mut self, records: &[EvalRecord]) -> Result<()> {
        if records.is_empty() {
            bail!("cannot fit a surrogate on an empty evaluation batch");
        }
        let p = self.n_param();
        let rows: Vec<Vec<f64>> = records.iter().map(|r| self.features(&r.x_trans)).collect();
        let design = Mat::from_fn(records.len(), p, |r, c| rows[r][c]);
        let normal = design.transpose() * (&design);
        let mut rhs = vec![0f64; p];
        for (row, record) in rows.iter().zip(records.iter()) {
            for (r, f) in rhs.iter_mut().zip(row.iter()) {
                *r += f * record.logp_trans;
            }
        }
        let Some(inv) = sym_pseudo_inverse(&normal) else {
            bail!("surrogate normal equations could not be decomposed");
        };
        self.coeffs = Some(matvec(&inv, &rhs));
        Ok(())
    }

    fn logp_trans(&self, x_trans: &[f64]) -> f64 {
        match &self.coeffs {
            Some(coeffs) => self
                .features(x_trans)
                .iter()
                .zip(coeffs.iter())
                .map(|(f, c)| f * c)
                .sum(),
            None => f64::NEG_INFINITY,
        }
    }

    fn boxed_clone(&self) -> Box<dyn Surrogate> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn record(x: Vec<f64>, logp: f64) -> EvalRecord {
        EvalRecord {
            x: x.clone(),
            x_trans: x,
            logp,
            logp_trans: logp,
        }
    }

    #[test]
    fn recovers_a_quadratic_exactly() {
        // f(x) = -0.5 x^2 + 2 x - 1
        let f = |x: f64| -0.5 * x * x + 2.0 * x - 1.0;
        let records: Vec<EvalRecord> = [-2.0, -1.0, 0.0, 0.5, 1.0, 3.0]
            .iter()
            .map(|&x| record(vec![x], f(x)))
            .collect();
        let mut surrogate = QuadraticSurrogate::new(1);
        assert!(!surrogate.is_fitted());
        surrogate.fit(&records).unwrap();
        for x in [-5.0, 0.3, 7.0] {
            assert_abs_diff_eq!(surrogate.logp_trans(&[x]), f(x), epsilon = 1e-8);
        }
    }

    #[test]
    fn unfitted_predicts_neg_infinity() {
        let surrogate = QuadraticSurrogate::new(2);
        assert_eq!(surrogate.logp_trans(&[0.0, 0.0]), f64::NEG_INFINITY);
    }

    #[test]
    fn rejects_empty_batches() {
        let mut surrogate = QuadraticSurrogate::new(1);
        assert!(surrogate.fit(&[]).is_err());
    }

    #[test]
    fn n_param_matches_feature_count() {
        let surrogate = QuadraticSurrogate::new(3);
        assert_eq!(surrogate.n_param(), 10);
        assert_eq!(surrogate.features(&[1.0, 2.0, 3.0]).len(), 10);
    }
}
