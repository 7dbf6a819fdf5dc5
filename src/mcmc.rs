//! Chain-sampler collaborator interface and the built-in random-walk
//! kernel.
//!
//! The pipeline only relies on the `ChainSampler` contract: given a
//! log-density view, warm-start points and options, produce per-chain
//! draws with their log-density values. The bundled `Metropolis` kernel
//! keeps the crate usable on its own; an HMC/NUTS kernel can be dropped
//! in through the same trait.

use anyhow::{ensure, Result};
use faer::Mat;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::density::LogpFunc;
use crate::math::{covariance, matvec, sym_sqrt};

const TARGET_ACCEPT: f64 = 0.234;

/// Sampler configuration for one invocation.
#[derive(Clone, Debug)]
pub struct SampleOptions {
    pub n_chain: usize,
    /// Total iterations per chain, warmup included.
    pub n_iter: usize,
    pub n_warmup: usize,
    /// Fixed proposal metric (a covariance in transformed coordinates).
    pub metric: Option<Mat<f64>>,
    /// Re-estimate the metric from warmup draws.
    pub adapt_metric: bool,
    /// Initial proposal scale; `None` uses `2.38 / sqrt(dim)`.
    pub step_scale: Option<f64>,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            n_chain: 4,
            n_iter: 1500,
            n_warmup: 500,
            metric: None,
            adapt_metric: true,
            step_scale: None,
        }
    }
}

/// Per-step sampler overrides carried by a step configuration.
///
/// Unset fields inherit from the phase controller's presets; set fields
/// win (stage-local > preset > kernel default).
#[derive(Clone, Debug, Default)]
pub struct SamplerTemplate {
    pub n_chain: Option<usize>,
    pub n_iter: Option<usize>,
    pub n_warmup: Option<usize>,
    pub metric: Option<Mat<f64>>,
    pub adapt_metric: Option<bool>,
    pub step_scale: Option<f64>,
}

impl SamplerTemplate {
    pub fn apply(&self, mut base: SampleOptions) -> SampleOptions {
        if let Some(n_chain) = self.n_chain {
            base.n_chain = n_chain;
        }
        if let Some(n_iter) = self.n_iter {
            base.n_iter = n_iter;
        }
        if let Some(n_warmup) = self.n_warmup {
            base.n_warmup = n_warmup;
        }
        if let Some(metric) = &self.metric {
            base.metric = Some(metric.clone());
        }
        if let Some(adapt_metric) = self.adapt_metric {
            base.adapt_metric = adapt_metric;
        }
        if let Some(step_scale) = self.step_scale {
            base.step_scale = Some(step_scale);
        }
        base
    }
}

/// Post-warmup output of one chain, in the sampler's (transformed)
/// coordinates, one log-density per draw.
#[derive(Clone, Debug)]
pub struct ChainRun {
    pub draws: Vec<Vec<f64>>,
    pub logp: Vec<f64>,
    /// Proposal scale at the end of warmup.
    pub scale: f64,
}

#[derive(Clone, Debug, Default)]
pub struct ChainTrace {
    pub chains: Vec<ChainRun>,
}

impl ChainTrace {
    pub fn n_draws(&self) -> usize {
        self.chains.iter().map(|c| c.draws.len()).sum()
    }

    pub fn mean_scale(&self) -> f64 {
        let n = self.chains.len().max(1) as f64;
        self.chains.iter().map(|c| c.scale).sum::<f64>() / n
    }
}

pub trait ChainSampler: Send + Sync {
    /// Runs `options.n_chain` chains, each started from a point drawn
    /// from `x_0` (transformed coordinates).
    fn sample(
        &self,
        logp: &dyn LogpFunc,
        x_0: &[Vec<f64>],
        options: &SampleOptions,
        rng: &mut ChaCha8Rng,
    ) -> Result<ChainTrace>;
}

/// Adaptive random-walk Metropolis kernel.
///
/// The proposal is `x + s * L z` with `L` the symmetric square root of
/// the metric; `s` adapts toward the optimal random-walk acceptance rate
/// during warmup, and with `adapt_metric` the metric is re-estimated once
/// halfway through warmup from the draws collected so far.
#[derive(Clone, Copy, Debug, Default)]
pub struct Metropolis;

impl ChainSampler for Metropolis {
    fn sample(
        &self,
        logp: &dyn LogpFunc,
        x_0: &[Vec<f64>],
        options: &SampleOptions,
        rng: &mut ChaCha8Rng,
    ) -> Result<ChainTrace> {
        ensure!(!x_0.is_empty(), "no warm-start points for chain sampling");
        ensure!(
            options.n_iter > options.n_warmup,
            "n_iter ({}) must exceed n_warmup ({})",
            options.n_iter,
            options.n_warmup
        );
        let dim = logp.dim();
        let sqrt_metric = match &options.metric {
            Some(metric) => {
                sym_sqrt(metric).ok_or_else(|| anyhow::anyhow!("metric is not symmetric psd"))?
            }
            None => Mat::identity(dim, dim),
        };
        let mut chains = Vec::with_capacity(options.n_chain);
        for _ in 0..options.n_chain {
            let mut chain_rng = ChaCha8Rng::seed_from_u64(rng.random());
            let start = x_0[chain_rng.random_range(0..x_0.len())].clone();
            chains.push(run_chain(
                logp,
                start,
                &sqrt_metric,
                options,
                &mut chain_rng,
            )?);
        }
        Ok(ChainTrace { chains })
    }
}

fn run_chain(
    logp: &dyn LogpFunc,
    start: Vec<f64>,
    sqrt_metric: &Mat<f64>,
    options: &SampleOptions,
    rng: &mut ChaCha8Rng,
) -> Result<ChainRun> {
    let dim = start.len();
    let mut x = start;
    let mut fx = logp.logp(&x)?;
    ensure!(fx.is_finite(), "log density is not finite at the chain start");

    let mut sqrt_metric = sqrt_metric.clone();
    let mut log_scale = options
        .step_scale
        .unwrap_or(2.38 / (dim as f64).sqrt())
        .ln();
    let mut warm: Vec<Vec<f64>> = Vec::with_capacity(options.n_warmup);
    let n_keep = options.n_iter - options.n_warmup;
    let mut draws = Vec::with_capacity(n_keep);
    let mut logps = Vec::with_capacity(n_keep);

    for t in 0..options.n_iter {
        let z: Vec<f64> = (0..dim).map(|_| rng.sample(StandardNormal)).collect();
        let step = matvec(&sqrt_metric, &z);
        let scale = log_scale.exp();
        let y: Vec<f64> = x
            .iter()
            .zip(step.iter())
            .map(|(xi, s)| xi + scale * s)
            .collect();
        let fy = logp.logp(&y)?;
        let log_ratio = fy - fx;
        let accept_prob = if fy.is_finite() {
            log_ratio.exp().min(1.0)
        } else {
            0.0
        };
        if accept_prob > 0.0 && (log_ratio >= 0.0 || rng.random::<f64>() < log_ratio.exp()) {
            x = y;
            fx = fy;
        }
        if t < options.n_warmup {
            log_scale += (accept_prob - TARGET_ACCEPT) / ((t + 1) as f64).sqrt();
            warm.push(x.clone());
            if options.adapt_metric && t + 1 == options.n_warmup / 2 && warm.len() > dim {
                let cov = covariance(&warm[warm.len() / 2..]);
                if let Some(sqrt) = sym_sqrt(&cov) {
                    sqrt_metric = sqrt;
                }
            }
        } else {
            draws.push(x.clone());
            logps.push(fx);
        }
    }

    Ok(ChainRun {
        draws,
        logp: logps,
        scale: log_scale.exp(),
    })
}
