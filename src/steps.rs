//! Validated, immutable-after-construction phase configurations.
//!
//! Each step is built from a plain options struct with `Default`. The
//! constructor validates types and ranges only (business-logic
//! conditions surface later, from the controllers), then freezes the
//! fields behind getters.

use rand_chacha::ChaCha8Rng;

use crate::error::{RecipeError, Result};
use crate::laplace::LaplaceOptions;
use crate::mcmc::SamplerTemplate;
use crate::random::RngHandle;
use crate::resample::ResampleOptions;
use crate::surrogate::Surrogate;

fn positive(field: &'static str, value: f64) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(RecipeError::Config {
            field,
            reason: format!("expected a positive finite number, got {value}"),
        })
    }
}

fn finite(field: &'static str, value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RecipeError::Config {
            field,
            reason: format!("expected a finite number, got {value}"),
        })
    }
}

fn check_points(field: &'static str, points: &Option<Vec<Vec<f64>>>) -> Result<()> {
    if let Some(points) = points {
        let Some(first) = points.first() else {
            return Err(RecipeError::Config {
                field,
                reason: "point set must not be empty".into(),
            });
        };
        if first.is_empty() || points.iter().any(|p| p.len() != first.len()) {
            return Err(RecipeError::Config {
                field,
                reason: "points must be non-empty and of equal dimension".into(),
            });
        }
    }
    Ok(())
}

/// Fields shared by the optimize and sample configurations.
#[derive(Clone)]
struct StepCommon {
    surrogates: Vec<Box<dyn Surrogate>>,
    alpha_n: f64,
    fitted: bool,
    trace: SamplerTemplate,
    x_0: Option<Vec<Vec<f64>>>,
    rng: RngHandle,
    rng_init: ChaCha8Rng,
}

impl StepCommon {
    fn new(
        surrogates: Vec<Box<dyn Surrogate>>,
        alpha_n: f64,
        fitted: bool,
        trace: SamplerTemplate,
        x_0: Option<Vec<Vec<f64>>>,
        rng: Option<RngHandle>,
    ) -> Result<Self> {
        positive("alpha_n", alpha_n)?;
        check_points("x_0", &x_0)?;
        let rng = rng.unwrap_or_else(RngHandle::global);
        let rng_init = rng.snapshot();
        Ok(Self {
            surrogates,
            alpha_n,
            fitted,
            trace,
            x_0,
            rng,
            rng_init,
        })
    }

    fn max_n_param(&self) -> usize {
        self.surrogates.iter().map(|s| s.n_param()).max().unwrap_or(0)
    }

    fn scaled_eval_count(&self, alpha: f64) -> usize {
        (alpha * self.max_n_param() as f64) as usize
    }
}

#[derive(Clone)]
pub struct OptimizeOptions {
    pub surrogates: Vec<Box<dyn Surrogate>>,
    /// Evaluation budget multiplier: `n_eval = alpha_n * max n_param`.
    pub alpha_n: f64,
    /// Surrogates are already trained; skip the initial fit.
    pub fitted: bool,
    pub trace: SamplerTemplate,
    /// Initial point set, original coordinates.
    pub x_0: Option<Vec<Vec<f64>>>,
    pub rng: Option<RngHandle>,
    pub laplace: LaplaceOptions,
    pub eps_pp: f64,
    pub eps_pq: f64,
    pub max_iter: usize,
    /// Chain-sample the final optimize result.
    pub run_sampling: bool,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            surrogates: Vec::new(),
            alpha_n: 2.0,
            fitted: false,
            trace: SamplerTemplate::default(),
            x_0: None,
            rng: None,
            laplace: LaplaceOptions::default(),
            eps_pp: 0.1,
            eps_pq: 0.1,
            max_iter: 10,
            run_sampling: false,
        }
    }
}

#[derive(Clone)]
pub struct OptimizeStep {
    common: StepCommon,
    laplace: LaplaceOptions,
    eps_pp: f64,
    eps_pq: f64,
    max_iter: usize,
    run_sampling: bool,
}

impl OptimizeStep {
    pub fn new(options: OptimizeOptions) -> Result<Self> {
        let common = StepCommon::new(
            options.surrogates,
            options.alpha_n,
            options.fitted,
            options.trace,
            options.x_0,
            options.rng,
        )?;
        positive("eps_pp", options.eps_pp)?;
        positive("eps_pq", options.eps_pq)?;
        if options.max_iter == 0 {
            return Err(RecipeError::Config {
                field: "max_iter",
                reason: "expected a positive integer, got 0".into(),
            });
        }
        Ok(Self {
            common,
            laplace: options.laplace,
            eps_pp: options.eps_pp,
            eps_pq: options.eps_pq,
            max_iter: options.max_iter,
            run_sampling: options.run_sampling,
        })
    }

    pub fn surrogates(&self) -> &[Box<dyn Surrogate>] {
        &self.common.surrogates
    }

    pub fn has_surrogate(&self) -> bool {
        !self.common.surrogates.is_empty()
    }

    pub fn alpha_n(&self) -> f64 {
        self.common.alpha_n
    }

    pub fn fitted(&self) -> bool {
        self.common.fitted
    }

    pub fn trace(&self) -> &SamplerTemplate {
        &self.common.trace
    }

    pub fn x_0(&self) -> Option<&[Vec<f64>]> {
        self.common.x_0.as_deref()
    }

    pub fn rng(&self) -> &RngHandle {
        &self.common.rng
    }

    /// Generator state captured at construction, for reproducibility.
    pub fn rng_init(&self) -> ChaCha8Rng {
        self.common.rng_init.clone()
    }

    pub fn n_eval(&self) -> usize {
        self.common.scaled_eval_count(self.common.alpha_n)
    }

    pub fn laplace(&self) -> LaplaceOptions {
        self.laplace
    }

    pub fn eps_pp(&self) -> f64 {
        self.eps_pp
    }

    pub fn eps_pq(&self) -> f64 {
        self.eps_pq
    }

    pub fn max_iter(&self) -> usize {
        self.max_iter
    }

    pub fn run_sampling(&self) -> bool {
        self.run_sampling
    }
}

#[derive(Clone)]
pub struct SampleStepOptions {
    pub surrogates: Vec<Box<dyn Surrogate>>,
    pub alpha_n: f64,
    pub fitted: bool,
    pub trace: SamplerTemplate,
    pub x_0: Option<Vec<Vec<f64>>>,
    pub rng: Option<RngHandle>,
    pub resample: ResampleOptions,
    /// How many prior stages' evaluated points to fold into the fit;
    /// negative reuses all of them.
    pub reuse_samples: i64,
    /// Seed the proposal scale from the previous stage's adapted scale.
    pub reuse_step_size: bool,
    /// Fix the metric from the warm-start covariance instead of adapting.
    pub reuse_metric: bool,
    /// Only trust evaluation points above the importance reference floor.
    pub logp_cutoff: bool,
    pub alpha_min: f64,
    pub alpha_supp: f64,
}

impl Default for SampleStepOptions {
    fn default() -> Self {
        Self {
            surrogates: Vec::new(),
            alpha_n: 2.0,
            fitted: false,
            trace: SamplerTemplate::default(),
            x_0: None,
            rng: None,
            resample: ResampleOptions::default(),
            reuse_samples: 0,
            reuse_step_size: true,
            reuse_metric: true,
            logp_cutoff: true,
            alpha_min: 1.5,
            alpha_supp: 0.1,
        }
    }
}

#[derive(Clone)]
pub struct SampleStep {
    common: StepCommon,
    resample: ResampleOptions,
    reuse_samples: i64,
    reuse_step_size: bool,
    reuse_metric: bool,
    logp_cutoff: bool,
    alpha_min: f64,
    alpha_supp: f64,
}

impl SampleStep {
    pub fn new(options: SampleStepOptions) -> Result<Self> {
        let common = StepCommon::new(
            options.surrogates,
            options.alpha_n,
            options.fitted,
            options.trace,
            options.x_0,
            options.rng,
        )?;
        positive("alpha_min", options.alpha_min)?;
        positive("alpha_supp", options.alpha_supp)?;
        Ok(Self {
            common,
            resample: options.resample,
            reuse_samples: options.reuse_samples,
            reuse_step_size: options.reuse_step_size,
            reuse_metric: options.reuse_metric,
            logp_cutoff: options.logp_cutoff,
            alpha_min: options.alpha_min,
            alpha_supp: options.alpha_supp,
        })
    }

    pub fn surrogates(&self) -> &[Box<dyn Surrogate>] {
        &self.common.surrogates
    }

    pub fn has_surrogate(&self) -> bool {
        !self.common.surrogates.is_empty()
    }

    pub fn alpha_n(&self) -> f64 {
        self.common.alpha_n
    }

    pub fn fitted(&self) -> bool {
        self.common.fitted
    }

    pub fn trace(&self) -> &SamplerTemplate {
        &self.common.trace
    }

    pub fn x_0(&self) -> Option<&[Vec<f64>]> {
        self.common.x_0.as_deref()
    }

    pub fn rng(&self) -> &RngHandle {
        &self.common.rng
    }

    pub fn rng_init(&self) -> ChaCha8Rng {
        self.common.rng_init.clone()
    }

    pub fn resample_options(&self) -> &ResampleOptions {
        &self.resample
    }

    pub fn reuse_samples(&self) -> i64 {
        self.reuse_samples
    }

    pub fn reuse_step_size(&self) -> bool {
        self.reuse_step_size
    }

    pub fn reuse_metric(&self) -> bool {
        self.reuse_metric
    }

    pub fn logp_cutoff(&self) -> bool {
        self.logp_cutoff
    }

    pub fn alpha_min(&self) -> f64 {
        self.alpha_min
    }

    pub fn alpha_supp(&self) -> f64 {
        self.alpha_supp
    }

    pub fn n_eval(&self) -> usize {
        self.common.scaled_eval_count(self.common.alpha_n)
    }

    pub fn n_eval_min(&self) -> usize {
        self.common.scaled_eval_count(self.alpha_min)
    }

    pub fn n_eval_supp(&self) -> usize {
        self.common.scaled_eval_count(self.alpha_supp)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PostOptions {
    /// Importance-sample count: 0 skips reweighting, negative uses every
    /// available sample, positive subsamples to that count.
    pub n_is: i64,
    /// Truncation exponent; negative disables truncation.
    pub k_trunc: f64,
}

impl Default for PostOptions {
    fn default() -> Self {
        Self {
            n_is: 0,
            k_trunc: 0.25,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PostStep {
    n_is: i64,
    k_trunc: f64,
}

impl PostStep {
    pub fn new(options: PostOptions) -> Result<Self> {
        finite("k_trunc", options.k_trunc)?;
        Ok(Self {
            n_is: options.n_is,
            k_trunc: options.k_trunc,
        })
    }

    pub fn n_is(&self) -> i64 {
        self.n_is
    }

    pub fn k_trunc(&self) -> f64 {
        self.k_trunc
    }
}
