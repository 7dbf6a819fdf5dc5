//! Execution state of a recipe: configured steps, accumulated results
//! and per-phase progress cursors.

use crate::density::EvalRecord;
use crate::laplace::LaplaceResult;
use crate::mcmc::ChainTrace;
use crate::steps::{OptimizeStep, PostStep, SampleStep};
use crate::surrogate::Surrogate;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Optimize,
    Sample,
    Post,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseStatus {
    NotStarted,
    InProgress,
    Finished,
}

/// Four related log-density values at one point. `logq`/`logq_trans` are
/// unset when there is no approximation to compare against.
#[derive(Clone, Copy, Debug)]
pub struct DensityQuartet {
    pub logp: f64,
    pub logq: Option<f64>,
    pub logp_trans: f64,
    pub logq_trans: Option<f64>,
}

/// Flattened chain output: original-space draws with their
/// original-space approximate log-density, plus the raw per-chain trace.
#[derive(Clone, Debug)]
pub struct ChainStore {
    pub samples: Vec<Vec<f64>>,
    pub logq: Vec<f64>,
    pub trace: ChainTrace,
}

/// One optimize-phase iteration.
#[derive(Clone)]
pub struct OptimizeResult {
    /// Mode, original coordinates.
    pub x_max: Vec<f64>,
    pub f_max: DensityQuartet,
    /// Local-approximation samples, original coordinates.
    pub samples: Vec<Vec<f64>>,
    /// Snapshot of the surrogates used this iteration (empty in
    /// no-surrogate mode).
    pub surrogates: Vec<Box<dyn Surrogate>>,
    /// Evaluation records behind this iteration's fit, if any.
    pub records: Option<Vec<EvalRecord>>,
    pub laplace: LaplaceResult,
    /// Chain output over the final approximation, when sampled.
    pub chain: Option<ChainStore>,
}

/// One completed sample stage.
#[derive(Clone)]
pub struct SampleResult {
    pub chain: ChainStore,
    pub surrogates: Vec<Box<dyn Surrogate>>,
    pub records: Option<Vec<EvalRecord>>,
}

/// Importance-reweighted output of the post phase.
#[derive(Clone, Debug)]
pub struct PostResult {
    /// Possibly subsampled points used for reweighting.
    pub samples: Vec<Vec<f64>>,
    /// Truncated weights (`None` when reweighting was skipped).
    pub weights: Option<Vec<f64>>,
    pub logp: Option<Vec<f64>>,
    pub logq: Vec<f64>,
    /// The full flattened sample set before subsampling.
    pub samples_raw: Vec<Vec<f64>>,
    pub weights_raw: Option<Vec<f64>>,
}

/// The single source of truth for what has run.
///
/// Cursors only move forward, one completed stage at a time, and phase
/// controllers are the only writers. A phase is finished when its cursor
/// equals its configured stage count, so re-running a recipe is a no-op
/// for finished phases.
pub struct RecipeTrace {
    optimize_step: Option<OptimizeStep>,
    sample_steps: Vec<SampleStep>,
    post_step: Option<PostStep>,
    optimize_results: Vec<OptimizeResult>,
    sample_results: Vec<SampleResult>,
    post_results: Vec<PostResult>,
    i_optimize: usize,
    i_sample: usize,
    i_post: usize,
}

impl RecipeTrace {
    pub fn new(
        optimize: Option<OptimizeStep>,
        sample: Vec<SampleStep>,
        post: Option<PostStep>,
    ) -> Self {
        Self {
            optimize_step: optimize,
            sample_steps: sample,
            post_step: post,
            optimize_results: Vec::new(),
            sample_results: Vec::new(),
            post_results: Vec::new(),
            i_optimize: 0,
            i_sample: 0,
            i_post: 0,
        }
    }

    pub fn optimize_step(&self) -> Option<&OptimizeStep> {
        self.optimize_step.as_ref()
    }

    pub fn sample_steps(&self) -> &[SampleStep] {
        &self.sample_steps
    }

    pub fn post_step(&self) -> Option<&PostStep> {
        self.post_step.as_ref()
    }

    pub fn optimize_results(&self) -> &[OptimizeResult] {
        &self.optimize_results
    }

    pub fn sample_results(&self) -> &[SampleResult] {
        &self.sample_results
    }

    pub fn post_results(&self) -> &[PostResult] {
        &self.post_results
    }

    /// Number of configured stages for a phase.
    pub fn n(&self, phase: Phase) -> usize {
        match phase {
            Phase::Optimize => usize::from(self.optimize_step.is_some()),
            Phase::Sample => self.sample_steps.len(),
            Phase::Post => usize::from(self.post_step.is_some()),
        }
    }

    /// Progress cursor for a phase.
    pub fn cursor(&self, phase: Phase) -> usize {
        match phase {
            Phase::Optimize => self.i_optimize,
            Phase::Sample => self.i_sample,
            Phase::Post => self.i_post,
        }
    }

    pub fn status(&self, phase: Phase) -> PhaseStatus {
        let cursor = self.cursor(phase);
        if cursor == self.n(phase) {
            PhaseStatus::Finished
        } else if cursor == 0 {
            PhaseStatus::NotStarted
        } else {
            PhaseStatus::InProgress
        }
    }

    pub fn finished(&self, phase: Phase) -> bool {
        self.cursor(phase) == self.n(phase)
    }

    pub fn all_finished(&self) -> bool {
        self.finished(Phase::Optimize) && self.finished(Phase::Sample) && self.finished(Phase::Post)
    }

    /// Total number of true-density evaluations dispatched through the
    /// evaluation client so far. Direct single-point evaluations (one per
    /// surrogate optimize iteration) are not included.
    pub fn n_call(&self) -> usize {
        let optimize: usize = self
            .optimize_results
            .iter()
            .map(|r| r.records.as_ref().map_or(0, Vec::len))
            .sum();
        let sample: usize = self
            .sample_results
            .iter()
            .map(|r| r.records.as_ref().map_or(0, Vec::len))
            .sum();
        let post: usize = self
            .post_results
            .iter()
            .map(|r| r.logp.as_ref().map_or(0, Vec::len))
            .sum();
        optimize + sample + post
    }

    pub(crate) fn push_optimize(&mut self, result: OptimizeResult) {
        self.optimize_results.push(result);
    }

    pub(crate) fn push_sample(&mut self, result: SampleResult) {
        self.sample_results.push(result);
    }

    pub(crate) fn push_post(&mut self, result: PostResult) {
        self.post_results.push(result);
    }

    /// Moves a phase cursor one completed stage forward.
    pub(crate) fn advance(&mut self, phase: Phase) {
        let cursor = match phase {
            Phase::Optimize => &mut self.i_optimize,
            Phase::Sample => &mut self.i_sample,
            Phase::Post => &mut self.i_post,
        };
        *cursor += 1;
        debug_assert!(*cursor <= self.n(phase), "phase cursor moved past its stage count");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::{PostOptions, SampleStepOptions};

    fn sample_step() -> SampleStep {
        SampleStep::new(SampleStepOptions::default()).unwrap()
    }

    #[test]
    fn status_progression() {
        let mut trace = RecipeTrace::new(None, vec![sample_step(), sample_step()], None);
        assert!(trace.finished(Phase::Optimize));
        assert_eq!(trace.status(Phase::Sample), PhaseStatus::NotStarted);
        trace.advance(Phase::Sample);
        assert_eq!(trace.status(Phase::Sample), PhaseStatus::InProgress);
        trace.advance(Phase::Sample);
        assert_eq!(trace.status(Phase::Sample), PhaseStatus::Finished);
        assert!(trace.all_finished());
    }

    #[test]
    fn unconfigured_phases_start_finished() {
        let trace = RecipeTrace::new(None, Vec::new(), None);
        assert!(trace.all_finished());
        assert_eq!(trace.n(Phase::Post), 0);
    }

    #[test]
    fn post_counts_into_n_call() {
        let post = PostStep::new(PostOptions::default()).unwrap();
        let mut trace = RecipeTrace::new(None, vec![sample_step()], Some(post));
        assert_eq!(trace.n_call(), 0);
        trace.push_post(PostResult {
            samples: vec![vec![0.0]; 3],
            weights: Some(vec![1.0; 3]),
            logp: Some(vec![0.0; 3]),
            logq: vec![0.0; 3],
            samples_raw: vec![vec![0.0]; 3],
            weights_raw: Some(vec![1.0; 3]),
        });
        assert_eq!(trace.n_call(), 3);
    }
}
