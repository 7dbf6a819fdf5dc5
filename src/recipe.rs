//! The staged inference pipeline: Optimize, Sample and Post phase
//! controllers driving a `RecipeTrace`.

use itertools::Itertools;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::client::{EvalClient, RayonClient};
use crate::density::{Density, DensityHandle, EvalRecord};
use crate::error::{RecipeError, Result};
use crate::laplace::Laplace;
use crate::math::{covariance, diag_mat, standard_normal_draws, strided_indices};
use crate::mcmc::{ChainSampler, Metropolis, SampleOptions};
use crate::random::RngHandle;
use crate::resample::resample;
use crate::steps::{OptimizeStep, SampleStep};
use crate::trace::{
    ChainStore, DensityQuartet, OptimizeResult, Phase, PostResult, RecipeTrace, SampleResult,
};

/// Runs a staged inference workflow over one density.
///
/// The recipe owns its execution trace and the density handle; the
/// evaluation client is either borrowed per `run` call, installed with
/// [`Recipe::with_client`], or created for the duration of a single run
/// and torn down with it.
pub struct Recipe<D: Density> {
    density: DensityHandle<D>,
    sampler: Box<dyn ChainSampler>,
    client: Option<Box<dyn EvalClient>>,
    trace: RecipeTrace,
    x_0: Option<Vec<Vec<f64>>>,
}

impl<D: Density> Recipe<D> {
    pub fn new(density: D, trace: RecipeTrace) -> Self {
        Self {
            density: DensityHandle::new(density),
            sampler: Box::new(Metropolis),
            client: None,
            trace,
            x_0: None,
        }
    }

    /// Install a long-lived evaluation client owned by the recipe.
    pub fn with_client(mut self, client: Box<dyn EvalClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Replace the built-in chain-sampler kernel.
    pub fn with_sampler(mut self, sampler: Box<dyn ChainSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Fallback initial point set (original coordinates) for steps that
    /// do not carry their own.
    pub fn with_x_0(mut self, x_0: Vec<Vec<f64>>) -> Self {
        self.x_0 = Some(x_0);
        self
    }

    pub fn density(&self) -> &DensityHandle<D> {
        &self.density
    }

    pub fn trace(&self) -> &RecipeTrace {
        &self.trace
    }

    /// Executes unfinished phases in order Optimize, Sample, Post.
    ///
    /// Finished phases are never re-executed. A negative `steps` runs
    /// every unfinished phase; otherwise at most `steps` phases run in
    /// this call. If neither `client` nor an installed client is
    /// available, an ephemeral in-process client is created for this run
    /// and dropped with it.
    pub fn run(&mut self, client: Option<&dyn EvalClient>, steps: i64) -> Result<()> {
        // The stored client leaves `self` for the duration of the run so
        // the phase controllers can borrow the rest of the recipe mutably.
        let stored = self.client.take();
        let result = self.run_inner(client, stored.as_deref(), steps);
        self.client = stored;
        result
    }

    fn run_inner(
        &mut self,
        client: Option<&dyn EvalClient>,
        stored: Option<&dyn EvalClient>,
        steps: i64,
    ) -> Result<()> {
        let ephemeral;
        let client: &dyn EvalClient = match (client, stored) {
            (Some(client), _) => client,
            (None, Some(client)) => client,
            (None, None) => {
                ephemeral = RayonClient::new(0)?;
                &ephemeral
            }
        };

        let mut remaining = steps;
        for phase in [Phase::Optimize, Phase::Sample, Phase::Post] {
            if remaining == 0 {
                break;
            }
            if self.trace.finished(phase) {
                continue;
            }
            match phase {
                Phase::Optimize => self.optimize_phase(client)?,
                Phase::Sample => self.sample_phase(client)?,
                Phase::Post => self.post_phase(client)?,
            }
            if remaining > 0 {
                remaining -= 1;
            }
        }
        Ok(())
    }

    /// Runs every unfinished phase with the recipe's own client (or an
    /// ephemeral one).
    pub fn run_all(&mut self) -> Result<()> {
        self.run(None, -1)
    }

    /// Final post-phase result.
    pub fn get(&self) -> Result<PostResult> {
        self.trace
            .post_results()
            .first()
            .cloned()
            .ok_or(RecipeError::NoPostResult)
    }

    fn evaluate_batch(
        &self,
        client: &dyn EvalClient,
        points: &[Vec<f64>],
    ) -> Result<Vec<EvalRecord>> {
        let handle = &self.density;
        let records = client.map_then_gather(&|x| handle.evaluate(x), points)?;
        debug!(n = records.len(), "gathered evaluation batch");
        Ok(records)
    }

    fn optimize_phase(&mut self, client: &dyn EvalClient) -> Result<()> {
        let Some(step) = self.trace.optimize_step().cloned() else {
            return Ok(());
        };
        let rng = step.rng().clone();
        let dim = self.density.dim();

        if step.has_surrogate() {
            self.density.set_surrogates(step.surrogates().to_vec());
            let n_eval = step.n_eval();
            let mut converged = false;

            let records = if step.fitted() {
                None
            } else {
                let points = self.initial_points(&step.x_0().map(<[_]>::to_vec), n_eval, &rng)?;
                let records = self.evaluate_batch(client, &points)?;
                self.density.fit(&records)?;
                Some(records)
            };
            self.optimize_iteration(&step, records, &rng)?;
            info!(iter = 0, "optimize iteration finished");

            for i in 1..step.max_iter() {
                let samples = self
                    .trace
                    .optimize_results()
                    .last()
                    .map(|r| r.samples.clone())
                    .unwrap_or_default();
                if samples.len() < n_eval {
                    return Err(RecipeError::InsufficientPoints {
                        needed: n_eval,
                        available: samples.len(),
                    });
                }
                let points = samples[..n_eval].to_vec();
                let records = self.evaluate_batch(client, &points)?;
                self.density.fit(&records)?;
                self.optimize_iteration(&step, Some(records), &rng)?;

                let results = self.trace.optimize_results();
                let current = results[results.len() - 1].f_max;
                let previous = results[results.len() - 2].f_max;
                let delta_pp = current.logp_trans - previous.logp_trans;
                let delta_pq = current.logp_trans - current.logq_trans.unwrap_or(f64::NAN);
                info!(iter = i, delta_pp, delta_pq, "optimize iteration finished");
                if delta_pp.abs() < step.eps_pp() && delta_pq.abs() < step.eps_pq() {
                    converged = true;
                    break;
                }
            }
            if !converged {
                warn!("optimization did not converge within the maximum number of iterations");
            }
        } else {
            let x0_trans = match step
                .x_0()
                .or(self.x_0.as_deref())
                .and_then(|points| points.first())
            {
                Some(x) => self.density.density().from_original(x),
                None => vec![0f64; dim],
            };
            let laplace = Laplace::new(step.laplace());
            let lap = rng.with(|r| laplace.run(&self.density.true_view(), &x0_trans, r))?;

            let x_max = self.density.density().to_original(&lap.x_max);
            let logp_trans = lap.f_max;
            let logp = self.density.density().to_original_density(logp_trans, &x_max);
            let f_max = DensityQuartet {
                logp,
                logq: None,
                logp_trans,
                logq_trans: None,
            };
            let samples = lap
                .samples
                .iter()
                .map(|s| self.density.density().to_original(s))
                .collect_vec();
            self.trace.push_optimize(OptimizeResult {
                x_max,
                f_max,
                samples,
                surrogates: Vec::new(),
                records: None,
                laplace: lap,
                chain: None,
            });
        }

        if step.run_sampling() {
            self.optimize_chain(&step)?;
        }
        self.trace.advance(Phase::Optimize);
        info!("optimize phase finished");
        Ok(())
    }

    /// One surrogate-mode optimize iteration: local approximation of the
    /// surrogate density, quartet against one true evaluation at the
    /// found mode.
    fn optimize_iteration(
        &mut self,
        step: &OptimizeStep,
        records: Option<Vec<EvalRecord>>,
        rng: &RngHandle,
    ) -> Result<()> {
        let x0_trans = records
            .as_ref()
            .and_then(|r| r.first())
            .map(|r| r.x_trans.clone())
            .unwrap_or_else(|| vec![0f64; self.density.dim()]);
        let laplace = Laplace::new(step.laplace());
        let lap = rng.with(|r| laplace.run(&self.density.surrogate_view(), &x0_trans, r))?;

        let x_max = self.density.density().to_original(&lap.x_max);
        let logq_trans = lap.f_max;
        let mode_eval = self.density.evaluate(&x_max)?;
        let logq = self.density.density().to_original_density(logq_trans, &x_max);
        let f_max = DensityQuartet {
            logp: mode_eval.logp,
            logq: Some(logq),
            logp_trans: mode_eval.logp_trans,
            logq_trans: Some(logq_trans),
        };
        let samples = lap
            .samples
            .iter()
            .map(|s| self.density.density().to_original(s))
            .collect_vec();
        let surrogates = self.density.surrogates().to_vec();
        self.trace.push_optimize(OptimizeResult {
            x_max,
            f_max,
            samples,
            surrogates,
            records,
            laplace: lap,
            chain: None,
        });
        Ok(())
    }

    /// Chain-samples the density defined by the last optimize iteration,
    /// seeding the metric from the Laplace covariance diagonal, and
    /// pushes a new result record carrying the chain output.
    fn optimize_chain(&mut self, step: &OptimizeStep) -> Result<()> {
        let Some(last) = self.trace.optimize_results().last().cloned() else {
            return Err(RecipeError::Unsupported(
                "chain-sampling requires a completed optimize iteration",
            ));
        };
        let diag = last
            .laplace
            .cov
            .diagonal()
            .column_vector()
            .iter()
            .copied()
            .collect_vec();
        let options = step.trace().apply(SampleOptions {
            metric: Some(diag_mat(&diag)),
            ..Default::default()
        });
        let use_surrogate = !last.surrogates.is_empty();
        let rng = step.rng().clone();

        let guard = self.density.scoped_surrogates(last.surrogates.clone());
        let chain = rng.with(|r| {
            run_chains(
                guard.handle(),
                self.sampler.as_ref(),
                use_surrogate,
                &last.samples,
                &options,
                r,
            )
        });
        drop(guard);
        let chain = chain?;

        let mut replacement = last;
        replacement.chain = Some(chain);
        self.trace.push_optimize(replacement);
        info!("finished sampling the density defined by the last optimize iteration");
        Ok(())
    }

    fn sample_phase(&mut self, client: &dyn EvalClient) -> Result<()> {
        for stage in self.trace.cursor(Phase::Sample)..self.trace.n(Phase::Sample) {
            let step = self.trace.sample_steps()[stage].clone();
            if step.has_surrogate() {
                self.sample_stage_surrogate(client, stage, &step)?;
            } else {
                self.sample_stage_direct(stage, &step)?;
            }
            self.trace.advance(Phase::Sample);
            info!(stage, "sample stage finished");
        }
        info!("sample phase finished");
        Ok(())
    }

    /// Warm-start points for a sample stage: the previous stage's chain
    /// samples, or for stage 0 the optimize phase's chain samples falling
    /// back to its point samples.
    fn warm_start_points(&self, stage: usize) -> Option<Vec<Vec<f64>>> {
        if stage == 0 {
            let last = self.trace.optimize_results().last()?;
            if let Some(chain) = &last.chain {
                return Some(chain.samples.clone());
            }
            Some(last.samples.clone())
        } else {
            self.trace
                .sample_results()
                .get(stage - 1)
                .map(|r| r.chain.samples.clone())
        }
    }

    fn sample_stage_direct(&mut self, stage: usize, step: &SampleStep) -> Result<()> {
        let x_0 = self
            .warm_start_points(stage)
            .or_else(|| step.x_0().map(<[_]>::to_vec))
            .or_else(|| self.x_0.clone())
            .ok_or(RecipeError::InsufficientPoints {
                needed: 1,
                available: 0,
            })?;
        let mut options = SampleOptions::default();
        if stage > 0 && step.reuse_step_size() {
            if let Some(prev) = self.trace.sample_results().last() {
                options.step_scale = Some(prev.chain.trace.mean_scale());
            }
        }
        let options = step.trace().apply(options);
        self.density.set_surrogates(Vec::new());
        let rng = step.rng().clone();
        let chain = rng.with(|r| {
            run_chains(&self.density, self.sampler.as_ref(), false, &x_0, &options, r)
        })?;
        self.trace.push_sample(SampleResult {
            chain,
            surrogates: Vec::new(),
            records: None,
        });
        Ok(())
    }

    fn sample_stage_surrogate(
        &mut self,
        client: &dyn EvalClient,
        stage: usize,
        step: &SampleStep,
    ) -> Result<()> {
        let rng = step.rng().clone();
        self.density.set_surrogates(step.surrogates().to_vec());

        let mut options = SampleOptions::default();
        if stage > 0 && step.reuse_step_size() {
            if let Some(prev) = self.trace.sample_results().last() {
                options.step_scale = Some(prev.chain.trace.mean_scale());
            }
        }

        let x_0;
        let mut stage_records: Option<Vec<EvalRecord>> = None;

        if stage == 0 && step.fitted() {
            x_0 = step
                .x_0()
                .map(<[_]>::to_vec)
                .or_else(|| self.x_0.clone())
                .ok_or(RecipeError::InsufficientPoints {
                    needed: 1,
                    available: 0,
                })?;
        } else if stage == 0 && self.trace.n(Phase::Optimize) == 0 {
            warn!(
                "found neither fitted surrogates nor an optimize step; fitting the surrogate \
                 directly from x_0 is deprecated"
            );
            let points = self.initial_points(&step.x_0().map(<[_]>::to_vec), step.n_eval(), &rng)?;
            let records = self.evaluate_batch(client, &points)?;
            self.density.fit(&records)?;
            stage_records = Some(records);
            x_0 = points;
        } else {
            // Warm start from the prior stage's chain, with its
            // approximate log-density as resampling weights.
            if stage == 0
                && self
                    .trace
                    .optimize_results()
                    .last()
                    .is_some_and(|r| r.chain.is_none())
            {
                if let Some(opt_step) = self.trace.optimize_step().cloned() {
                    self.optimize_chain(&opt_step)?;
                }
            }
            let (mut pool, mut pool_logq) = if stage == 0 {
                let store = self
                    .trace
                    .optimize_results()
                    .last()
                    .and_then(|r| r.chain.as_ref())
                    .ok_or(RecipeError::InsufficientPoints {
                        needed: step.n_eval(),
                        available: 0,
                    })?;
                (store.samples.clone(), store.logq.clone())
            } else {
                let store = &self.trace.sample_results()[stage - 1].chain;
                (store.samples.clone(), store.logq.clone())
            };
            let logq_min = pool_logq.iter().copied().fold(f64::INFINITY, f64::min);

            if step.reuse_metric() {
                let trans = pool
                    .iter()
                    .map(|x| self.density.density().from_original(x))
                    .collect_vec();
                options.metric = Some(covariance(&trans));
                options.adapt_metric = false;
            }
            let is_final = stage + 1 == self.trace.n(Phase::Sample);
            match (is_final, step.reuse_metric()) {
                (false, true) => {
                    options.n_iter = 2500;
                    options.n_warmup = 500;
                }
                (true, true) => {
                    options.n_iter = 4500;
                    options.n_warmup = 500;
                }
                (true, false) => {
                    options.n_iter = 5000;
                    options.n_warmup = 1000;
                }
                (false, false) => {}
            }

            let mut batch =
                draw_from_pool(&mut pool, &mut pool_logq, step.n_eval(), step, &rng);
            let mut records = self.evaluate_batch(client, &batch)?;

            let mut all_records = records.clone();
            if step.reuse_samples() != 0 {
                for j in 0..stage {
                    let in_window = step.reuse_samples() < 0
                        || j as i64 + step.reuse_samples() >= stage as i64;
                    if !in_window {
                        continue;
                    }
                    if let Some(prior) = &self.trace.sample_results()[j].records {
                        all_records.extend(prior.iter().cloned());
                    }
                }
            }

            if step.logp_cutoff() {
                let n_eval_min = step.n_eval_min();
                let n_eval_supp = step.n_eval_supp();
                let mut kept = all_records.iter().filter(|r| r.logp > logq_min).count();
                // The candidate pool strictly shrinks each round, so this
                // either reaches n_eval_min or fails.
                while kept < n_eval_min {
                    if n_eval_supp == 0 || n_eval_supp > pool.len() {
                        return Err(RecipeError::InsufficientSamples {
                            kept,
                            needed: n_eval_min,
                        });
                    }
                    let supplement =
                        draw_from_pool(&mut pool, &mut pool_logq, n_eval_supp, step, &rng);
                    let extra = self.evaluate_batch(client, &supplement)?;
                    records.extend(extra.iter().cloned());
                    all_records.extend(extra);
                    batch = supplement;
                    kept = all_records.iter().filter(|r| r.logp > logq_min).count();
                }
                all_records.retain(|r| r.logp > logq_min);
            }
            self.density.fit(&all_records)?;
            stage_records = Some(records);
            x_0 = batch;
        }

        let options = step.trace().apply(options);
        let chain = rng.with(|r| {
            run_chains(&self.density, self.sampler.as_ref(), true, &x_0, &options, r)
        })?;
        let surrogates = self.density.surrogates().to_vec();
        self.trace.push_sample(SampleResult {
            chain,
            surrogates,
            records: stage_records,
        });
        Ok(())
    }

    fn post_phase(&mut self, client: &dyn EvalClient) -> Result<()> {
        let Some(step) = self.trace.post_step().copied() else {
            return Ok(());
        };
        let Some(last) = self.trace.sample_results().last() else {
            if !self.trace.optimize_results().is_empty() {
                return Err(RecipeError::Unsupported(
                    "post-processing a recipe with only an optimize phase",
                ));
            }
            return Err(RecipeError::NoSamples);
        };
        let samples_raw = last.chain.samples.clone();
        let logq_all = last.chain.logq.clone();

        if step.n_is() == 0 {
            self.trace.push_post(PostResult {
                samples: samples_raw.clone(),
                weights: None,
                logp: None,
                logq: logq_all,
                samples_raw,
                weights_raw: None,
            });
        } else {
            let total = samples_raw.len();
            if total == 0 {
                return Err(RecipeError::NoSamples);
            }
            let n_is = if step.n_is() < 0 {
                total
            } else {
                let requested = step.n_is() as usize;
                if requested > total {
                    warn!(
                        requested,
                        available = total,
                        "not enough samples for the requested importance-sampling count; \
                         reweighting all available samples"
                    );
                    total
                } else {
                    requested
                }
            };
            let indices = strided_indices(total, n_is);
            let samples = indices.iter().map(|&i| samples_raw[i].clone()).collect_vec();
            let logq = indices.iter().map(|&i| logq_all[i]).collect_vec();

            let records = self.evaluate_batch(client, &samples)?;
            let logp = records.iter().map(|r| r.logp).collect_vec();
            let weights_raw = logp
                .iter()
                .zip(logq.iter())
                .map(|(p, q)| {
                    let w = (p - q).exp();
                    if w.is_finite() {
                        w
                    } else {
                        0.0
                    }
                })
                .collect_vec();
            let weights = if step.k_trunc() < 0.0 {
                weights_raw.clone()
            } else {
                let mean = weights_raw.iter().sum::<f64>() / n_is as f64;
                let cap = mean * (n_is as f64).powf(step.k_trunc());
                weights_raw.iter().map(|w| w.min(cap)).collect_vec()
            };
            self.trace.push_post(PostResult {
                samples,
                weights: Some(weights),
                logp: Some(logp),
                logq,
                samples_raw,
                weights_raw: Some(weights_raw),
            });
        }
        self.trace.advance(Phase::Post);
        info!("post phase finished");
        Ok(())
    }

    /// Initial evaluation batch: the caller-supplied point set truncated
    /// to `n_eval` (failing if undersized), or standard-normal draws over
    /// the transformed space.
    fn initial_points(
        &self,
        step_x0: &Option<Vec<Vec<f64>>>,
        n_eval: usize,
        rng: &RngHandle,
    ) -> Result<Vec<Vec<f64>>> {
        match step_x0.as_deref().or(self.x_0.as_deref()) {
            Some(x_0) => {
                if x_0.len() < n_eval {
                    return Err(RecipeError::InsufficientPoints {
                        needed: n_eval,
                        available: x_0.len(),
                    });
                }
                Ok(x_0[..n_eval].to_vec())
            }
            None => {
                let draws = rng.with(|r| standard_normal_draws(self.density.dim(), n_eval, r));
                Ok(draws
                    .iter()
                    .map(|x| self.density.density().to_original(x))
                    .collect_vec())
            }
        }
    }
}

/// Runs the sampler over original-space warm-start points and flattens
/// the output back to original space with per-draw log-densities.
fn run_chains<D: Density>(
    handle: &DensityHandle<D>,
    sampler: &dyn ChainSampler,
    use_surrogate: bool,
    x_0: &[Vec<f64>],
    options: &SampleOptions,
    rng: &mut ChaCha8Rng,
) -> Result<ChainStore> {
    let seeds = x_0
        .iter()
        .map(|x| handle.density().from_original(x))
        .collect_vec();
    let trace = if use_surrogate {
        sampler.sample(&handle.surrogate_view(), &seeds, options, rng)
    } else {
        sampler.sample(&handle.true_view(), &seeds, options, rng)
    }?;
    let mut samples = Vec::with_capacity(trace.n_draws());
    let mut logq = Vec::with_capacity(trace.n_draws());
    for run in &trace.chains {
        for (draw, lp) in run.draws.iter().zip(run.logp.iter()) {
            let x = handle.density().to_original(draw);
            logq.push(handle.density().to_original_density(*lp, &x));
            samples.push(x);
        }
    }
    Ok(ChainStore {
        samples,
        logq,
        trace,
    })
}

/// Resamples `n` candidates by `logq`, removing the chosen points from
/// the pool so later rounds cannot reuse them.
fn draw_from_pool(
    pool: &mut Vec<Vec<f64>>,
    pool_logq: &mut Vec<f64>,
    n: usize,
    step: &SampleStep,
    rng: &RngHandle,
) -> Vec<Vec<f64>> {
    let indices = rng.with(|r| resample(pool_logq, n, step.resample_options(), r));
    let chosen = indices.iter().map(|&j| pool[j].clone()).collect_vec();
    let mut unique = indices;
    unique.sort_unstable();
    unique.dedup();
    for &j in unique.iter().rev() {
        pool.remove(j);
        pool_logq.remove(j);
    }
    chosen
}
