//! End-to-end runs of the three-phase pipeline against Gaussian targets,
//! where the quadratic surrogate is exact and every stage's output can be
//! checked in closed form.

use pretty_assertions::assert_eq;

use bayes_recipe::{
    Density, OptimizeOptions, OptimizeStep, Phase, PhaseStatus, PostOptions, PostStep,
    QuadraticSurrogate, RayonClient, Recipe, RecipeError, RecipeTrace, RngHandle, SampleStep,
    SampleStepOptions, SamplerTemplate,
};

struct Gaussian {
    mean: Vec<f64>,
}

impl Density for Gaussian {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn logp_trans(&self, x_trans: &[f64]) -> anyhow::Result<f64> {
        Ok(-0.5
            * x_trans
                .iter()
                .zip(self.mean.iter())
                .map(|(x, m)| (x - m).powi(2))
                .sum::<f64>())
    }

    fn grad_trans(&self, x_trans: &[f64]) -> Option<Vec<f64>> {
        Some(
            self.mean
                .iter()
                .zip(x_trans.iter())
                .map(|(m, x)| m - x)
                .collect(),
        )
    }
}

fn short_chains(n_iter: usize, n_warmup: usize) -> SamplerTemplate {
    SamplerTemplate {
        n_chain: Some(2),
        n_iter: Some(n_iter),
        n_warmup: Some(n_warmup),
        ..Default::default()
    }
}

#[test]
fn optimize_without_surrogates_finds_the_mode() {
    let optimize = OptimizeStep::new(OptimizeOptions {
        x_0: Some(vec![vec![0.0, 0.0]]),
        rng: Some(RngHandle::seeded(31)),
        ..Default::default()
    })
    .unwrap();
    let trace = RecipeTrace::new(Some(optimize), Vec::new(), None);
    let mut recipe = Recipe::new(
        Gaussian {
            mean: vec![1.5, -0.5],
        },
        trace,
    );
    recipe.run_all().unwrap();

    let result = recipe.trace().optimize_results().last().unwrap();
    assert!((result.x_max[0] - 1.5).abs() < 1e-4);
    assert!((result.x_max[1] + 0.5).abs() < 1e-4);
    assert!(result.f_max.logp.abs() < 1e-8);
    assert!(result.f_max.logq.is_none());
    assert!(recipe.trace().all_finished());
    assert_eq!(recipe.trace().n_call(), 0);
    assert!(matches!(recipe.get(), Err(RecipeError::NoPostResult)));
}

#[test]
fn three_phases_with_an_exact_surrogate_give_unit_weights() {
    let mean = vec![1.0, -2.0];
    // 4x3 grid around the origin, enough points for the 6-parameter
    // quadratic at alpha_n = 2
    let grid: Vec<Vec<f64>> = (0..4)
        .flat_map(|i| (0..3).map(move |j| vec![-1.5 + i as f64, -1.0 + j as f64]))
        .collect();

    let optimize = OptimizeStep::new(OptimizeOptions {
        surrogates: vec![Box::new(QuadraticSurrogate::new(2))],
        x_0: Some(grid),
        rng: Some(RngHandle::seeded(41)),
        trace: short_chains(300, 100),
        ..Default::default()
    })
    .unwrap();
    let sample = SampleStep::new(SampleStepOptions {
        surrogates: vec![Box::new(QuadraticSurrogate::new(2))],
        rng: Some(RngHandle::seeded(42)),
        trace: short_chains(400, 200),
        ..Default::default()
    })
    .unwrap();
    let post = PostStep::new(PostOptions {
        n_is: -1,
        k_trunc: 0.25,
    })
    .unwrap();
    let trace = RecipeTrace::new(Some(optimize), vec![sample], Some(post));
    let mut recipe = Recipe::new(Gaussian { mean: mean.clone() }, trace);

    let client = RayonClient::new(2).unwrap();
    recipe.run(Some(&client), -1).unwrap();
    assert!(recipe.trace().all_finished());

    let mode = recipe.trace().optimize_results().last().unwrap();
    assert!((mode.x_max[0] - mean[0]).abs() < 1e-4);
    assert!((mode.x_max[1] - mean[1]).abs() < 1e-4);
    // the quadratic reproduces the target exactly, so the four density
    // values at the mode agree
    let quartet = mode.f_max;
    assert!((quartet.logp - quartet.logq.unwrap()).abs() < 1e-6);

    // the loop stopped early, so the last two iterations satisfy both
    // convergence tolerances (eps_pp = eps_pq = 0.1)
    let iterations: Vec<_> = recipe
        .trace()
        .optimize_results()
        .iter()
        .filter(|r| r.chain.is_none())
        .collect();
    assert!(iterations.len() >= 2);
    let last = iterations[iterations.len() - 1].f_max;
    let prev = iterations[iterations.len() - 2].f_max;
    assert!((last.logp_trans - prev.logp_trans).abs() < 0.1);
    assert!((last.logp_trans - last.logq_trans.unwrap()).abs() < 0.1);

    let result = recipe.get().unwrap();
    let weights = result.weights.as_ref().unwrap();
    assert_eq!(weights.len(), 2 * 200);
    assert_eq!(result.samples.len(), result.samples_raw.len());
    for w in weights {
        assert!((w - 1.0).abs() < 1e-4, "unexpected weight {w}");
    }

    // every client-dispatched evaluation is accounted for
    let stage_records = recipe.trace().sample_results()[0]
        .records
        .as_ref()
        .unwrap()
        .len();
    let optimize_records: usize = recipe
        .trace()
        .optimize_results()
        .iter()
        .map(|r| r.records.as_ref().map_or(0, Vec::len))
        .sum();
    assert_eq!(
        recipe.trace().n_call(),
        optimize_records + stage_records + weights.len()
    );
}

#[test]
fn post_subsamples_to_the_requested_count() {
    let optimize = OptimizeStep::new(OptimizeOptions {
        x_0: Some(vec![vec![0.0]]),
        rng: Some(RngHandle::seeded(51)),
        ..Default::default()
    })
    .unwrap();
    let sample = SampleStep::new(SampleStepOptions {
        rng: Some(RngHandle::seeded(52)),
        trace: short_chains(300, 150),
        ..Default::default()
    })
    .unwrap();
    let post = PostStep::new(PostOptions {
        n_is: 50,
        k_trunc: 0.25,
    })
    .unwrap();
    let trace = RecipeTrace::new(Some(optimize), vec![sample], Some(post));
    let mut recipe = Recipe::new(Gaussian { mean: vec![0.7] }, trace);
    recipe.run_all().unwrap();

    let result = recipe.get().unwrap();
    assert_eq!(result.samples.len(), 50);
    assert_eq!(result.logq.len(), 50);
    assert_eq!(result.samples_raw.len(), 2 * 150);
    // the sampled density is the target itself, so reweighting is a no-op
    for w in result.weights.as_ref().unwrap() {
        assert!((w - 1.0).abs() < 1e-12);
    }
    assert_eq!(recipe.trace().n_call(), 50);
    assert_eq!(recipe.trace().status(Phase::Post), PhaseStatus::Finished);
}
