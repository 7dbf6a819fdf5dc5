//! Importance-style resampling over log-weights.

use rand::Rng;
use rand_chacha::ChaCha8Rng;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResampleMethod {
    /// Single stratified uniform sweep over the cumulative weights.
    #[default]
    Systematic,
    /// Independent draws from the weight distribution.
    Multinomial,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ResampleOptions {
    pub method: ResampleMethod,
}

/// Draws `n` candidate indices weighted by `exp(logq)` (with replacement;
/// the caller decides whether chosen entries leave the pool).
///
/// Non-finite log-weights get zero weight. If every weight vanishes the
/// draw falls back to uniform.
pub fn resample(
    logq: &[f64],
    n: usize,
    options: &ResampleOptions,
    rng: &mut ChaCha8Rng,
) -> Vec<usize> {
    if logq.is_empty() || n == 0 {
        return Vec::new();
    }
    let max = logq
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    let mut weights: Vec<f64> = logq
        .iter()
        .map(|&v| if v.is_finite() { (v - max).exp() } else { 0.0 })
        .collect();
    let total: f64 = weights.iter().sum();
    if !(total > 0.0) || !total.is_finite() {
        weights.iter_mut().for_each(|w| *w = 1.0);
    }
    let total: f64 = weights.iter().sum();

    match options.method {
        ResampleMethod::Systematic => {
            let step = total / n as f64;
            let mut u = rng.random::<f64>() * step;
            let mut cumulative = 0.0;
            let mut idx = 0usize;
            let mut chosen = Vec::with_capacity(n);
            for _ in 0..n {
                while cumulative + weights[idx] < u && idx + 1 < weights.len() {
                    cumulative += weights[idx];
                    idx += 1;
                }
                chosen.push(idx);
                u += step;
            }
            chosen
        }
        ResampleMethod::Multinomial => (0..n)
            .map(|_| {
                let u = rng.random::<f64>() * total;
                let mut cumulative = 0.0;
                for (i, w) in weights.iter().enumerate() {
                    cumulative += w;
                    if u <= cumulative {
                        return i;
                    }
                }
                weights.len() - 1
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn indices_stay_in_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let logq = vec![-1.0, -2.0, -0.5, -3.0];
        for method in [ResampleMethod::Systematic, ResampleMethod::Multinomial] {
            let idx = resample(&logq, 10, &ResampleOptions { method }, &mut rng);
            assert_eq!(idx.len(), 10);
            assert!(idx.iter().all(|&i| i < logq.len()));
        }
    }

    #[test]
    fn concentrates_on_the_dominant_weight() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut logq = vec![-100.0; 50];
        logq[17] = 0.0;
        let idx = resample(&logq, 20, &ResampleOptions::default(), &mut rng);
        assert!(idx.iter().all(|&i| i == 17));
    }

    #[test]
    fn non_finite_weights_are_ignored() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let logq = vec![f64::NEG_INFINITY, 0.0, f64::NAN];
        let idx = resample(&logq, 8, &ResampleOptions::default(), &mut rng);
        assert!(idx.iter().all(|&i| i == 1));
    }

    #[test]
    fn all_zero_weights_fall_back_to_uniform() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let logq = vec![f64::NEG_INFINITY; 4];
        let idx = resample(&logq, 100, &ResampleOptions::default(), &mut rng);
        assert!(idx.iter().any(|&i| i != idx[0]));
    }

    proptest::proptest! {
        #[test]
        fn returns_n_valid_indices(
            logq in proptest::collection::vec(-1e3f64..1e3, 1..40),
            n in 0usize..30,
            seed in 0u64..1000,
        ) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            for method in [ResampleMethod::Systematic, ResampleMethod::Multinomial] {
                let idx = resample(&logq, n, &ResampleOptions { method }, &mut rng);
                proptest::prop_assert_eq!(idx.len(), n);
                proptest::prop_assert!(idx.iter().all(|&i| i < logq.len()));
            }
        }
    }
}
