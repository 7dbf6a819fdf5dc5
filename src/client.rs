//! Distributed evaluation client: a blocking scatter/gather barrier over
//! one batch of density evaluations.

use anyhow::{Context, Result};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::density::EvalRecord;

/// Evaluation function dispatched over a batch of original-space points.
pub type EvalFn<'a> = &'a (dyn Fn(&[f64]) -> Result<EvalRecord> + Sync);

/// The distributed map/gather collaborator.
///
/// Implementations must evaluate every point and return the results in
/// input order; partial batches are never consumed, so a single failed
/// point fails the whole gather.
pub trait EvalClient: Send + Sync {
    fn map_then_gather(&self, eval: EvalFn, points: &[Vec<f64>]) -> Result<Vec<EvalRecord>>;
}

/// In-process client backed by a rayon thread pool.
pub struct RayonClient {
    pool: rayon::ThreadPool,
}

impl RayonClient {
    /// `num_threads == 0` lets the pool pick one thread per core.
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("recipe-worker-{}", i))
            .build()
            .context("Could not start evaluation thread pool")?;
        Ok(Self { pool })
    }
}

impl EvalClient for RayonClient {
    fn map_then_gather(&self, eval: EvalFn, points: &[Vec<f64>]) -> Result<Vec<EvalRecord>> {
        self.pool
            .install(|| points.par_iter().map(|x| eval(x)).collect())
    }
}
