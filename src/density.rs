//! The density collaborator interface and the handle the pipeline owns.
//!
//! The pipeline never looks inside the target density. It sees a log
//! probability in transformed coordinates, optional analytic gradients,
//! and the coordinate transforms between original and transformed space.
//! `DensityHandle` pairs the density with the mutable active surrogate
//! list that phase controllers swap in and out.

use anyhow::Result;

use crate::surrogate::Surrogate;

/// The target log-density being inferred.
///
/// All transform methods default to the identity, for densities defined
/// directly on an unconstrained space.
pub trait Density: Send + Sync {
    fn dim(&self) -> usize;

    /// True log-density in transformed coordinates.
    fn logp_trans(&self, x_trans: &[f64]) -> Result<f64>;

    /// Analytic gradient in transformed coordinates, if available.
    fn grad_trans(&self, _x_trans: &[f64]) -> Option<Vec<f64>> {
        None
    }

    fn to_original(&self, x_trans: &[f64]) -> Vec<f64> {
        x_trans.to_vec()
    }

    fn from_original(&self, x: &[f64]) -> Vec<f64> {
        x.to_vec()
    }

    /// Convert a transformed-space density value at original point `x`
    /// into original coordinates (adds the log-Jacobian term).
    fn to_original_density(&self, logp_trans: f64, _x: &[f64]) -> f64 {
        logp_trans
    }

    /// Inverse of [`Density::to_original_density`].
    fn from_original_density(&self, logp: f64, _x: &[f64]) -> f64 {
        logp
    }
}

/// One true-density evaluation.
#[derive(Clone, Debug)]
pub struct EvalRecord {
    /// Evaluation point, original coordinates.
    pub x: Vec<f64>,
    /// Evaluation point, transformed coordinates.
    pub x_trans: Vec<f64>,
    /// Log-density, original coordinates.
    pub logp: f64,
    /// Log-density, transformed coordinates.
    pub logp_trans: f64,
}

/// The view optimizers and chain samplers get of a density: a plain
/// log-probability over transformed coordinates.
pub trait LogpFunc: Sync {
    fn dim(&self) -> usize;
    fn logp(&self, x_trans: &[f64]) -> Result<f64>;
    fn grad(&self, _x_trans: &[f64]) -> Option<Vec<f64>> {
        None
    }
}

/// Owns the density together with the active surrogate list.
///
/// The surrogate list is mutable shared state: each controller installs
/// the surrogates it works with before evaluating or fitting, and either
/// leaves them as the stage's final choice or restores the previous list
/// through [`DensityHandle::scoped_surrogates`].
pub struct DensityHandle<D: Density> {
    density: D,
    surrogates: Vec<Box<dyn Surrogate>>,
}

impl<D: Density> DensityHandle<D> {
    pub fn new(density: D) -> Self {
        Self {
            density,
            surrogates: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.density.dim()
    }

    pub fn density(&self) -> &D {
        &self.density
    }

    pub fn surrogates(&self) -> &[Box<dyn Surrogate>] {
        &self.surrogates
    }

    /// Installs a new active surrogate list, returning the previous one.
    pub fn set_surrogates(
        &mut self,
        surrogates: Vec<Box<dyn Surrogate>>,
    ) -> Vec<Box<dyn Surrogate>> {
        std::mem::replace(&mut self.surrogates, surrogates)
    }

    /// Installs `surrogates` for the lifetime of the returned guard; the
    /// previous list is restored when the guard drops, on every exit path.
    pub fn scoped_surrogates(
        &mut self,
        surrogates: Vec<Box<dyn Surrogate>>,
    ) -> ScopedSurrogates<'_, D> {
        let saved = self.set_surrogates(surrogates);
        ScopedSurrogates {
            handle: self,
            saved: Some(saved),
        }
    }

    /// Fits every active surrogate on the given evaluation records.
    pub fn fit(&mut self, records: &[EvalRecord]) -> Result<()> {
        for surrogate in self.surrogates.iter_mut() {
            surrogate.fit(records)?;
        }
        Ok(())
    }

    /// Evaluates the true density at an original-space point.
    pub fn evaluate(&self, x: &[f64]) -> Result<EvalRecord> {
        let x_trans = self.density.from_original(x);
        let logp_trans = self.density.logp_trans(&x_trans)?;
        let logp = self.density.to_original_density(logp_trans, x);
        Ok(EvalRecord {
            x: x.to_vec(),
            x_trans,
            logp,
            logp_trans,
        })
    }

    /// Approximate log-density from the active surrogates, transformed
    /// coordinates. Multiple surrogates contribute additively.
    pub fn logq_trans(&self, x_trans: &[f64]) -> f64 {
        self.surrogates
            .iter()
            .map(|s| s.logp_trans(x_trans))
            .sum()
    }

    pub fn true_view(&self) -> TrueDensity<'_, D> {
        TrueDensity { handle: self }
    }

    pub fn surrogate_view(&self) -> SurrogateDensity<'_, D> {
        SurrogateDensity { handle: self }
    }
}

/// Restores the previously active surrogate list on drop.
pub struct ScopedSurrogates<'a, D: Density> {
    handle: &'a mut DensityHandle<D>,
    saved: Option<Vec<Box<dyn Surrogate>>>,
}

impl<D: Density> ScopedSurrogates<'_, D> {
    pub fn handle(&self) -> &DensityHandle<D> {
        self.handle
    }

    pub fn handle_mut(&mut self) -> &mut DensityHandle<D> {
        self.handle
    }
}

impl<D: Density> Drop for ScopedSurrogates<'_, D> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.handle.surrogates = saved;
        }
    }
}

pub struct TrueDensity<'a, D: Density> {
    handle: &'a DensityHandle<D>,
}

impl<D: Density> LogpFunc for TrueDensity<'_, D> {
    fn dim(&self) -> usize {
        self.handle.dim()
    }

    fn logp(&self, x_trans: &[f64]) -> Result<f64> {
        self.handle.density.logp_trans(x_trans)
    }

    fn grad(&self, x_trans: &[f64]) -> Option<Vec<f64>> {
        self.handle.density.grad_trans(x_trans)
    }
}

pub struct SurrogateDensity<'a, D: Density> {
    handle: &'a DensityHandle<D>,
}

impl<D: Density> LogpFunc for SurrogateDensity<'_, D> {
    fn dim(&self) -> usize {
        self.handle.dim()
    }

    fn logp(&self, x_trans: &[f64]) -> Result<f64> {
        Ok(self.handle.logq_trans(x_trans))
    }
}
