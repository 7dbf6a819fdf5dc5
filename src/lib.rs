pub(crate) mod client;
pub(crate) mod density;
pub(crate) mod error;
pub(crate) mod laplace;
pub(crate) mod math;
pub(crate) mod mcmc;
pub(crate) mod random;
pub(crate) mod recipe;
pub(crate) mod resample;
pub(crate) mod steps;
pub(crate) mod surrogate;
pub(crate) mod trace;

pub use client::{EvalClient, EvalFn, RayonClient};
pub use density::{
    Density, DensityHandle, EvalRecord, LogpFunc, ScopedSurrogates, SurrogateDensity, TrueDensity,
};
pub use error::{RecipeError, Result};
pub use laplace::{Laplace, LaplaceOptions, LaplaceResult};
pub use mcmc::{ChainRun, ChainSampler, ChainTrace, Metropolis, SampleOptions, SamplerTemplate};
pub use random::RngHandle;
pub use recipe::Recipe;
pub use resample::{resample, ResampleMethod, ResampleOptions};
pub use steps::{
    OptimizeOptions, OptimizeStep, PostOptions, PostStep, SampleStep, SampleStepOptions,
};
pub use surrogate::{QuadraticSurrogate, Surrogate};
pub use trace::{
    ChainStore, DensityQuartet, OptimizeResult, Phase, PhaseStatus, PostResult, RecipeTrace,
    SampleResult,
};
