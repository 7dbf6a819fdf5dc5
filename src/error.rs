use thiserror::Error;

/// Everything that can go wrong while configuring or running a recipe.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RecipeError {
    #[error("invalid value for `{field}`: {reason}")]
    Config {
        field: &'static str,
        reason: String,
    },
    #[error("not enough evaluation points: needed {needed}, got {available}")]
    InsufficientPoints { needed: usize, available: usize },
    #[error(
        "not enough samples above the density cutoff: kept {kept} of the \
         required {needed}, and the candidate pool is exhausted"
    )]
    InsufficientSamples { kept: usize, needed: usize },
    #[error("no samples to post-process")]
    NoSamples,
    #[error("the post phase has not produced a result yet")]
    NoPostResult,
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    /// Failure inside a collaborator: the target density, a surrogate
    /// fit, the chain sampler or the evaluation client.
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RecipeError>;
