use thiserror::Error;

/// `ParamError` in the spec's error taxonomy (§7): fatal, surfaced before
/// any stage starts.
#[derive(Error, Debug)]
pub enum ParamError {
    #[error("clust_threshold must lie in (0, 1], got {0}")]
    InvalidClustThreshold(f64),

    #[error("min_depth_statistical ({stat}) must be >= min_depth_majrule ({majrule})")]
    DepthOrdering { majrule: u32, stat: u32 },

    #[error("max_alleles_consens must be 1, 2, or 3, got {0}")]
    InvalidMaxAlleles(u8),

    #[error("restriction_overhang must list 1 or 2 short sequences, got {0}")]
    InvalidOverhangCount(usize),

    #[error("{0} must lie in [0.0, 1.0], got {1}")]
    InvalidFraction(&'static str, f64),

    #[error("{0} {1} does not exist")]
    MissingFileEntity(&'static str, String),

    #[error("'{0}' already exists. Use --overwrite to force.")]
    CannotOverwrite(String),

    #[error("unrecognized datatype '{0}'")]
    UnknownDatatype(String),
}
