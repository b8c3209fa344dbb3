use thiserror::Error;

/// The per-sample, per-stage error taxonomy from spec §7. `ParamError`
/// lives in the `parser` crate since it's surfaced before any stage starts;
/// everything here is scoped to a running stage.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssembleError {
    /// A malformed file produced by a prior stage or external tool. Fatal
    /// for the affected sample; other samples proceed.
    #[error("malformed {file_kind} for sample '{sample}': {detail}")]
    FormatError { sample: String, file_kind: &'static str, detail: String },

    /// Non-zero exit or non-parseable output from an external aligner,
    /// clusterer, sorter or indexer. Fatal for the affected sample.
    #[error("external tool '{tool}' failed for sample '{sample}': {detail}")]
    ExternalToolError { sample: String, tool: &'static str, detail: String },

    /// No clusters pass threshold, or zero loci survive filtering.
    /// Non-fatal for sample-scoped stages (the sample is marked skipped);
    /// fatal at stage 7 if no loci survive globally.
    #[error("insufficient data for sample '{sample}': {reason}")]
    InsufficientData { sample: String, reason: String },

    /// Non-finite base frequencies during (H, E) estimation. Treated as
    /// `InsufficientData` for that sample's estimate.
    #[error("non-finite base frequencies while estimating (H, E) for sample '{sample}'")]
    BadStack { sample: String },
}

impl AssembleError {
    #[must_use]
    pub fn sample(&self) -> &str {
        match self {
            AssembleError::FormatError { sample, .. }
            | AssembleError::ExternalToolError { sample, .. }
            | AssembleError::InsufficientData { sample, .. }
            | AssembleError::BadStack { sample } => sample,
        }
    }
}
