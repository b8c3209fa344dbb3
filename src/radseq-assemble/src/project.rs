//! The project data model (spec §3): samples, their monotonic state, and the
//! canonical JSON document that's re-read on every resume.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use located_error::prelude::*;
use parser::{Hackers, Params};
use serde::{Deserialize, Serialize};

/// Monotonic integer 1..7 recording the last completed stage for a sample.
/// Transitions are one-way: a stage requires the prior state and, on
/// success, advances by exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleState(u8);

impl SampleState {
    pub const DEMULTIPLEXED: SampleState = SampleState(1);
    pub const TRIMMED: SampleState = SampleState(2);
    pub const CLUSTERED: SampleState = SampleState(3);
    pub const ESTIMATED: SampleState = SampleState(4);
    pub const CONSENSUS: SampleState = SampleState(5);
    pub const ACROSS_CLUSTERED: SampleState = SampleState(6);
    pub const OUTPUT: SampleState = SampleState(7);

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Attempt to advance to `next`, which must be exactly this state + 1.
    ///
    /// # Errors
    /// Returns an error describing the illegal transition otherwise.
    pub fn advance_to(self, next: u8) -> anyhow::Result<SampleState> {
        if next != self.0 + 1 {
            return Err(anyhow::anyhow!(
                "illegal sample state transition: {} -> {next} (states only advance by exactly one)",
                self.0
            ))
            .loc("While advancing sample state");
        }
        Ok(SampleState(next))
    }
}

/// Per-stage statistics recorded for a sample. Only the fields relevant to
/// the core stages (3-5, 7) are modeled; earlier/later stage-specific stats
/// are folded into `extra` to keep the JSON document forward compatible.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleStats {
    pub reads_raw: u64,
    pub reads_passed_filter: u64,
    pub clusters_total: u64,
    pub clusters_hidepth: u64,
    /// Histogram of cluster depths, truncated to bins 1..25 (supplemented
    /// feature C.3: exposed for reporting, not just an internal scratch
    /// value).
    pub depth_histogram: [u64; 25],
    pub max_frag: u32,
    pub heterozygosity: Option<f64>,
    pub error_rate: Option<f64>,
    pub consensus_loci: u64,
    pub filtered_depth: u64,
    pub filtered_maxh: u64,
    pub filtered_maxn: u64,
    pub filtered_maxalleles: u64,
    pub skip_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub name: String,
    pub state: SampleState,
    pub fastq_r1: Option<PathBuf>,
    pub fastq_r2: Option<PathBuf>,
    pub cluster_file: Option<PathBuf>,
    pub consensus_file: Option<PathBuf>,
    pub stats: SampleStats,
}

impl Sample {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: SampleState::DEMULTIPLEXED,
            fastq_r1: None,
            fastq_r2: None,
            cluster_file: None,
            consensus_file: None,
            stats: SampleStats::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssemblyStats {
    pub total_loci: u64,
    pub filtered_dups: u64,
    pub filtered_minsamp: u64,
    pub filtered_maxind: u64,
    pub filtered_maxvar: u64,
    pub filtered_maxshared: u64,
    pub total_snps: u64,
    pub total_pis: u64,
}

/// Aggregates every mutable piece of pipeline state. Persisted as a single
/// canonical JSON document after every stage; resuming always re-reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub output_dir: PathBuf,
    pub params: Params,
    pub hackers: Hackers,
    pub samples: HashMap<String, Sample>,
    pub stats: AssemblyStats,
}

impl Project {
    #[must_use]
    pub fn new(name: impl Into<String>, output_dir: PathBuf, params: Params, hackers: Hackers) -> Self {
        Self { name: name.into(), output_dir, params, hackers, samples: HashMap::new(), stats: AssemblyStats::default() }
    }

    fn json_path(output_dir: &Path, name: &str) -> PathBuf {
        output_dir.join(format!("{name}.json"))
    }

    /// Persist the project as a canonical JSON document. Called at the end
    /// of every stage; never called from within a worker (§5: "The project
    /// JSON file is owned exclusively by the driver").
    ///
    /// # Errors
    /// Propagates filesystem and serialization failures.
    pub fn save(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.output_dir)
            .with_loc(|| format!("While creating output directory '{}'", self.output_dir.display()))?;
        let path = Self::json_path(&self.output_dir, &self.name);
        let serialized = serde_json::to_string_pretty(self).loc("While serializing the project to JSON")?;
        fs::write(&path, serialized).with_loc(|| format!("While writing project JSON to '{}'", path.display()))
    }

    /// Re-read a previously persisted project. Resuming a pipeline always
    /// goes through this path.
    ///
    /// # Errors
    /// Propagates filesystem and deserialization failures.
    pub fn load(output_dir: &Path, name: &str) -> anyhow::Result<Self> {
        let path = Self::json_path(output_dir, name);
        let contents = fs::read_to_string(&path).with_loc(|| format!("While reading project JSON from '{}'", path.display()))?;
        serde_json::from_str(&contents).with_loc(|| format!("While deserializing project JSON from '{}'", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_advances_by_exactly_one() {
        let s = SampleState::DEMULTIPLEXED;
        assert_eq!(s.advance_to(2).unwrap(), SampleState::TRIMMED);
        assert!(s.advance_to(3).is_err());
        assert!(s.advance_to(1).is_err());
    }

    #[test]
    fn project_roundtrips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = Project::new("demo", dir.path().to_path_buf(), Params::default(), Hackers::default());
        project.samples.insert("sampleA".into(), Sample::new("sampleA"));
        project.save().unwrap();

        let reloaded = Project::load(dir.path(), "demo").unwrap();
        assert_eq!(reloaded.samples.len(), 1);
        assert_eq!(reloaded.samples["sampleA"].state, SampleState::DEMULTIPLEXED);
    }
}
