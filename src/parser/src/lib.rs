use std::{
    collections::HashMap,
    ffi::OsStr,
    fmt::{self, Display, Formatter},
    fs::File,
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use located_error::prelude::*;
use serde::{Deserialize, Serialize};

mod error;
pub use error::ParamError;

/// The six supported RAD library preparation flavors. Affects strand-search
/// direction and query-coverage defaults in the derep/cluster driver (C2)
/// and whether the GBS edge-trim filter applies in the chunked aligner (C3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    Rad,
    Gbs,
    Ddrad,
    Pairddrad,
    Pairgbs,
    #[serde(rename = "2brad")]
    TwoBrad,
}

impl Datatype {
    #[must_use]
    pub fn is_paired(self) -> bool {
        matches!(self, Datatype::Pairddrad | Datatype::Pairgbs)
    }

    #[must_use]
    pub fn is_gbs_like(self) -> bool {
        matches!(self, Datatype::Gbs | Datatype::Pairgbs)
    }

    /// Default `(query_cov, min_seed_cov)` used by the derep/cluster driver
    /// (C2) when the user hasn't overridden `--query-cov`.
    #[must_use]
    pub fn default_coverage(self) -> (f64, f64) {
        if self.is_paired() && self.is_gbs_like() {
            (0.75, 0.75)
        } else {
            (0.5, 0.5)
        }
    }
}

impl std::str::FromStr for Datatype {
    type Err = ParamError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rad" => Ok(Datatype::Rad),
            "gbs" => Ok(Datatype::Gbs),
            "ddrad" => Ok(Datatype::Ddrad),
            "pairddrad" => Ok(Datatype::Pairddrad),
            "pairgbs" => Ok(Datatype::Pairgbs),
            "2brad" => Ok(Datatype::TwoBrad),
            other => Err(ParamError::UnknownDatatype(other.to_string())),
        }
    }
}

impl Display for Datatype {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Datatype::Rad => "rad",
            Datatype::Gbs => "gbs",
            Datatype::Ddrad => "ddrad",
            Datatype::Pairddrad => "pairddrad",
            Datatype::Pairgbs => "pairgbs",
            Datatype::TwoBrad => "2brad",
        };
        write!(f, "{s}")
    }
}

/// A named subset of samples with a minimum per-population locus coverage
/// requirement (§4.7's min-sample-cov filter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Population {
    pub members: Vec<String>,
    pub mincov: u32,
}

/// The core-relevant parameter set (§6). Immutable once a stage has started
/// running against a given [`crate::Cli`] invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Params {
    /// Directory of already demultiplexed and adapter-trimmed per-sample
    /// FASTQ files (stages 1-2's external output), one or two files per
    /// sample. Only consulted when bootstrapping a new project; resumed
    /// projects read sample paths back from their own JSON document.
    #[serde(default)]
    pub sorted_fastq_dir: PathBuf,
    pub datatype: Datatype,
    pub restriction_overhang: Vec<String>,
    pub clust_threshold: f64,
    pub min_depth_majrule: u32,
    pub min_depth_statistical: u32,
    pub max_depth: u32,
    pub filter_min_trim_len: u32,
    pub max_h_consens: f64,
    pub max_n_consens: f64,
    pub max_alleles_consens: u8,
    pub max_indels_locus: u32,
    pub max_snps_locus: u32,
    pub max_shared_h_locus: f64,
    pub min_samples_locus: u32,
    #[serde(default)]
    pub populations: HashMap<String, Population>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            sorted_fastq_dir: PathBuf::new(),
            datatype: Datatype::Rad,
            restriction_overhang: vec!["TGCAG".to_string()],
            clust_threshold: 0.85,
            min_depth_majrule: 6,
            min_depth_statistical: 6,
            max_depth: 10_000,
            filter_min_trim_len: 35,
            max_h_consens: 0.05,
            max_n_consens: 0.05,
            max_alleles_consens: 2,
            max_indels_locus: 8,
            max_snps_locus: 20,
            max_shared_h_locus: 0.5,
            min_samples_locus: 4,
            populations: HashMap::new(),
        }
    }
}

impl Params {
    /// Validate the parameter set. This is the "ParamError (bad user
    /// input): fatal, surfaced before any stage starts" rule from §7.
    ///
    /// # Errors
    /// [`ParamError`] describing the first invalid field encountered.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.clust_threshold > 0.0 && self.clust_threshold <= 1.0) {
            return Err(ParamError::InvalidClustThreshold(self.clust_threshold)).loc("While validating params");
        }
        if self.min_depth_statistical < self.min_depth_majrule {
            return Err(ParamError::DepthOrdering {
                majrule: self.min_depth_majrule,
                stat: self.min_depth_statistical,
            })
            .loc("While validating params");
        }
        if !(1..=3).contains(&self.max_alleles_consens) {
            return Err(ParamError::InvalidMaxAlleles(self.max_alleles_consens)).loc("While validating params");
        }
        if self.restriction_overhang.is_empty() || self.restriction_overhang.len() > 2 {
            return Err(ParamError::InvalidOverhangCount(self.restriction_overhang.len()))
                .loc("While validating params");
        }
        for (name, value) in [("max_h_consens", self.max_h_consens), ("max_n_consens", self.max_n_consens), ("max_shared_h_locus", self.max_shared_h_locus)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ParamError::InvalidFraction(name, value)).loc("While validating params");
            }
        }
        Ok(())
    }
}

/// Power-user knobs that sit alongside [`Params`] but don't affect the
/// canonical output shape when left at their defaults (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hackers {
    pub declone_pcr_duplicates: bool,
    pub exclude_reference: bool,
    pub query_cov: Option<f64>,
    pub merge_technical_replicates: bool,
    /// Max internal indels tolerated when grouping derep/cluster hits (C2).
    pub max_internal_indels_derep: u32,
    /// Max internal indels tolerated per row after alignment (C3).
    pub max_internal_indels_align: u32,
}

impl Default for Hackers {
    fn default() -> Self {
        Self {
            declone_pcr_duplicates: false,
            exclude_reference: false,
            query_cov: None,
            merge_technical_replicates: false,
            max_internal_indels_derep: 6,
            max_internal_indels_align: 5,
        }
    }
}

#[derive(Parser, Debug, Serialize, Deserialize)]
#[clap(name = "radseq-assemble", author, version, about, long_about = None)]
#[clap(propagate_version = true)]
/// A RADseq assembly pipeline: demultiplex, trim, cluster, call consensus, and output loci.
pub struct Cli {
    /// Set the verbosity level (-v -vv -vvv)
    ///
    /// -v: Info | -vv: Debug | -vvv: Trace{n}
    /// Warnings are still emitted by default; use --quiet to disable them.
    #[clap(short = 'v', long, parse(from_occurrences), global = true)]
    pub verbose: u8,

    /// Disable warnings; only errors are displayed.
    #[clap(short = 'q', long, global = true)]
    pub quiet: bool,

    #[clap(subcommand)]
    pub commands: Commands,
}

#[derive(Subcommand, Debug, Serialize, Deserialize)]
pub enum Commands {
    /// Run the named stages of the pipeline (e.g. "3,4,5" or "1-7").
    Run {
        #[clap(flatten)]
        common: Common,

        /// Stage numbers to run, comma/range separated (1-7). Default: all.
        #[clap(short, long, default_value = "1-7")]
        steps: String,

        /// Re-run stages even if the sample's recorded state already passed them.
        #[clap(short, long)]
        force: bool,
    },

    /// Re-run a previous invocation from its serialized `.yaml` arguments.
    FromYaml { yaml: PathBuf },
}

#[derive(Parser, Debug, Serialize, Deserialize)]
pub struct Common {
    /// Path to the project's parameter file (YAML).
    #[clap(short, long, parse(try_from_os_str=valid_input_file))]
    pub params: PathBuf,

    /// Output directory for the project's JSON document and stage artifacts.
    #[clap(short, long, default_value("radseq-output"), parse(try_from_os_str=valid_output_dir))]
    pub output_dir: PathBuf,

    /// Number of worker threads (defaults to available cores).
    #[clap(short = '@', long, default_value = "0")]
    pub cores: usize,

    /// Overwrite existing output files.
    #[clap(short = 'w', long)]
    pub overwrite: bool,
}

impl Cli {
    /// Serialize command line arguments to a timestamped `.yaml` file next
    /// to the project's output directory.
    ///
    /// # Errors
    /// Propagates `serde_yaml` serialization failures and filesystem errors.
    pub fn serialize(&self) -> anyhow::Result<()> {
        let serialized = serde_yaml::to_string(&self).loc("While serializing command line arguments")?;
        log::debug!("\n---- Command line args ----\n{serialized}\n---");

        let output_dir = match &self.commands {
            Commands::Run { common, .. } => common.output_dir.clone(),
            Commands::FromYaml { .. } => return Ok(()),
        };
        let current_time = chrono::offset::Local::now().format("%Y-%m-%dT%H%M%S").to_string();
        let output_file = output_dir.join(format!("{current_time}-radseq-assemble.yaml"));
        std::fs::write(&output_file, serialized)
            .with_loc(|| format!("While writing serialized arguments to '{}'", output_file.display()))
    }

    /// Deserialize a `.yaml` file into command line arguments.
    ///
    /// # Errors
    /// Propagates file-open and `serde_yaml` deserialization failures.
    pub fn deserialize(yaml: &Path) -> anyhow::Result<Self> {
        let file = File::open(yaml).with_loc(|| format!("While opening '{}'", yaml.display()))?;
        serde_yaml::from_reader(file).with_loc(|| format!("While deserializing '{}'", yaml.display()))
    }
}

/// Parse a `"1-7"`/`"3,4,5"` style stage-range string into a sorted, deduped
/// vector of stage numbers.
///
/// # Errors
/// Returns an error if any token fails to parse as an integer or range.
pub fn parse_steps(steps: &str) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    for token in steps.split(',') {
        let token = token.trim();
        match token.split_once('-') {
            Some((lo, hi)) => {
                let lo: u8 = lo.parse().loc("While parsing --steps range")?;
                let hi: u8 = hi.parse().loc("While parsing --steps range")?;
                out.extend(lo..=hi);
            }
            None => out.push(token.parse().loc("While parsing --steps")?),
        }
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

fn valid_input_file(s: &OsStr) -> anyhow::Result<PathBuf> {
    let path = Path::new(s);
    if !path.is_file() {
        return Err(ParamError::MissingFileEntity("File", path.display().to_string())).loc("While validating arguments");
    }
    Ok(path.to_path_buf())
}

fn valid_output_dir(s: &OsStr) -> anyhow::Result<PathBuf> {
    let path = Path::new(s);
    if !path.exists() {
        std::fs::create_dir_all(path).with_loc(|| format!("While creating output directory '{}'", path.display()))?;
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_params_are_valid() {
        Params::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_clust_threshold() {
        let mut p = Params::default();
        p.clust_threshold = 1.5;
        assert!(p.validate().is_err());
    }

    #[test]
    fn rejects_stat_below_majrule() {
        let mut p = Params::default();
        p.min_depth_statistical = 2;
        p.min_depth_majrule = 6;
        assert!(p.validate().is_err());
    }

    #[test]
    fn steps_parses_ranges_and_lists() {
        assert_eq!(parse_steps("1-3,5").unwrap(), vec![1, 2, 3, 5]);
        assert_eq!(parse_steps("7,1,1").unwrap(), vec![1, 7]);
    }

    #[test]
    fn datatype_defaults_match_pairing() {
        assert_eq!(Datatype::Pairgbs.default_coverage(), (0.75, 0.75));
        assert_eq!(Datatype::Rad.default_coverage(), (0.5, 0.5));
    }

    #[test]
    fn serialize_then_deserialize_roundtrips_a_run_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli {
            verbose: 2,
            quiet: false,
            commands: Commands::Run {
                common: Common { params: PathBuf::from("params-island.yaml"), output_dir: dir.path().to_path_buf(), cores: 4, overwrite: false },
                steps: "3-7".to_string(),
                force: false,
            },
        };
        cli.serialize().unwrap();

        let written = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap().path();
        let reloaded = Cli::deserialize(&written).unwrap();
        assert_eq!(reloaded.verbose, 2);
        match reloaded.commands {
            Commands::Run { steps, .. } => assert_eq!(steps, "3-7"),
            Commands::FromYaml { .. } => panic!("expected Run"),
        }
    }
}
