//! CLI entry point: turns parsed arguments into a bootstrapped or resumed
//! [`radseq_assemble::project::Project`] and hands it to the driver.

#[macro_use]
extern crate log;

use std::{fs::File, path::Path};

use located_error::prelude::*;
use parser::{Cli, Commands, Common, Hackers, Params};
use radseq_assemble::project::{Project, Sample, SampleState};
use serde::Deserialize;

/// On-disk shape of the `--params` YAML file: the core parameter set plus
/// the optional power-user knobs, kept as two top-level keys so a project
/// can omit `hackers` entirely and fall back to its defaults.
#[derive(Debug, Deserialize)]
struct ParamsFile {
    params: Params,
    #[serde(default)]
    hackers: Hackers,
}

fn project_name(params_path: &Path) -> String {
    let stem = params_path.file_stem().and_then(|s| s.to_str()).unwrap_or("radseq");
    stem.strip_prefix("params-").unwrap_or(stem).to_string()
}

fn load_params_file(path: &Path) -> anyhow::Result<ParamsFile> {
    let file = File::open(path).with_loc(|| format!("While opening params file '{}'", path.display()))?;
    serde_yaml::from_reader(file).with_loc(|| format!("While parsing params file '{}'", path.display()))
}

/// Discover every sample's already demultiplexed and trimmed FASTQ file(s)
/// under `params.sorted_fastq_dir` and seed a fresh [`Sample`] entry for
/// each, at [`SampleState::TRIMMED`] since stages 1-2 are produced
/// externally (spec §1, §5).
fn discover_samples(dir: &Path) -> anyhow::Result<Vec<Sample>> {
    if dir.as_os_str().is_empty() {
        return Ok(Vec::new());
    }
    if !dir.is_dir() {
        return Err(anyhow::anyhow!("sorted_fastq_dir '{}' is not a directory", dir.display())).loc("While bootstrapping samples");
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_loc(|| format!("While reading sorted_fastq_dir '{}'", dir.display()))? {
        let path = entry.with_loc(|| format!("While listing sorted_fastq_dir '{}'", dir.display()))?.path();
        if path.is_file() {
            files.push(path);
        }
    }

    let pairs = radseq_io::fastq::discover_pairs(&files).loc("While pairing FASTQ files by sample name")?;
    let mut samples = Vec::with_capacity(pairs.len());
    for (r1, r2) in pairs {
        let name = r1
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.split(['_', '.']).next().unwrap_or(s).to_string())
            .ok_or_else(|| anyhow::anyhow!("could not derive a sample name from '{}'", r1.display()))
            .loc("While bootstrapping samples")?;
        let mut sample = Sample::new(name);
        sample.state = SampleState::TRIMMED;
        sample.fastq_r1 = Some(r1);
        sample.fastq_r2 = r2;
        samples.push(sample);
    }
    Ok(samples)
}

/// Load a resumed project from its JSON document, or bootstrap a new one
/// from `--params` and the discovered FASTQ inputs.
fn open_project(common: &Common, overwrite: bool) -> anyhow::Result<Project> {
    let name = project_name(&common.params);
    if !overwrite {
        if let Ok(project) = Project::load(&common.output_dir, &name) {
            info!("resuming project '{name}' from {}", common.output_dir.display());
            return Ok(project);
        }
    }

    let ParamsFile { params, hackers } = load_params_file(&common.params)?;
    params.validate().loc("While validating pipeline parameters")?;
    let mut project = Project::new(name.clone(), common.output_dir.clone(), params.clone(), hackers);
    for sample in discover_samples(&params.sorted_fastq_dir)? {
        project.samples.insert(sample.name.clone(), sample);
    }
    info!("bootstrapped project '{name}' with {} sample(s)", project.samples.len());
    Ok(project)
}

/// Dispatch a parsed CLI invocation: run the requested stages over a
/// bootstrapped-or-resumed project, or replay a previously serialized one.
///
/// # Errors
/// Propagates parameter validation, project bootstrap/resume, and pipeline
/// stage failures.
pub fn run(cli: &Cli) -> anyhow::Result<()> {
    match &cli.commands {
        Commands::Run { common, steps, force } => {
            let steps = parser::parse_steps(steps).loc("While parsing --steps")?;
            let mut project = open_project(common, common.overwrite)?;
            radseq_assemble::run(&mut project, &steps, common.cores, *force, cli.quiet)
        }
        Commands::FromYaml { yaml } => {
            let replayed = Cli::deserialize(yaml).with_loc(|| format!("While replaying arguments from '{}'", yaml.display()))?;
            run(&replayed)
        }
    }
}
