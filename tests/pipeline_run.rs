//! End-to-end coverage of the CLI entry point: resuming a project already
//! clustered on disk and driving it through estimate/consensus/across-sample
//! steps to final output, the same path a real re-invocation of the binary
//! takes (stages 1-3 are skipped here since they shell out to external tools
//! not guaranteed present in a test environment).

use std::fs;

use parser::{Cli, Commands, Common, Hackers, Params};
use pretty_assertions::assert_eq;
use radseq_assemble::project::{Project, Sample, SampleState};
use radseq_io::{write_clusters, Cluster, DerepRead, Orient};

fn seed_cluster(name: &str, sequence: &str) -> Cluster {
    Cluster { rows: vec![DerepRead { name: name.to_string(), tag: None, size: 10, orient: Orient::Seed, sequence: sequence.to_string() }] }
}

fn cli(params_path: std::path::PathBuf, output_dir: std::path::PathBuf, steps: &str) -> Cli {
    Cli {
        verbose: 0,
        quiet: true,
        commands: Commands::Run { common: Common { params: params_path, output_dir, cores: 1, overwrite: false }, steps: steps.to_string(), force: false },
    }
}

#[test]
fn resumed_project_runs_to_final_loci_output() {
    let dir = tempfile::tempdir().unwrap();
    let params_path = dir.path().join("params-island.yaml");
    fs::write(&params_path, "params:\n  sorted_fastq_dir: \"\"\n  datatype: rad\n  restriction_overhang: [\"TGCAG\"]\n  clust_threshold: 0.85\n  min_depth_majrule: 6\n  min_depth_statistical: 6\n  max_depth: 10000\n  filter_min_trim_len: 35\n  max_h_consens: 0.05\n  max_n_consens: 0.05\n  max_alleles_consens: 2\n  max_indels_locus: 8\n  max_snps_locus: 20\n  max_shared_h_locus: 0.5\n  min_samples_locus: 2\n").unwrap();
    let output_dir = dir.path().join("out");

    let mut params = Params::default();
    params.min_samples_locus = 2;
    let mut project = Project::new("island", output_dir.clone(), params, Hackers::default());

    for name in ["coral", "kelp"] {
        let mut sample = Sample::new(name);
        sample.state = SampleState::CLUSTERED;
        let clusters: Vec<Cluster> = (0..8).map(|i| seed_cluster(&format!("locus_{i}"), "ACGTACGTACGTACGTACGTACGTACGTACGTACGTACGT")).collect();
        let sample_dir = output_dir.join(name);
        fs::create_dir_all(&sample_dir).unwrap();
        let cluster_file = sample_dir.join(format!("{name}.clusters"));
        write_clusters(fs::File::create(&cluster_file).unwrap(), clusters).unwrap();
        sample.cluster_file = Some(cluster_file);
        project.samples.insert(name.to_string(), sample);
    }
    project.save().unwrap();

    let cli = cli(params_path, output_dir.clone(), "4-7");
    radseq_assemble_cli::run(&cli).unwrap();

    let reloaded = Project::load(&output_dir, "island").unwrap();
    assert!(reloaded.samples.values().all(|s| s.state == SampleState::OUTPUT));
    assert_eq!(reloaded.stats.total_loci, 8);
    assert!(output_dir.join("island.loci").exists());
    assert!(output_dir.join("island.seqs.tsv").exists());
    assert!(output_dir.join("island.snps.tsv").exists());
}

#[test]
fn steps_outside_the_core_range_are_skipped_without_error() {
    let dir = tempfile::tempdir().unwrap();
    let params_path = dir.path().join("params-empty.yaml");
    fs::write(&params_path, "params:\n  sorted_fastq_dir: \"\"\n  datatype: rad\n  restriction_overhang: [\"TGCAG\"]\n  clust_threshold: 0.85\n  min_depth_majrule: 6\n  min_depth_statistical: 6\n  max_depth: 10000\n  filter_min_trim_len: 35\n  max_h_consens: 0.05\n  max_n_consens: 0.05\n  max_alleles_consens: 2\n  max_indels_locus: 8\n  max_snps_locus: 20\n  max_shared_h_locus: 0.5\n  min_samples_locus: 1\n").unwrap();
    let output_dir = dir.path().join("out");

    let cli = cli(params_path, output_dir, "1,2");
    radseq_assemble_cli::run(&cli).unwrap();
}
