//! C2: dereplicate raw reads into unique sequences, then group the
//! clusterer's hit table back into clusters (spec §4.2).

use std::collections::HashMap;

use ahash::RandomState;
use parser::{Datatype, Hackers};
use radseq_io::{Cluster, DerepRead, FastqRecord, Orient};

use crate::error::AssembleError;

/// Dereplicate a set of trimmed reads into unique sequences, tagged with
/// their depth (`size=`). Ties are broken by first-seen order so the
/// function is deterministic given a deterministic input order.
#[must_use]
pub fn dereplicate(reads: &[FastqRecord]) -> Vec<DerepRead> {
    let mut counts: HashMap<&str, u32, RandomState> = HashMap::default();
    let mut first_seen: Vec<&str> = Vec::new();
    for read in reads {
        let entry = counts.entry(read.sequence.as_str()).or_insert_with(|| {
            first_seen.push(read.sequence.as_str());
            0
        });
        *entry += 1;
    }

    let mut derep: Vec<DerepRead> = first_seen
        .into_iter()
        .enumerate()
        .map(|(i, seq)| DerepRead {
            name: format!("read_{i}"),
            tag: None,
            size: counts[seq],
            orient: Orient::Seed,
            sequence: seq.to_string(),
        })
        .collect();

    // Descending size, longest sequence first among ties: the clusterer
    // is handed seeds in priority order.
    derep.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| b.sequence.len().cmp(&a.sequence.len())));
    derep
}

/// One row of the clusterer's `userout` hit table: `query target id% gaps
/// qstrand qcov`.
#[derive(Debug, Clone)]
pub struct Hit {
    pub query: String,
    pub target: String,
    pub identity_pct: f64,
    pub internal_indels: u32,
    pub minus_strand: bool,
    pub query_cov: f64,
}

/// Parse a clusterer `userout` TSV line into a [`Hit`].
///
/// # Errors
/// [`AssembleError::FormatError`] if the line doesn't have the expected
/// six tab-separated fields or a field fails to parse.
pub fn parse_hit_line(sample: &str, line: &str) -> Result<Hit, AssembleError> {
    let malformed = |detail: String| AssembleError::FormatError {
        sample: sample.to_string(),
        file_kind: "userout",
        detail,
    };
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 6 {
        return Err(malformed(format!("expected 6 tab-separated fields, got {}", fields.len())));
    }
    let identity_pct: f64 = fields[2].parse().map_err(|_| malformed(format!("bad identity percentage '{}'", fields[2])))?;
    let internal_indels: u32 = fields[3].parse().map_err(|_| malformed(format!("bad gap count '{}'", fields[3])))?;
    let minus_strand = match fields[4] {
        "+" => false,
        "-" => true,
        other => return Err(malformed(format!("unknown strand marker '{other}'"))),
    };
    let query_cov: f64 = fields[5].parse().map_err(|_| malformed(format!("bad query coverage '{}'", fields[5])))?;
    Ok(Hit {
        query: fields[0].to_string(),
        target: fields[1].to_string(),
        identity_pct,
        internal_indels,
        minus_strand,
        query_cov,
    })
}

/// Reverse-complement a sequence, preserving the `n`/`nnnn` paired-read
/// separator token untouched and reversed in place as a block of `n`s
/// (complementing `n` is a no-op, so this is naturally correct as long as
/// we don't try to complement individual bases inside the run specially).
#[must_use]
pub fn reverse_complement(seq: &str) -> String {
    seq.chars()
        .rev()
        .map(|c| match c {
            'A' => 'T',
            'T' => 'A',
            'C' => 'G',
            'G' => 'C',
            'a' => 't',
            't' => 'a',
            'c' => 'g',
            'g' => 'c',
            'n' | 'N' => 'n',
            other => other,
        })
        .collect()
}

/// Group the clusterer's hit table back into [`Cluster`]s, using `qcov`
/// against the datatype's default (or user-overridden) query coverage
/// threshold, dropping hits with too many internal indels, and appending
/// every seed with no accepted hit as its own singleton cluster.
#[must_use]
pub fn build_clusters(
    datatype: Datatype,
    hackers: &Hackers,
    derep: Vec<DerepRead>,
    hits: &[Hit],
) -> Vec<Cluster> {
    let (default_qcov, _min_seed_cov) = datatype.default_coverage();
    let qcov_threshold = hackers.query_cov.unwrap_or(default_qcov);

    let by_name: HashMap<&str, &DerepRead, RandomState> =
        derep.iter().map(|r| (r.name.as_str(), r)).collect();

    let mut grouped: HashMap<String, Vec<DerepRead>, RandomState> = HashMap::default();
    let mut matched_queries: std::collections::HashSet<&str, RandomState> = std::collections::HashSet::default();

    for hit in hits {
        if hit.query_cov < qcov_threshold {
            continue;
        }
        if hit.internal_indels > hackers.max_internal_indels_derep {
            continue;
        }
        let Some(query_read) = by_name.get(hit.query.as_str()) else {
            continue;
        };
        matched_queries.insert(hit.query.as_str());

        let mut row = (*query_read).clone();
        row.orient = if hit.minus_strand { Orient::Minus } else { Orient::Plus };
        if hit.minus_strand {
            row.sequence = reverse_complement(&row.sequence);
        }
        grouped.entry(hit.target.clone()).or_default().push(row);
    }

    let mut clusters: Vec<Cluster> = Vec::new();
    for seed in &derep {
        // A read absorbed as a matched hit into some other seed's cluster
        // doesn't also get its own cluster.
        if matched_queries.contains(seed.name.as_str()) {
            continue;
        }
        let mut rows = vec![seed.clone()];
        if let Some(members) = grouped.remove(&seed.name) {
            rows.extend(members);
        }
        rows.sort_by(|a, b| b.size.cmp(&a.size));
        clusters.push(Cluster { rows });
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use radseq_io::FastqRecord;

    fn read(seq: &str) -> FastqRecord {
        FastqRecord { name: "r".into(), sequence: seq.into(), quality: "I".repeat(seq.len()) }
    }

    #[test]
    fn dereplicate_counts_exact_duplicates() {
        let reads = vec![read("ACGT"), read("ACGT"), read("TTTT")];
        let derep = dereplicate(&reads);
        assert_eq!(derep.len(), 2);
        assert_eq!(derep[0].sequence, "ACGT");
        assert_eq!(derep[0].size, 2);
        assert_eq!(derep[1].size, 1);
    }

    #[test]
    fn parse_hit_line_reads_all_fields() {
        let hit = parse_hit_line("s1", "read_1\tread_0\t97.5\t1\t-\t0.92").unwrap();
        assert_eq!(hit.query, "read_1");
        assert_eq!(hit.target, "read_0");
        assert!(hit.minus_strand);
        assert!((hit.query_cov - 0.92).abs() < 1e-9);
    }

    #[test]
    fn parse_hit_line_rejects_bad_field_count() {
        assert!(parse_hit_line("s1", "read_1\tread_0\t97.5").is_err());
    }

    #[test]
    fn reverse_complement_preserves_n_runs() {
        assert_eq!(reverse_complement("ACGTnnnnTTTT"), "AAAAnnnnACGT");
    }

    #[test]
    fn build_clusters_groups_matched_hits_and_keeps_unmatched_seeds() {
        let reads = vec![read("ACGTACGT"), read("ACGTACGT"), read("TTTTTTTT")];
        let derep = dereplicate(&reads);
        let hits = vec![Hit {
            query: derep[1].name.clone(),
            target: derep[0].name.clone(),
            identity_pct: 99.0,
            internal_indels: 0,
            minus_strand: false,
            query_cov: 0.9,
        }];
        let clusters = build_clusters(Datatype::Rad, &Hackers::default(), derep, &hits);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].rows.len(), 2);
    }
}
