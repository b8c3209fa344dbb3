//! C3: chunk clusters for the external aligner, drive a long-lived aligner
//! subprocess, and apply the post-alignment filters (spec §4.3, §9).

use std::{
    io::{BufRead, BufReader, Write},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
};

use parser::{Datatype, Hackers};
use radseq_io::{Cluster, DerepRead, Orient};

use crate::{derep::reverse_complement, error::AssembleError};

const PAIR_SEPARATOR: &str = "nnnn";
const DEFAULT_CHUNK_COUNT: usize = 10;

/// Split clusters into a fixed, non-uniform number of chunks (default 10),
/// smallest-depth clusters grouped first so a worker with a cheap chunk
/// finishes and can pick up more work early instead of idling behind one
/// slow chunk full of deep clusters.
#[must_use]
pub fn chunk_clusters(mut clusters: Vec<Cluster>, chunk_count: Option<usize>) -> Vec<Vec<Cluster>> {
    let chunk_count = chunk_count.unwrap_or(DEFAULT_CHUNK_COUNT).max(1);
    clusters.sort_by_key(Cluster::depth);

    let mut chunks: Vec<Vec<Cluster>> = (0..chunk_count).map(|_| Vec::new()).collect();
    for (i, cluster) in clusters.into_iter().enumerate() {
        chunks[i % chunk_count].push(cluster);
    }
    chunks.retain(|c| !c.is_empty());
    chunks
}

/// A long-lived external aligner process addressed as a simple line
/// protocol: one sequence block per cluster, terminated by a marker line,
/// with the aligned block echoed back terminated by the same marker.
pub struct AlignerHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl AlignerHandle {
    /// Spawn the external aligner, keeping its stdin/stdout open for the
    /// lifetime of the handle.
    ///
    /// # Errors
    /// [`AssembleError::ExternalToolError`] if the process fails to spawn.
    pub fn spawn(sample: &str, program: &str, args: &[&str]) -> Result<Self, AssembleError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| AssembleError::ExternalToolError {
                sample: sample.to_string(),
                tool: "aligner",
                detail: e.to_string(),
            })?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
        Ok(Self { child, stdin, stdout })
    }

    fn write_cmd(&mut self, sample: &str, block: &str) -> Result<(), AssembleError> {
        writeln!(self.stdin, "{block}").and_then(|()| self.stdin.flush()).map_err(|e| AssembleError::ExternalToolError {
            sample: sample.to_string(),
            tool: "aligner",
            detail: e.to_string(),
        })
    }

    fn read_until(&mut self, sample: &str, marker: &str) -> Result<Vec<String>, AssembleError> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.stdout.read_line(&mut line).map_err(|e| AssembleError::ExternalToolError {
                sample: sample.to_string(),
                tool: "aligner",
                detail: e.to_string(),
            })?;
            if n == 0 {
                return Err(AssembleError::ExternalToolError {
                    sample: sample.to_string(),
                    tool: "aligner",
                    detail: "process closed stdout before emitting its marker".to_string(),
                });
            }
            let line = line.trim_end_matches(['\n', '\r']).to_string();
            if line == marker {
                return Ok(lines);
            }
            lines.push(line);
        }
    }

    /// Send one cluster's rows for alignment and parse the response back
    /// into aligned rows (same order, padded to a common length).
    ///
    /// # Errors
    /// [`AssembleError::ExternalToolError`] on I/O failure or a response
    /// that doesn't echo back one line per input row.
    pub fn align(&mut self, sample: &str, rows: &[DerepRead]) -> Result<Vec<String>, AssembleError> {
        const MARKER: &str = "//";
        let mut block = String::new();
        for row in rows {
            block.push_str(&format!(">{}\n{}\n", row.name, row.sequence));
        }
        block.push_str(MARKER);
        self.write_cmd(sample, &block)?;
        let reply = self.read_until(sample, MARKER)?;
        let sequences: Vec<String> = reply.into_iter().filter(|l| !l.starts_with('>')).collect();
        if sequences.len() != rows.len() {
            return Err(AssembleError::ExternalToolError {
                sample: sample.to_string(),
                tool: "aligner",
                detail: format!("expected {} aligned rows, got {}", rows.len(), sequences.len()),
            });
        }
        Ok(sequences)
    }
}

impl Drop for AlignerHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Split a paired read's sequence at the `nnnn` separator. Returns `None`
/// if the sequence has no pairing token (single-end data).
#[must_use]
pub fn split_pair(sequence: &str) -> Option<(&str, &str)> {
    sequence.split_once(PAIR_SEPARATOR)
}

/// Rejoin two aligned mates with the standard separator, padding the
/// shorter mate's side with `n` so both sides of every row in the cluster
/// agree on the padded length (the resolved Open Question from spec §9:
/// pad the shorter side).
#[must_use]
pub fn rejoin_pair(left: &str, right: &str, left_width: usize, right_width: usize) -> String {
    let mut joined = String::with_capacity(left_width + right_width + PAIR_SEPARATOR.len());
    joined.push_str(left);
    joined.push_str(&"n".repeat(left_width.saturating_sub(left.len())));
    joined.push_str(PAIR_SEPARATOR);
    joined.push_str(right);
    joined.push_str(&"n".repeat(right_width.saturating_sub(right.len())));
    joined
}

fn count_internal_indels(aligned: &str) -> u32 {
    let trimmed = aligned.trim_matches('-');
    u32::try_from(trimmed.chars().filter(|&c| c == '-').count()).unwrap_or(u32::MAX)
}

/// Internal-indel filter (spec §4.3): the whole cluster is dropped if the
/// maximum internal-gap count across its rows exceeds
/// `hackers.max_internal_indels_align`. For paired clusters, both halves of
/// every row are evaluated and the max taken across both.
#[must_use]
pub fn cluster_exceeds_max_indels(cluster: &Cluster, hackers: &Hackers) -> bool {
    cluster.rows.iter().any(|row| match split_pair(&row.sequence) {
        Some((left, right)) => {
            count_internal_indels(left) > hackers.max_internal_indels_align || count_internal_indels(right) > hackers.max_internal_indels_align
        }
        None => count_internal_indels(&row.sequence) > hackers.max_internal_indels_align,
    })
}

/// Trim the restriction-site edge introduced by GBS-style library prep,
/// applicable only to `gbs`/`pairgbs` datatypes (spec §4.3). Strips the
/// first `overhang_len` bases of every non-seed row to align it to the
/// seed's cut site, since GBS fragments can start a few bases staggered.
pub fn gbs_edge_trim(cluster: &mut Cluster, datatype: Datatype, overhang_len: usize) {
    if !datatype.is_gbs_like() || overhang_len == 0 {
        return;
    }
    for row in &mut cluster.rows {
        if row.sequence.len() > overhang_len {
            row.sequence.drain(..overhang_len);
        }
    }
}

/// Remove PCR duplicates from a cluster when `hackers.declone_pcr_duplicates`
/// is set: rows sharing an identical sequence are collapsed into one,
/// summing their `size` (spec §C.1, supplemented from `original_source`).
#[must_use]
pub fn declone_pcr_duplicates(cluster: Cluster, hackers: &Hackers) -> Cluster {
    if !hackers.declone_pcr_duplicates {
        return cluster;
    }
    let mut deduped: Vec<DerepRead> = Vec::new();
    for row in cluster.rows {
        if let Some(existing) = deduped.iter_mut().find(|r: &&mut DerepRead| r.sequence == row.sequence) {
            existing.size += row.size;
        } else {
            deduped.push(row);
        }
    }
    Cluster { rows: deduped }
}

#[must_use]
pub fn strand_orient_is_reverse(row: &DerepRead) -> bool {
    matches!(row.orient, Orient::Minus)
}

/// Produce the reverse complement of a row's sequence in place, used when
/// the aligner needs every row on a consistent strand before alignment.
pub fn normalize_strand(row: &mut DerepRead) {
    if strand_orient_is_reverse(row) {
        row.sequence = reverse_complement(&row.sequence);
        row.orient = Orient::Plus;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radseq_io::DerepRead;

    fn row(seq: &str, size: u32) -> DerepRead {
        DerepRead { name: "r".into(), tag: None, size, orient: Orient::Plus, sequence: seq.into() }
    }

    #[test]
    fn chunking_is_bounded_and_covers_all_clusters() {
        let clusters: Vec<Cluster> = (0..25).map(|i| Cluster { rows: vec![row("ACGT", i + 1)] }).collect();
        let chunks = chunk_clusters(clusters, Some(10));
        assert!(chunks.len() <= 10);
        let total: usize = chunks.iter().map(Vec::len).sum();
        assert_eq!(total, 25);
    }

    #[test]
    fn split_pair_finds_separator() {
        let (l, r) = split_pair("ACGTnnnnTTTT").unwrap();
        assert_eq!(l, "ACGT");
        assert_eq!(r, "TTTT");
    }

    #[test]
    fn rejoin_pair_pads_shorter_side() {
        let joined = rejoin_pair("AC", "TTTT", 4, 4);
        assert_eq!(joined, "ACnnnnnnTTTT");
    }

    #[test]
    fn cluster_exceeds_max_indels_flags_any_overindeled_row() {
        let clean = Cluster { rows: vec![row("A---C", 1), row("AC", 5)] };
        assert!(!cluster_exceeds_max_indels(&clean, &Hackers::default()));
        let dirty = Cluster { rows: vec![row("AC", 5), row("A----------------C", 2)] };
        assert!(cluster_exceeds_max_indels(&dirty, &Hackers::default()));
    }

    #[test]
    fn declone_merges_identical_sequences_when_enabled() {
        let cluster = Cluster { rows: vec![row("ACGT", 3), row("ACGT", 2), row("TTTT", 1)] };
        let mut hackers = Hackers::default();
        hackers.declone_pcr_duplicates = true;
        let deduped = declone_pcr_duplicates(cluster, &hackers);
        assert_eq!(deduped.rows.len(), 2);
        assert_eq!(deduped.rows[0].size, 5);
    }

    #[test]
    fn gbs_edge_trim_only_applies_to_gbs_datatypes() {
        let mut cluster = Cluster { rows: vec![row("TTTTACGT", 1), row("TTTTACGT", 1)] };
        gbs_edge_trim(&mut cluster, Datatype::Rad, 4);
        assert_eq!(cluster.rows[1].sequence, "TTTTACGT");
        gbs_edge_trim(&mut cluster, Datatype::Gbs, 4);
        assert_eq!(cluster.rows[1].sequence, "ACGT");
    }
}
