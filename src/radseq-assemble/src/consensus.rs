//! C6: per-cluster consensus base calling, the most detailed stage in the
//! pipeline (spec §4.6).

use genome::{Base, RefPos};
use parser::Params;
use radseq_io::Cluster;

use crate::estimate::{ln_binom_pmf, ErrorHetEstimate};

const RESCALE_CAP: u32 = 500;
const TRIALLELE_FRACTION: f64 = 0.15;
const POSTERIOR_ACCEPT: f64 = 0.95;
const LOWCOV_ALLELE_FRACTION: f64 = 0.10;

#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusRecord {
    pub sequence: String,
    /// Per-column weighted base counts, `(C, A, T, G)` in that order.
    pub base_depths: Vec<[u16; 4]>,
    pub nalleles: u32,
    pub refpos: Option<RefPos>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusOutcome {
    Accepted(Box<ConsensusRecord>),
    Filtered(&'static str),
}

struct WorkingColumn {
    /// `(base char, weight)` per row, aligned to `cluster.rows` order.
    raw: Vec<(char, u32)>,
}

fn weighted_columns(cluster: &Cluster) -> Vec<WorkingColumn> {
    let width = cluster.seed().map_or(0, |s| s.sequence.len());
    let mut columns: Vec<WorkingColumn> = (0..width).map(|_| WorkingColumn { raw: Vec::with_capacity(cluster.rows.len()) }).collect();
    for row in &cluster.rows {
        let chars: Vec<char> = row.sequence.chars().collect();
        for (i, column) in columns.iter_mut().enumerate() {
            let c = chars.get(i).copied().unwrap_or('N');
            column.raw.push((c, row.size));
        }
    }
    columns
}

/// Step 1: denovo repeat masking. Mutates `columns` in place, dropping
/// columns whose dash-fraction is too high and forcing any column
/// containing the pair separator to an all-`n` column.
fn denovo_mask(columns: &mut Vec<WorkingColumn>) {
    columns.retain(|col| {
        let gaps = col.raw.iter().filter(|(c, _)| *c == '-').count();
        (gaps as f64) / (col.raw.len().max(1) as f64) < 0.9
    });
    for column in columns.iter_mut() {
        for pair in &mut column.raw {
            if pair.0 == '-' {
                pair.0 = 'N';
            }
        }
        if column.raw.iter().any(|(c, _)| *c == 'n') {
            for pair in &mut column.raw {
                pair.0 = 'n';
            }
        }
    }
}

#[derive(Default)]
struct SiteCounts {
    /// weighted counts for C, A, T, G, in that fixed order.
    counts: [u32; 4],
}

const CANON: [char; 4] = ['C', 'A', 'T', 'G'];

fn canon_index(c: char) -> Option<usize> {
    CANON.iter().position(|&b| b == c)
}

enum SiteCall {
    Base(char),
    PassThrough(char),
    Het(char, char, char),
}

/// Step 3 for a single column: returns the genotype call and whether this
/// column tripped the triallele flag. `haploid` collapses any heterozygous
/// call to `N` (spec: haploid samples reject het calls at this step).
fn call_site(column: &WorkingColumn, maj: u32, stat: u32, est: &ErrorHetEstimate, haploid: bool) -> (SiteCall, bool) {
    let non_masked: Vec<(char, u32)> = column.raw.iter().copied().filter(|(c, _)| *c != 'N' && *c != '-').collect();
    let non_masked_depth: u32 = non_masked.iter().map(|(_, w)| w).sum();

    if non_masked_depth < maj {
        return (SiteCall::Base('N'), false);
    }
    if let Some((first, _)) = non_masked.first() {
        if non_masked.iter().all(|(c, _)| c == first) {
            return (SiteCall::PassThrough(*first), false);
        }
    }

    let mut counts = SiteCounts::default();
    for (c, w) in &non_masked {
        if let Some(idx) = canon_index(*c) {
            counts.counts[idx] += w;
        }
    }
    let mut ranked: Vec<(char, u32)> = CANON.iter().zip(counts.counts).map(|(&c, n)| (c, n)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    let (p_base, n_p) = ranked[0];
    let (q_base, n_q) = ranked[1];
    let (_, n_r) = ranked[2];

    let total_pqr = n_p + n_q + n_r;
    let triallele = total_pqr > 0 && f64::from(n_r) / f64::from(total_pqr) >= TRIALLELE_FRACTION;

    if n_p + n_q < maj {
        return (SiteCall::Base('N'), triallele);
    }

    let (mut n_p, mut n_q) = (n_p, n_q);
    if n_p + n_q > RESCALE_CAP {
        let scale = f64::from(RESCALE_CAP) / f64::from(n_p + n_q);
        n_p = (f64::from(n_p) * scale).round() as u32;
        n_q = (f64::from(n_q) * scale).round() as u32;
    }

    if n_p + n_q < stat {
        return if n_p > n_q {
            (SiteCall::Base(p_base), triallele)
        } else if haploid {
            (SiteCall::Base('N'), triallele)
        } else {
            (SiteCall::Het(p_base, q_base, iupac_char(p_base, q_base)), triallele)
        };
    }

    let (p_het, p_hom_p, p_hom_q) = get_binom(n_p, n_q, est.error_rate, est.heterozygosity);
    let best = p_het.max(p_hom_p).max(p_hom_q);
    if best < POSTERIOR_ACCEPT {
        return (SiteCall::Base('N'), triallele);
    }
    if best == p_het {
        if haploid {
            (SiteCall::Base('N'), triallele)
        } else {
            (SiteCall::Het(p_base, q_base, iupac_char(p_base, q_base)), triallele)
        }
    } else if best == p_hom_p {
        (SiteCall::Base(p_base), triallele)
    } else {
        (SiteCall::Base(q_base), triallele)
    }
}

fn iupac_char(a: char, b: char) -> char {
    let ba = Base::try_from(a).unwrap_or(Base::N);
    let bb = Base::try_from(b).unwrap_or(Base::N);
    Base::from_pair(ba, bb).map_or('N', |het| het.to_string().chars().next().unwrap_or('N'))
}

/// The binomial genotype posterior from spec §4.6 step 9, returned as
/// normalized `(p_het, p_hom_p, p_hom_q)`.
fn get_binom(n_p: u32, n_q: u32, e: f64, h: f64) -> (f64, f64, f64) {
    let n = n_p + n_q;
    let log_het = if h > 0.0 { ln_binom_pmf(n_p, n, 0.5) + h.ln() } else { f64::NEG_INFINITY };
    let log_hom_p = ln_binom_pmf(n_q, n, e) + ((1.0 - h) / 2.0).ln();
    let log_hom_q = ln_binom_pmf(n_p, n, e) + ((1.0 - h) / 2.0).ln();

    let max_log = [log_het, log_hom_p, log_hom_q].into_iter().fold(f64::NEG_INFINITY, f64::max);
    if !max_log.is_finite() {
        return (0.0, 0.0, 0.0);
    }
    let het = (log_het - max_log).exp();
    let hom_p = (log_hom_p - max_log).exp();
    let hom_q = (log_hom_q - max_log).exp();
    let sum = het + hom_p + hom_q;
    (het / sum, hom_p / sum, hom_q / sum)
}

/// Run the full consensus-calling pipeline (steps 1-7) on one aligned
/// cluster.
pub fn call_consensus(
    cluster: &Cluster,
    params: &Params,
    est: &ErrorHetEstimate,
    is_reference: bool,
    refpos: Option<RefPos>,
    max_frag: u32,
) -> ConsensusOutcome {
    let mut columns = weighted_columns(cluster);
    if !is_reference {
        denovo_mask(&mut columns);
    }
    if columns.is_empty() {
        return ConsensusOutcome::Filtered("depth");
    }

    let depth: u64 = cluster.depth();
    if depth < u64::from(params.min_depth_majrule) || depth > u64::from(params.max_depth) {
        return ConsensusOutcome::Filtered("depth");
    }

    let mut consensus_chars = Vec::with_capacity(columns.len());
    let mut het_sites: Vec<(usize, char, char)> = Vec::new();
    let mut triallele_flag = false;
    let haploid = params.max_alleles_consens == 1;

    for (i, column) in columns.iter().enumerate() {
        let (call, triallele) = call_site(column, params.min_depth_majrule, params.min_depth_statistical, est, haploid);
        triallele_flag |= triallele;
        match call {
            SiteCall::Base(c) | SiteCall::PassThrough(c) => consensus_chars.push(c),
            SiteCall::Het(a, b, code) => {
                consensus_chars.push(code);
                het_sites.push((i, a, b));
            }
        }
    }

    // Step 4: edge trim.
    let first = consensus_chars.iter().position(|&c| c != 'N');
    let last = consensus_chars.iter().rposition(|&c| c != 'N');
    let (Some(first), Some(last)) = (first, last) else {
        return ConsensusOutcome::Filtered("depth");
    };
    let left_trim = first;
    let right_trim = consensus_chars.len() - 1 - last;
    let trimmed: Vec<char> = consensus_chars[first..=last].to_vec();
    let trimmed_het_sites: Vec<(usize, char, char)> = het_sites
        .into_iter()
        .filter(|(idx, ..)| *idx >= first && *idx <= last)
        .map(|(idx, a, b)| (idx - first, a, b))
        .collect();

    let refpos = refpos.map(|rp| RefPos::new(rp.scaffold_id, rp.start + left_trim as u32, rp.end.saturating_sub(right_trim as u32)));

    // Step 5: triallele filter.
    if triallele_flag && params.max_alleles_consens < 3 {
        return ConsensusOutcome::Filtered("maxalleles");
    }

    // Step 6: hetero/N filters.
    let length = trimmed.len();
    let h_count = trimmed.iter().filter(|c| Base::try_from(**c).map(Base::is_heterozygote).unwrap_or(false)).count();
    let n_count = trimmed.iter().filter(|&&c| c == 'N').count();
    if (h_count as f64) > (length as f64) * params.max_h_consens {
        return ConsensusOutcome::Filtered("maxh");
    }
    if length < params.filter_min_trim_len as usize {
        return ConsensusOutcome::Filtered("maxn");
    }
    if !is_reference && (n_count as f64) > (length as f64) * params.max_n_consens {
        return ConsensusOutcome::Filtered("maxn");
    }

    // Step 7: allele inference.
    let trimmed_columns = &columns[first..=last];
    let nalleles = if trimmed_het_sites.is_empty() {
        1
    } else {
        match infer_alleles(trimmed_columns, &trimmed_het_sites, params.max_alleles_consens) {
            Some(n) => n,
            None => return ConsensusOutcome::Filtered("maxalleles"),
        }
    };

    let sequence: String = trimmed.into_iter().collect();
    let base_depths = build_base_depths(trimmed_columns, max_frag);

    ConsensusOutcome::Accepted(Box::new(ConsensusRecord { sequence, base_depths, nalleles, refpos }))
}

fn build_base_depths(columns: &[WorkingColumn], max_frag: u32) -> Vec<[u16; 4]> {
    let mut depths = Vec::with_capacity(max_frag as usize);
    for column in columns.iter().take(max_frag as usize) {
        let mut counts = [0u32; 4];
        for (c, w) in &column.raw {
            if let Some(idx) = canon_index(*c) {
                counts[idx] += w;
            }
        }
        depths.push(std::array::from_fn(|i| counts[i].min(u32::from(u16::MAX)) as u16));
    }
    depths.resize(max_frag as usize, [0u16; 4]);
    depths
}

/// Step 7: per-heterozygous-site allele inference over the per-row matrix,
/// with the two-pass 10%-of-rows lowcov drop. `columns` and `het_sites`'
/// column indices must already be in the same masked-and-edge-trimmed
/// coordinate space (i.e. `columns[first..=last]` after `denovo_mask`).
fn infer_alleles(columns: &[WorkingColumn], het_sites: &[(usize, char, char)], max_alleles: u8) -> Option<u32> {
    let n_rows = columns.first().map_or(0, |c| c.raw.len());

    let mut matrix: Vec<Vec<char>> = Vec::with_capacity(n_rows);
    'rows: for row_idx in 0..n_rows {
        let mut pattern = Vec::with_capacity(het_sites.len());
        for (col_idx, a, b) in het_sites {
            let Some(column) = columns.get(*col_idx) else { continue 'rows };
            let Some((c, _)) = column.raw.get(row_idx) else { continue 'rows };
            if *c == 'N' {
                continue 'rows;
            }
            if *c != *a && *c != *b {
                continue 'rows;
            }
            pattern.push(*c);
        }
        matrix.push(pattern);
    }

    let tally = |rows: &[Vec<char>]| -> std::collections::HashMap<Vec<char>, usize> {
        let mut counts = std::collections::HashMap::new();
        for row in rows {
            *counts.entry(row.clone()).or_insert(0) += 1;
        }
        counts
    };

    let counts = tally(&matrix);
    if counts.len() <= max_alleles as usize {
        return Some(counts.len() as u32);
    }

    let threshold = (matrix.len() as f64 * LOWCOV_ALLELE_FRACTION).ceil() as usize;
    let retained: Vec<Vec<char>> = matrix.into_iter().filter(|row| counts.get(row).copied().unwrap_or(0) >= threshold).collect();
    let recount = tally(&retained);
    if recount.len() <= max_alleles as usize {
        Some(recount.len() as u32)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radseq_io::{DerepRead, Orient};

    fn row(seq: &str, size: u32) -> DerepRead {
        DerepRead { name: "r".into(), tag: None, size, orient: Orient::Plus, sequence: seq.into() }
    }

    fn est(h: f64, e: f64) -> ErrorHetEstimate {
        ErrorHetEstimate { heterozygosity: h, error_rate: e }
    }

    fn default_params() -> Params {
        let mut p = Params::default();
        p.filter_min_trim_len = 5;
        p
    }

    #[test]
    fn calls_clean_homozygous_site() {
        let cluster = Cluster { rows: vec![row("ACGTACGTACGT", 20); 8] };
        let outcome = call_consensus(&cluster, &default_params(), &est(0.01, 0.001), false, None, 50);
        match outcome {
            ConsensusOutcome::Accepted(rec) => assert_eq!(rec.sequence, "ACGTACGTACGT"),
            ConsensusOutcome::Filtered(reason) => panic!("unexpectedly filtered: {reason}"),
        }
    }

    #[test]
    fn low_depth_cluster_is_filtered() {
        let cluster = Cluster { rows: vec![row("ACGTACGTACGT", 1)] };
        let outcome = call_consensus(&cluster, &default_params(), &est(0.01, 0.001), false, None, 50);
        assert_eq!(outcome, ConsensusOutcome::Filtered("depth"));
    }

    #[test]
    fn get_binom_normalizes_to_one() {
        let (het, hom_p, hom_q) = get_binom(10, 10, 0.01, 0.5);
        assert!((het + hom_p + hom_q - 1.0).abs() < 1e-9);
    }

    #[test]
    fn iupac_char_encodes_heterozygote() {
        assert_eq!(iupac_char('A', 'G'), 'R');
    }

    #[test]
    fn allele_count_survives_a_masked_leading_column() {
        // Column 0 is dashes in 9/10 rows and gets dropped by denovo_mask,
        // shifting every later het-site index down by one. Column 1 is a
        // clean 5/5 C-vs-G split.
        let rows = vec![
            row("-C", 1),
            row("-C", 1),
            row("-C", 1),
            row("-C", 1),
            row("-C", 1),
            row("-G", 1),
            row("-G", 1),
            row("-G", 1),
            row("-G", 1),
            row("AG", 1),
        ];
        let cluster = Cluster { rows };
        let mut params = Params::default();
        params.min_depth_majrule = 2;
        params.min_depth_statistical = 2;
        params.filter_min_trim_len = 1;
        params.max_h_consens = 1.0;
        params.max_n_consens = 1.0;

        let outcome = call_consensus(&cluster, &params, &est(0.01, 0.001), false, None, 10);
        match outcome {
            ConsensusOutcome::Accepted(rec) => assert_eq!(rec.nalleles, 2),
            ConsensusOutcome::Filtered(reason) => panic!("unexpectedly filtered: {reason}"),
        }
    }

    #[test]
    fn haploid_samples_collapse_het_calls_to_n() {
        // Flanking columns are homozygous so the call survives edge trim;
        // the middle column is a clean 5/5 C-vs-G split that would be a Het
        // call for a diploid sample.
        let rows = vec![
            row("ACT", 1),
            row("ACT", 1),
            row("ACT", 1),
            row("ACT", 1),
            row("ACT", 1),
            row("AGT", 1),
            row("AGT", 1),
            row("AGT", 1),
            row("AGT", 1),
            row("AGT", 1),
        ];
        let cluster = Cluster { rows };
        let mut params = Params::default();
        params.min_depth_majrule = 2;
        params.min_depth_statistical = 2;
        params.max_alleles_consens = 1;
        params.filter_min_trim_len = 1;
        params.max_h_consens = 1.0;
        params.max_n_consens = 1.0;

        let outcome = call_consensus(&cluster, &params, &est(0.01, 0.001), false, None, 10);
        match outcome {
            ConsensusOutcome::Accepted(rec) => assert_eq!(rec.sequence, "ANT"),
            ConsensusOutcome::Filtered(reason) => panic!("unexpectedly filtered: {reason}"),
        }
    }

    #[test]
    fn base_depths_are_ordered_c_a_t_g() {
        let cluster = Cluster { rows: vec![row("C", 3), row("A", 2), row("T", 1), row("G", 4)] };
        let depths = build_base_depths(&weighted_columns(&cluster), 1);
        assert_eq!(depths[0], [3, 2, 1, 4]);
    }
}
