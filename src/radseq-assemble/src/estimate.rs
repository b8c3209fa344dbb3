//! C5: joint maximum-likelihood estimate of heterozygosity `H` and
//! per-base sequencing error `E` from stacked high-depth clusters (spec
//! §4.5).

use std::collections::HashMap;

use ahash::RandomState;
use radseq_io::Cluster;

use crate::error::AssembleError;

const MAX_STACKED_CLUSTERS: usize = 10_000;
const MAX_REPLICATE_WEIGHT: u32 = 500;
const PAIR_SEPARATOR: char = 'n';
const BOUND_LO: f64 = 1e-10;
const BOUND_HI: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorHetEstimate {
    pub heterozygosity: f64,
    pub error_rate: f64,
}

/// A unique (n_C, n_A, n_T, n_G) base-count pattern observed across stacked
/// columns, with its multiplicity.
#[derive(Debug, Clone, Copy, Default)]
struct Pattern {
    counts: [u32; 4],
    multiplicity: u32,
}

fn base_index(c: char) -> Option<usize> {
    match c.to_ascii_uppercase() {
        'C' => Some(0),
        'A' => Some(1),
        'T' => Some(2),
        'G' => Some(3),
        _ => None,
    }
}

/// Build the per-column `(C,A,T,G)` count patterns from a set of high-depth
/// clusters, applying the overhang trim, `n`-column drop, gap-to-N
/// conversion, and all-N column drop described in spec §4.5.
fn stack_patterns(clusters: &[Cluster], overhang_lens: &[usize]) -> Vec<Pattern> {
    let trim = overhang_lens.iter().copied().max().unwrap_or(0);
    let mut buckets: HashMap<[u32; 4], u32, RandomState> = HashMap::default();

    for cluster in clusters.iter().take(MAX_STACKED_CLUSTERS) {
        let Some(seed) = cluster.seed() else { continue };
        let width = seed.sequence.len();
        if width <= 2 * trim {
            continue;
        }
        let columns = &cluster_columns(cluster)[trim..width - trim];
        for column in columns {
            if column.iter().any(|&c| c == PAIR_SEPARATOR) {
                continue;
            }
            let mut counts = [0u32; 4];
            let mut any_non_n = false;
            for (&base_char, weight) in column.iter().zip(cluster.rows.iter().map(|r| r.size.min(MAX_REPLICATE_WEIGHT))) {
                let base_char = if base_char == '-' { 'N' } else { base_char };
                if base_char == 'N' {
                    continue;
                }
                any_non_n = true;
                if let Some(idx) = base_index(base_char) {
                    counts[idx] += weight;
                }
            }
            if !any_non_n {
                continue;
            }
            *buckets.entry(counts).or_insert(0) += 1;
        }
    }

    buckets.into_iter().map(|(counts, multiplicity)| Pattern { counts, multiplicity }).collect()
}

/// Transpose a cluster's aligned rows into columns of characters, one
/// `char` per row per column (rows are expected to already be aligned to
/// equal length; shorter rows are padded with `N`).
pub(crate) fn cluster_columns(cluster: &Cluster) -> Vec<Vec<char>> {
    let width = cluster.seed().map_or(0, |s| s.sequence.len());
    let mut columns: Vec<Vec<char>> = vec![Vec::with_capacity(cluster.rows.len()); width];
    for row in &cluster.rows {
        let chars: Vec<char> = row.sequence.chars().collect();
        for (i, column) in columns.iter_mut().enumerate() {
            column.push(chars.get(i).copied().unwrap_or('N'));
        }
    }
    columns
}

/// Lanczos approximation to the log of the gamma function.
pub(crate) fn ln_gamma(x: f64) -> f64 {
    const G: f64 = 7.0;
    const COEFFS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        return (std::f64::consts::PI / (std::f64::consts::PI * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut a = COEFFS[0];
    let t = x + G + 0.5;
    for (i, coeff) in COEFFS.iter().enumerate().skip(1) {
        a += coeff / (x + i as f64);
    }
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + a.ln()
}

fn ln_choose(n: u32, k: u32) -> f64 {
    if k > n {
        return f64::NEG_INFINITY;
    }
    ln_gamma(f64::from(n) + 1.0) - ln_gamma(f64::from(k) + 1.0) - ln_gamma(f64::from(n - k) + 1.0)
}

/// `log Binom(k; n, p)`, the log-pmf of a binomial distribution.
pub(crate) fn ln_binom_pmf(k: u32, n: u32, p: f64) -> f64 {
    if !(0.0..=1.0).contains(&p) || k > n {
        return f64::NEG_INFINITY;
    }
    if p == 0.0 {
        return if k == 0 { 0.0 } else { f64::NEG_INFINITY };
    }
    if p == 1.0 {
        return if k == n { 0.0 } else { f64::NEG_INFINITY };
    }
    ln_choose(n, k) + f64::from(k) * p.ln() + f64::from(n - k) * (1.0 - p).ln()
}

fn binom_pmf(k: u32, n: u32, p: f64) -> f64 {
    ln_binom_pmf(k, n, p).exp()
}

fn homozygous_likelihood(pattern: &Pattern, p: [f64; 4], total: u32, e: f64) -> f64 {
    (0..4)
        .map(|b| p[b] * binom_pmf(total - pattern.counts[b], total, e))
        .sum()
}

fn heterozygous_likelihood(pattern: &Pattern, p: [f64; 4], total: u32, e: f64) -> f64 {
    let sum_sq: f64 = p.iter().map(|x| x * x).sum();
    let denom = 1.0 - sum_sq;
    if denom <= 0.0 {
        return 0.0;
    }
    let mut acc = 0.0;
    for b in 0..4 {
        for bp in (b + 1)..4 {
            let n_b = pattern.counts[b];
            let n_bp = pattern.counts[bp];
            let joint = binom_pmf(total - n_b - n_bp, total, 2.0 * e / 3.0);
            let allele_split = binom_pmf(n_b, n_b + n_bp, 0.5) / denom;
            acc += 2.0 * p[b] * p[bp] * joint * allele_split;
        }
    }
    acc
}

fn negative_log_likelihood(patterns: &[Pattern], p: [f64; 4], h: f64, e: f64) -> f64 {
    patterns
        .iter()
        .map(|pat| {
            let total: u32 = pat.counts.iter().sum();
            let l1 = homozygous_likelihood(pat, p, total, e);
            let l2 = if h > 0.0 { heterozygous_likelihood(pat, p, total, e) } else { 0.0 };
            let l = (1.0 - h) * l1 + h * l2;
            f64::from(pat.multiplicity) * l.max(f64::MIN_POSITIVE).ln()
        })
        .sum::<f64>()
        * -1.0
}

/// Golden-section search for the minimizer of a unimodal-ish scalar
/// function over `[lo, hi]`. Used in place of a dependency on an external
/// optimization crate, which the surrounding stack doesn't carry.
fn golden_section_minimize(mut lo: f64, mut hi: f64, f: impl Fn(f64) -> f64) -> f64 {
    const GOLDEN: f64 = 0.618_033_988_749_895;
    let mut c = hi - GOLDEN * (hi - lo);
    let mut d = lo + GOLDEN * (hi - lo);
    for _ in 0..100 {
        if (hi - lo).abs() < 1e-9 {
            break;
        }
        if f(c) < f(d) {
            hi = d;
        } else {
            lo = c;
        }
        c = hi - GOLDEN * (hi - lo);
        d = lo + GOLDEN * (hi - lo);
    }
    (lo + hi) / 2.0
}

/// Estimate `(H, E)` by coordinate descent over alternating golden-section
/// searches, starting from `(H=0.01, E=0.001)` (or `E=0.001` alone for
/// haploid samples where `H` is fixed at 0).
///
/// # Errors
/// [`AssembleError::BadStack`] if the aggregated base frequencies are
/// non-finite (e.g. an empty or degenerate stack).
pub fn estimate(
    sample: &str,
    clusters: &[Cluster],
    overhang_lens: &[usize],
    haploid: bool,
) -> Result<ErrorHetEstimate, AssembleError> {
    let patterns = stack_patterns(clusters, overhang_lens);
    if patterns.is_empty() {
        return Err(AssembleError::BadStack { sample: sample.to_string() });
    }

    let mut totals = [0u64; 4];
    let mut grand_total: u64 = 0;
    for pattern in &patterns {
        for b in 0..4 {
            totals[b] += u64::from(pattern.counts[b]) * u64::from(pattern.multiplicity);
            grand_total += u64::from(pattern.counts[b]) * u64::from(pattern.multiplicity);
        }
    }
    if grand_total == 0 {
        return Err(AssembleError::BadStack { sample: sample.to_string() });
    }
    let p: [f64; 4] = std::array::from_fn(|b| totals[b] as f64 / grand_total as f64);
    if p.iter().any(|x| !x.is_finite()) {
        return Err(AssembleError::BadStack { sample: sample.to_string() });
    }

    if haploid {
        let e = golden_section_minimize(BOUND_LO, BOUND_HI, |e| negative_log_likelihood(&patterns, p, 0.0, e));
        return Ok(ErrorHetEstimate { heterozygosity: 0.0, error_rate: e.clamp(BOUND_LO, BOUND_HI) });
    }

    let mut h = 0.01;
    let mut e = 0.001;
    for _ in 0..20 {
        let next_e = golden_section_minimize(BOUND_LO, BOUND_HI, |e| negative_log_likelihood(&patterns, p, h, e));
        let next_h = golden_section_minimize(BOUND_LO, BOUND_HI, |h| negative_log_likelihood(&patterns, p, h, next_e));
        if (next_e - e).abs() < 1e-8 && (next_h - h).abs() < 1e-8 {
            e = next_e;
            h = next_h;
            break;
        }
        e = next_e;
        h = next_h;
    }

    Ok(ErrorHetEstimate { heterozygosity: h.clamp(BOUND_LO, BOUND_HI), error_rate: e.clamp(BOUND_LO, BOUND_HI) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use radseq_io::{DerepRead, Orient};

    fn cluster(seq: &str, size: u32) -> Cluster {
        Cluster { rows: vec![DerepRead { name: "s".into(), tag: None, size, orient: Orient::Seed, sequence: seq.into() }] }
    }

    #[test]
    fn ln_binom_pmf_matches_known_value() {
        // Binom(1; 2, 0.5) = 0.5
        let v = ln_binom_pmf(1, 2, 0.5).exp();
        assert!((v - 0.5).abs() < 1e-9);
    }

    #[test]
    fn estimate_rejects_empty_cluster_set() {
        assert!(estimate("s1", &[], &[5], false).is_err());
    }

    #[test]
    fn estimate_converges_on_clean_homozygous_stack() {
        let clusters: Vec<Cluster> = (0..20).map(|_| cluster("ACGTACGTACGTACGTACGT", 10)).collect();
        let est = estimate("s1", &clusters, &[0], false).unwrap();
        assert!(est.error_rate < 0.1);
        assert!(est.heterozygosity < 0.5);
    }

    #[test]
    fn haploid_fixes_heterozygosity_at_zero() {
        let clusters: Vec<Cluster> = (0..20).map(|_| cluster("ACGTACGTACGTACGTACGT", 10)).collect();
        let est = estimate("s1", &clusters, &[0], true).unwrap();
        assert_eq!(est.heterozygosity, 0.0);
    }
}
