//! Superstring encoding and the suffix/LCP pattern analyzer.
//!
//! Every byte `b` of a word is written as the pair `0x01 b` and every word is
//! closed with `0x00 0x00`. Suffixes are only meaningful at even offsets, and
//! the zero in the first byte of a pair marks the end of a word, so common
//! prefixes never run across word boundaries.

use crate::compress::Cfg;
use crate::error::CompressionError;

/// Superstring bytes taken by a word of length `len`.
pub fn encoded_len(len: usize) -> usize {
    2 * len + 2
}

pub fn append_word(superstring: &mut Vec<u8>, word: &[u8]) {
    superstring.reserve(encoded_len(word.len()));
    for &b in word {
        superstring.push(0x01);
        superstring.push(b);
    }
    superstring.push(0x00);
    superstring.push(0x00);
}

/// Scratch buffers reused across superstrings by one analysis worker.
#[derive(Default)]
pub struct SuffixScratch {
    sa: Vec<i32>,
    filtered: Vec<usize>,
    inv: Vec<usize>,
    lcp: Vec<usize>,
    window: Vec<usize>,
}

/// Length filter applied to candidates before they are scored.
fn length_allowed(cfg: &Cfg, l: usize) -> bool {
    if l > cfg.max_pattern_len {
        return false;
    }
    l <= cfg.long_pattern_pow2_len || l.is_power_of_two()
}

/// Mines repeated substrings from one superstring and hands every candidate
/// that clears `cfg.min_pattern_score` to `emit` as `(pattern bytes, score)`.
pub fn process_superstring<F>(
    superstring: &[u8],
    cfg: &Cfg,
    scratch: &mut SuffixScratch,
    mut emit: F,
) -> Result<(), CompressionError>
where
    F: FnMut(&[u8], u64) -> Result<(), CompressionError>,
{
    // fewer than two character positions cannot repeat
    if superstring.len() < 4 {
        return Ok(());
    }
    if superstring.len() > i32::MAX as usize {
        return Err(CompressionError::InvalidConfig(format!(
            "superstring of {} bytes exceeds the suffix array limit",
            superstring.len()
        )));
    }

    let SuffixScratch {
        sa,
        filtered,
        inv,
        lcp,
        window,
    } = scratch;

    sa.clear();
    sa.resize(superstring.len(), 0);
    cdivsufsort::sort_in_place(superstring, sa);

    let n = superstring.len() / 2;
    filtered.clear();
    filtered.extend(
        sa.iter()
            .map(|&s| s as usize)
            .filter(|s| s & 1 == 0)
            .map(|s| s >> 1),
    );
    if filtered.len() != n {
        return Err(CompressionError::Invariant(format!(
            "filtered suffix array has {} entries, expected {}",
            filtered.len(),
            n
        )));
    }

    inv.clear();
    inv.resize(n, 0);
    for (rank, &p) in filtered.iter().enumerate() {
        inv[p] = rank;
    }

    // Kasai over character positions, stopping at word terminators
    lcp.clear();
    lcp.resize(n, 0);
    let ss = superstring;
    let mut k = 0usize;
    for i in 0..n {
        if inv[i] == n - 1 {
            k = 0;
            continue;
        }
        let j = filtered[inv[i] + 1];
        while i + k < n
            && j + k < n
            && ss[(i + k) * 2] != 0
            && ss[(j + k) * 2] != 0
            && ss[(i + k) * 2 + 1] == ss[(j + k) * 2 + 1]
        {
            k += 1;
        }
        lcp[inv[i]] = k;
        k = k.saturating_sub(1);
    }

    let mut key = Vec::with_capacity(cfg.max_pattern_len);
    // lcp[j..=i] >= l holds for every candidate length l examined at a drop,
    // so ranks j..=i+1 are the suffixes sharing the candidate prefix
    let mut j = 0usize;
    for i in 0..n - 1 {
        if lcp[i + 1] >= lcp[i] {
            j = i + 1;
            continue;
        }
        let mut l = lcp[i];
        while l > lcp[i + 1] && l >= cfg.min_pattern_len {
            if !length_allowed(cfg, l) {
                l -= 1;
                continue;
            }

            while j > 0 && lcp[j - 1] >= l {
                j -= 1;
            }

            window.clear();
            window.extend_from_slice(&filtered[j..i + 2]);
            window.sort_unstable();
            let mut repeats = 1u64;
            let mut last = window[0];
            for &start in window.iter().skip(1) {
                if start >= last + l {
                    repeats += 1;
                    last = start;
                }
            }

            let weight = l.saturating_sub(cfg.pattern_score_overhead) as u64;
            let score = repeats * weight;
            if repeats < 2 || score < cfg.min_pattern_score {
                l -= 1;
                continue;
            }

            key.clear();
            let p = filtered[i];
            key.extend((0..l).map(|s| ss[(p + s) * 2 + 1]));
            emit(&key, score)?;
            break;
        }
    }
    Ok(())
}
