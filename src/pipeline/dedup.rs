// src/pipeline/dedup.rs
//! Title fingerprints and duplicate suppression. Exact-fingerprint matching
//! only; within-run duplicates keep the first occurrence in fan-out order.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::pipeline::types::Candidate;

/// Normalize a title for fingerprinting: decode HTML entities, lowercase,
/// strip punctuation, collapse whitespace.
pub fn normalize_title(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    let stripped = re_tags.replace_all(&decoded, " ");

    let mut out = String::with_capacity(stripped.len());
    let mut prev_space = true; // leading separators are dropped
    for ch in stripped.chars() {
        if ch.is_alphanumeric() {
            for lc in ch.to_lowercase() {
                out.push(lc);
            }
            prev_space = false;
        } else if !prev_space {
            // Punctuation and whitespace both collapse to one separator.
            out.push(' ');
            prev_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Fingerprint of a normalized title: first 8 bytes of SHA-256, hex-encoded.
pub fn fingerprint(title: &str) -> String {
    let normalized = normalize_title(title);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for b in digest.iter().take(8) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Drop exact-fingerprint duplicates. `existing` is the set of fingerprints
/// already admitted for the active topic within the lookback window.
/// Order-preserving; pure apart from reading `existing`.
pub fn dedup_candidates(
    candidates: Vec<Candidate>,
    existing: &HashSet<String>,
) -> (Vec<Candidate>, u64) {
    let mut seen: HashSet<String> = HashSet::with_capacity(candidates.len());
    let mut kept = Vec::with_capacity(candidates.len());
    let mut dropped = 0u64;

    for cand in candidates {
        let fp = fingerprint(&cand.title);
        if existing.contains(&fp) || !seen.insert(fp) {
            dropped += 1;
            continue;
        }
        kept.push(cand);
    }

    (kept, dropped)
}
