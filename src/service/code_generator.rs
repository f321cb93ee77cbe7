use crate::models::redeem_code::{CODE_PATTERN, normalize_code};
use rand::distr::{Alphanumeric, SampleString};
use std::collections::HashSet;

/// Random upper-case alphanumeric code, optionally prefixed (`PREFIX-XXXX`).
pub fn generate_code(prefix: Option<&str>, length: usize) -> String {
    let body = Alphanumeric.sample_string(&mut rand::rng(), length.max(4)).to_uppercase();

    match prefix.map(normalize_code).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{}-{}", prefix.trim_end_matches('-'), body),
        None => body,
    }
}

/// `count` distinct codes. Collisions with existing rows are left to the
/// unique index.
pub fn generate_codes(prefix: Option<&str>, length: usize, count: usize) -> Vec<String> {
    let mut seen = HashSet::with_capacity(count);
    let mut codes = Vec::with_capacity(count);

    while codes.len() < count {
        let code = generate_code(prefix, length);
        if seen.insert(code.clone()) {
            codes.push(code);
        }
    }

    codes
}

/// True when `code` is acceptable as a stored code after normalization.
pub fn is_valid_code(code: &str) -> bool {
    CODE_PATTERN.is_match(code)
}
