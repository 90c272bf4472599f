//! Identity reconciliation for character labels.
//!
//! Extraction rounds drift: the same character comes back as
//! "Sam Johnson", "samjohnson", or "Sam  Johnson" depending on how the
//! model felt that turn. Labels are normalized (case-folded, whitespace
//! stripped) and compared with a similarity ratio so minor drift resolves
//! to one registry entry instead of duplicating it.
//!
//! The threshold and the first-match-wins lookup are tunables, not a
//! guaranteed-correct identity resolution.

/// Minimum similarity ratio for two labels to denote the same entity.
pub const MATCH_THRESHOLD: f64 = 0.8;

/// Whether two character labels denote the same entity.
pub fn is_same_entity(a: &str, b: &str) -> bool {
    similarity_ratio(a, b) >= MATCH_THRESHOLD
}

/// Similarity of two labels after normalization: `2 * lcs / (|a| + |b|)`
/// over characters, in `[0, 1]`. Symmetric.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);

    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let matches = longest_common_subsequence(&a, &b);
    (2 * matches) as f64 / (a.len() + b.len()) as f64
}

/// Find the first existing registry key the label reconciles with.
pub fn find_matching_key<'a, I>(keys: I, label: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    keys.into_iter().find(|key| is_same_entity(key, label))
}

fn normalize(label: &str) -> Vec<char> {
    label
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn longest_common_subsequence(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];

    for &ca in a {
        for (j, &cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}
