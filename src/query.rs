//! Search query normalization for cursor matching.
//!
//! Repeat scrapes should resume from the same cursor even when the query is
//! phrased differently ("dentist in Amritsar" vs "amritsar dentist"). The
//! canonical form is deterministic: lowercase, strip punctuation, drop stop
//! words, split service tokens from location indicators, sort each partition
//! alphabetically. The MD5 hex digest of the canonical form is the indexed
//! lookup key; fuzzy matching over canonical forms is the fallback path.

use md5::{Digest, Md5};
use regex::Regex;
use similar::TextDiff;
use std::sync::LazyLock;

/// Words that indicate a location follows ("dentist *in* amritsar").
const LOCATION_WORDS: &[&str] = &["in", "near", "around", "at", "of", "for"];

/// Articles and conjunctions removed entirely.
const STOP_WORDS: &[&str] = &["the", "a", "an", "and", "or"];

/// Default similarity threshold for fuzzy query matching.
pub const FUZZY_THRESHOLD: f32 = 0.85;

/// Punctuation other than `-` and `&`, which are meaningful in business names.
static PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s\-&]").expect("valid regex"));

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Normalize a query to its canonical token-sorted form.
///
/// `"Dentist - in Amritsar"` → `"amritsar dentist in"`,
/// `"DENTIST Amritsar"` → `"amritsar dentist"`.
pub fn normalize(query: &str) -> String {
    if query.trim().is_empty() {
        return String::new();
    }

    let lowered = query.to_lowercase();
    let stripped = PUNCTUATION.replace_all(&lowered, " ");
    let collapsed = WHITESPACE.replace_all(stripped.trim(), " ");

    let mut service_tokens: Vec<&str> = Vec::new();
    let mut location_tokens: Vec<&str> = Vec::new();

    for token in collapsed.split(' ') {
        // Tokens left over from stripped punctuation ("-", "&") carry no
        // matchable content and would perturb the sort order.
        if !token.chars().any(char::is_alphanumeric) {
            continue;
        }
        if STOP_WORDS.contains(&token) {
            continue;
        }
        if LOCATION_WORDS.contains(&token) {
            location_tokens.push(token);
        } else {
            service_tokens.push(token);
        }
    }

    service_tokens.sort_unstable();
    location_tokens.sort_unstable();
    service_tokens.extend(location_tokens);
    service_tokens.join(" ")
}

/// MD5 hex digest of the normalized query, used as the indexed cursor key.
pub fn query_hash(query: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(normalize(query).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Both the canonical form and its hash in one pass.
pub fn normalize_with_hash(query: &str) -> (String, String) {
    let normalized = normalize(query);
    let mut hasher = Md5::new();
    hasher.update(normalized.as_bytes());
    (normalized, format!("{:x}", hasher.finalize()))
}

/// Similarity ratio of the two queries' canonical forms, in `[0, 1]`.
pub fn similarity(query1: &str, query2: &str) -> f32 {
    let norm1 = normalize(query1);
    let norm2 = normalize(query2);
    if norm1.is_empty() || norm2.is_empty() {
        return 0.0;
    }
    TextDiff::from_chars(norm1.as_str(), norm2.as_str()).ratio()
}

/// True when the two queries are close enough to share a cursor.
pub fn fuzzy_match(query1: &str, query2: &str, threshold: f32) -> bool {
    similarity(query1, query2) >= threshold
}

/// Split a query into (service, location) for display purposes.
///
/// "dentist in Amritsar" → ("dentist", "amritsar"). Without an explicit
/// indicator the last tokens are assumed to be the location.
#[allow(dead_code)] // Analytics helper, not yet wired to a surface
pub fn extract_parts(query: &str) -> (String, String) {
    let lowered = query.to_lowercase();
    let stripped = PUNCTUATION.replace_all(&lowered, " ");
    let collapsed = WHITESPACE.replace_all(stripped.trim(), " ");
    let tokens: Vec<&str> = collapsed.split(' ').filter(|t| !t.is_empty()).collect();

    for (i, token) in tokens.iter().enumerate() {
        if LOCATION_WORDS.contains(token) && i + 1 < tokens.len() {
            return (
                tokens.get(..i).unwrap_or_default().join(" "),
                tokens.get(i + 1..).unwrap_or_default().join(" "),
            );
        }
    }

    if tokens.len() >= 2 {
        let (head, tail) = tokens.split_at(1);
        return (head.join(" "), tail.join(" "));
    }
    (query.trim().to_string(), String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_punctuation_and_location_indicators() {
        assert_eq!(normalize("Dentist - in Amritsar"), "amritsar dentist in");
        assert_eq!(normalize("DENTIST Amritsar"), "amritsar dentist");
        assert_eq!(normalize("dentist amritsar"), "amritsar dentist");
        assert_eq!(normalize("amritsar dentist"), "amritsar dentist");
    }

    #[test]
    fn drops_stop_words_and_sorts_partitions() {
        assert_eq!(
            normalize("  the best dentist near amritsar  "),
            "amritsar best dentist near"
        );
        assert_eq!(normalize("a cafe and bakery"), "bakery cafe");
    }

    #[test]
    fn empty_and_symbol_only_queries_normalize_to_empty() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   "), "");
        assert_eq!(normalize("- & -"), "");
    }

    #[test]
    fn equivalent_queries_share_a_hash() {
        assert_eq!(query_hash("dentist in Amritsar"), query_hash("Amritsar dentist in"));
        assert_ne!(query_hash("dentist amritsar"), query_hash("plumber amritsar"));
    }

    #[test]
    fn hash_is_md5_of_normalized_form() {
        // md5("amritsar dentist")
        assert_eq!(query_hash("DENTIST Amritsar").len(), 32);
        assert_eq!(query_hash("DENTIST Amritsar"), query_hash("dentist amritsar"));
    }

    #[test]
    fn fuzzy_matches_small_variations() {
        assert!(fuzzy_match("dentist amritsar", "dentist in amritsar", FUZZY_THRESHOLD));
        assert!(!fuzzy_match("dentist amritsar", "plumber ludhiana", FUZZY_THRESHOLD));
        assert!(!fuzzy_match("", "dentist", FUZZY_THRESHOLD));
    }

    #[test]
    fn extracts_service_and_location() {
        assert_eq!(
            extract_parts("dentist in Amritsar"),
            ("dentist".to_string(), "amritsar".to_string())
        );
        assert_eq!(
            extract_parts("pizza delhi"),
            ("pizza".to_string(), "delhi".to_string())
        );
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// The hash is a pure function of the canonical form: two queries
        /// hash identically exactly when they normalize identically.
        #[test]
        fn hash_equality_tracks_normal_form_equality(
            a in "[a-zA-Z &\\-]{0,40}",
            b in "[a-zA-Z &\\-]{0,40}",
        ) {
            prop_assert_eq!(
                normalize(&a) == normalize(&b),
                query_hash(&a) == query_hash(&b)
            );
        }

        #[test]
        fn normalize_is_idempotent(q in "[a-zA-Z &\\-]{0,60}") {
            let once = normalize(&q);
            let twice = normalize(&once);
            prop_assert_eq!(twice, once);
        }

        /// Token order never affects the canonical form.
        #[test]
        fn token_order_is_irrelevant(tokens in proptest::collection::vec("[a-z]{1,8}", 1..6)) {
            let forward = tokens.join(" ");
            let mut reversed = tokens.clone();
            reversed.reverse();
            prop_assert_eq!(normalize(&forward), normalize(&reversed.join(" ")));
        }
    }
}
