//! Per-run deduplication by place identity.
//!
//! Every business on the map carries a hexadecimal place ID in its detail
//! URL (`0x890cb024fe77e7b6`) and, in the feature-ID portion, a second hex
//! token whose decimal form is the CID. Identity checks run in priority
//! order: place ID, CID, normalized href, then name+address as a last
//! resort. The first matching channel short-circuits.

#[cfg(test)]
mod proptests;

use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Feature ID: two hex tokens separated by a colon. Group 1 is the place ID,
/// group 2 converts to the CID.
static FEATURE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(0x[a-f0-9]+):(0x[a-f0-9]+)").expect("valid regex"));

/// Any hex token prefixed `0x`.
static HEX_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)0x[a-f0-9]+").expect("valid regex"));

/// Explicit `cid=` query parameter.
static CID_PARAM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"cid=(\d+)").expect("valid regex"));

/// Long decimal runs inside the `data=` blob.
static DATA_CID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"data=.*?(\d{15,20})").expect("valid regex"));

/// Extract the place ID from a detail URL.
///
/// Prefers the feature-ID pair (`!1s0x...:0x...`); falls back to the longest
/// bare hex token. Returned lowercased.
pub fn extract_place_id(href: &str) -> Option<String> {
    if href.is_empty() {
        return None;
    }
    if let Some(caps) = FEATURE_ID.captures(href) {
        return caps.get(1).map(|m| m.as_str().to_lowercase());
    }
    HEX_TOKEN
        .find_iter(href)
        .max_by_key(|m| m.as_str().len())
        .map(|m| m.as_str().to_lowercase())
}

/// Extract the CID (decimal form of the second feature-ID hex token).
pub fn extract_cid_from_feature_id(feature_id: &str) -> Option<String> {
    if feature_id.is_empty() {
        return None;
    }
    let hex = if let Some(caps) = FEATURE_ID.captures(feature_id) {
        caps.get(2).map(|m| m.as_str().to_string())
    } else {
        HEX_TOKEN.find(feature_id).map(|m| m.as_str().to_string())
    }?;
    let digits = hex.trim_start_matches("0x").trim_start_matches("0X");
    u128::from_str_radix(digits, 16).ok().map(|v| v.to_string())
}

/// Extract a CID directly from a URL, if one is present.
pub fn extract_cid_from_url(url: &str) -> Option<String> {
    if url.is_empty() {
        return None;
    }
    if let Some(caps) = CID_PARAM.captures(url) {
        return caps.get(1).map(|m| m.as_str().to_string());
    }
    DATA_CID
        .captures(url)
        .and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()))
}

/// Normalize an href for identity comparison: scheme and query stripped,
/// lowercased.
fn normalize_href(href: &str) -> String {
    let no_query = href.split('?').next().unwrap_or(href);
    no_query
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .to_lowercase()
}

/// Borrowed view of a record's identifiers, in check priority order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity<'a> {
    pub place_id: Option<&'a str>,
    pub cid: Option<&'a str>,
    pub href: Option<&'a str>,
    pub name: Option<&'a str>,
    pub address: Option<&'a str>,
}

/// Which identity channel matched a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchChannel {
    PlaceId,
    Cid,
    Href,
    NameAddress,
}

/// Dedup counters, reported with scrape stats.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupStats {
    pub total_checked: u64,
    pub duplicates_removed: u64,
    pub unique_kept: u64,
    pub by_place_id: u64,
    pub by_cid: u64,
    pub by_href: u64,
    pub by_name_address: u64,
}

/// In-memory dedup state for a single scrape run.
#[derive(Debug, Default)]
pub struct DedupService {
    seen_place_ids: HashSet<String>,
    seen_cids: HashSet<String>,
    seen_hrefs: HashSet<String>,
    seen_name_addresses: HashSet<String>,
    stats: DedupStats,
}

impl DedupService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a record against everything admitted so far. Counts the check
    /// and, on a hit, the matching channel.
    pub fn check(&mut self, id: Identity<'_>) -> Option<MatchChannel> {
        self.stats.total_checked += 1;

        let channel = self.lookup(id);
        if let Some(channel) = channel {
            self.stats.duplicates_removed += 1;
            match channel {
                MatchChannel::PlaceId => self.stats.by_place_id += 1,
                MatchChannel::Cid => self.stats.by_cid += 1,
                MatchChannel::Href => self.stats.by_href += 1,
                MatchChannel::NameAddress => self.stats.by_name_address += 1,
            }
        }
        channel
    }

    fn lookup(&self, id: Identity<'_>) -> Option<MatchChannel> {
        if let Some(place_id) = non_empty(id.place_id) {
            if self.seen_place_ids.contains(&place_id.to_lowercase()) {
                return Some(MatchChannel::PlaceId);
            }
        }
        if let Some(cid) = non_empty(id.cid) {
            if self.seen_cids.contains(cid) {
                return Some(MatchChannel::Cid);
            }
        }
        if let Some(href) = non_empty(id.href) {
            if self.seen_hrefs.contains(&normalize_href(href)) {
                return Some(MatchChannel::Href);
            }
        }
        if let (Some(name), Some(address)) = (non_empty(id.name), non_empty(id.address)) {
            if self.seen_name_addresses.contains(&name_address_key(name, address)) {
                return Some(MatchChannel::NameAddress);
            }
        }
        None
    }

    /// Check-and-insert. Returns true when the record was unique and is now
    /// tracked under every identifier it carries.
    pub fn admit(&mut self, id: Identity<'_>) -> bool {
        if self.check(id).is_some() {
            return false;
        }
        if let Some(place_id) = non_empty(id.place_id) {
            self.seen_place_ids.insert(place_id.to_lowercase());
        }
        if let Some(cid) = non_empty(id.cid) {
            self.seen_cids.insert(cid.to_string());
        }
        if let Some(href) = non_empty(id.href) {
            self.seen_hrefs.insert(normalize_href(href));
        }
        if let (Some(name), Some(address)) = (non_empty(id.name), non_empty(id.address)) {
            self.seen_name_addresses.insert(name_address_key(name, address));
        }
        self.stats.unique_kept += 1;
        true
    }

    pub fn stats(&self) -> DedupStats {
        self.stats.clone()
    }

    /// Clear all seen sets and counters for a new scrape.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Count of records admitted so far.
    #[allow(dead_code)] // Mirror of stats().unique_kept for direct callers
    pub fn unique_count(&self) -> u64 {
        self.stats.unique_kept
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn name_address_key(name: &str, address: &str) -> String {
    format!("{}|{}", name.trim().to_lowercase(), address.trim().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_place_id_from_feature_id_url() {
        let href = "/maps/place/Pizza+Hut/data=!3m4!1s0x890cb024fe77e7b6:0x123abc!8m2";
        assert_eq!(extract_place_id(href).as_deref(), Some("0x890cb024fe77e7b6"));
    }

    #[test]
    fn extracts_longest_bare_hex_token_as_fallback() {
        let href = "/maps/place/somewhere/0xab/0x890cb024fe77e7b6";
        assert_eq!(extract_place_id(href).as_deref(), Some("0x890cb024fe77e7b6"));
        assert_eq!(extract_place_id(""), None);
        assert_eq!(extract_place_id("/maps/place/no-ids-here"), None);
    }

    #[test]
    fn extracts_cid_from_query_param() {
        assert_eq!(
            extract_cid_from_url("https://maps.example.com/?cid=9876543210987654321").as_deref(),
            Some("9876543210987654321")
        );
        assert_eq!(extract_cid_from_url("https://maps.example.com/"), None);
    }

    #[test]
    fn converts_feature_id_hex_to_decimal_cid() {
        assert_eq!(
            extract_cid_from_feature_id("0x89c3afa1b597fe49:0xfff").as_deref(),
            Some("4095")
        );
        assert_eq!(
            extract_cid_from_feature_id("0x89c3afa1b597fe49:0x890cb024fe77e7b6").as_deref(),
            Some("9875461755851237302")
        );
    }

    #[test]
    fn place_id_match_short_circuits() {
        let mut dedup = DedupService::new();
        assert!(dedup.admit(Identity {
            place_id: Some("0xAB12"),
            cid: Some("111"),
            href: Some("https://maps.example.com/place/a?hl=en"),
            name: Some("Cafe One"),
            address: Some("1 Main St"),
        }));
        // Same place ID, different everything else.
        let verdict = dedup.check(Identity {
            place_id: Some("0xab12"),
            cid: Some("222"),
            href: Some("https://maps.example.com/place/b"),
            name: Some("Cafe Two"),
            address: Some("2 Side St"),
        });
        assert_eq!(verdict, Some(MatchChannel::PlaceId));
    }

    #[test]
    fn falls_back_through_cid_href_and_name_address() {
        let mut dedup = DedupService::new();
        assert!(dedup.admit(Identity {
            place_id: Some("0x1"),
            cid: Some("42"),
            href: Some("https://maps.example.com/place/x?src=a"),
            name: Some("Place X"),
            address: Some("X Road"),
        }));

        let by_cid = dedup.check(Identity { cid: Some("42"), ..Identity::default() });
        assert_eq!(by_cid, Some(MatchChannel::Cid));

        // Query string and scheme differences do not defeat the href channel.
        let by_href = dedup.check(Identity {
            href: Some("http://maps.example.com/place/X?src=b"),
            ..Identity::default()
        });
        assert_eq!(by_href, Some(MatchChannel::Href));

        let by_name = dedup.check(Identity {
            name: Some("  place x "),
            address: Some("x road"),
            ..Identity::default()
        });
        assert_eq!(by_name, Some(MatchChannel::NameAddress));
    }

    #[test]
    fn reset_clears_state_and_counters() {
        let mut dedup = DedupService::new();
        dedup.admit(Identity { place_id: Some("0x1"), ..Identity::default() });
        assert!(dedup.check(Identity { place_id: Some("0x1"), ..Identity::default() }).is_some());
        dedup.reset();
        assert_eq!(dedup.stats().total_checked, 0);
        assert!(dedup.check(Identity { place_id: Some("0x1"), ..Identity::default() }).is_none());
    }

    #[test]
    fn name_without_address_is_not_an_identity() {
        let mut dedup = DedupService::new();
        assert!(dedup.admit(Identity {
            name: Some("Ambiguous"),
            ..Identity::default()
        }));
        // No channel can match a bare name.
        assert!(dedup.check(Identity { name: Some("Ambiguous"), ..Identity::default() }).is_none());
    }
}
