//! Selector chains for detail-panel field extraction.
//!
//! The map UI churns its class names constantly, so every field is located
//! through an ordered chain of selectors tried until one yields a value.
//! Accessible attributes (`aria-label`) outlive class-name churn and come
//! first wherever the UI exposes them; class-based selectors are the
//! fallback tail. Numeric fields are parsed out of accessible labels with
//! regexes ("4.5 stars", "1,234 reviews").

use chromiumoxide::Page;
use regex::Regex;
use std::sync::LazyLock;

/// "4.5 stars" / "4,5 stars" in an accessible label.
static RATING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([\d.,]+)\s*star").expect("valid regex"));

/// Leading grouped digits, e.g. "1,234 reviews".
static REVIEWS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d,]+)").expect("valid regex"));

/// `@lat,lng` pair embedded in the page URL after navigation.
static COORDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@(-?\d+\.?\d*),(-?\d+\.?\d*)").expect("valid regex"));

/// How a located element yields its value.
#[derive(Debug, Clone, Copy)]
pub enum Strategy {
    /// Rendered text content.
    Text,
    /// The `aria-label` attribute verbatim.
    AriaLabel,
    /// A named attribute.
    Attribute(&'static str),
    /// First capture group of a regex applied to the `aria-label`.
    RegexOnAria(&'static Regex),
}

/// One step in a field's selector chain.
#[derive(Debug, Clone, Copy)]
pub struct FieldSelector {
    pub css: &'static str,
    pub strategy: Strategy,
}

const fn text(css: &'static str) -> FieldSelector {
    FieldSelector { css, strategy: Strategy::Text }
}

const fn aria(css: &'static str) -> FieldSelector {
    FieldSelector { css, strategy: Strategy::AriaLabel }
}

const fn attr(css: &'static str, name: &'static str) -> FieldSelector {
    FieldSelector { css, strategy: Strategy::Attribute(name) }
}

pub static NAME_CHAIN: LazyLock<Vec<FieldSelector>> = LazyLock::new(|| {
    vec![
        aria(r#"div[role="main"] h1"#),
        text(r#"div[role="main"] h1"#),
        aria("h1[aria-label]"),
        text("h1.DUwDvf"),
        text("h1.fontHeadlineLarge"),
        text(r#"h1[class*="fontHeadline"]"#),
        text("h1"),
    ]
});

pub static RATING_CHAIN: LazyLock<Vec<FieldSelector>> = LazyLock::new(|| {
    vec![
        FieldSelector {
            css: r#"div[role="img"][aria-label*="star"]"#,
            strategy: Strategy::RegexOnAria(LazyLock::force(&RATING_RE)),
        },
        FieldSelector {
            css: r#"span[aria-label*="star"]"#,
            strategy: Strategy::RegexOnAria(LazyLock::force(&RATING_RE)),
        },
        text(r#"div.F7nice span[aria-hidden="true"]"#),
    ]
});

pub static REVIEWS_CHAIN: LazyLock<Vec<FieldSelector>> = LazyLock::new(|| {
    vec![
        FieldSelector {
            css: r#"button[aria-label*="review"]"#,
            strategy: Strategy::RegexOnAria(LazyLock::force(&REVIEWS_RE)),
        },
        FieldSelector {
            css: r#"span[aria-label*="review"]"#,
            strategy: Strategy::RegexOnAria(LazyLock::force(&REVIEWS_RE)),
        },
    ]
});

pub static CATEGORY_CHAIN: LazyLock<Vec<FieldSelector>> = LazyLock::new(|| {
    vec![
        text("button.DkEaL"),
        text(r#"button[jsaction*="category"]"#),
        text("span.DkEaL"),
    ]
});

pub static ADDRESS_CHAIN: LazyLock<Vec<FieldSelector>> = LazyLock::new(|| {
    vec![
        aria(r#"button[data-item-id="address"]"#),
        aria(r#"button[aria-label*="Address"]"#),
        text(r#"button[aria-label*="Address"]"#),
    ]
});

pub static PHONE_CHAIN: LazyLock<Vec<FieldSelector>> = LazyLock::new(|| {
    vec![
        aria(r#"button[data-item-id*="phone"]"#),
        aria(r#"button[aria-label*="Phone"]"#),
        text(r#"button[aria-label*="Phone"]"#),
    ]
});

pub static WEBSITE_CHAIN: LazyLock<Vec<FieldSelector>> = LazyLock::new(|| {
    vec![
        attr(r#"a[data-item-id="authority"]"#, "href"),
        attr(r#"a[aria-label*="Website"]"#, "href"),
    ]
});

pub static HOURS_CHAIN: LazyLock<Vec<FieldSelector>> =
    LazyLock::new(|| vec![aria(r#"div[aria-label*="hour"]"#)]);

pub static PHOTO_CHAIN: LazyLock<Vec<FieldSelector>> =
    LazyLock::new(|| vec![attr(r#"img[decoding="async"]"#, "src")]);

/// Selector marking the claimed-business badge.
pub const CLAIMED_SELECTOR: &str = r#"span[aria-label*="Claimed"]"#;

/// Try each selector in order; the first non-empty value wins.
pub async fn resolve_chain(page: &Page, chain: &[FieldSelector]) -> Option<String> {
    for selector in chain {
        if let Some(value) = resolve_one(page, selector).await {
            return Some(value);
        }
    }
    None
}

async fn resolve_one(page: &Page, selector: &FieldSelector) -> Option<String> {
    let element = page.find_element(selector.css).await.ok()?;
    let raw = match selector.strategy {
        Strategy::Text => element.inner_text().await.ok().flatten(),
        Strategy::AriaLabel => element.attribute("aria-label").await.ok().flatten(),
        Strategy::Attribute(name) => element.attribute(name).await.ok().flatten(),
        Strategy::RegexOnAria(re) => element
            .attribute("aria-label")
            .await
            .ok()
            .flatten()
            .and_then(|label| {
                re.captures(&label)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_string())
            }),
    };
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parse a rating value out of chain output; only 0–5 is plausible.
pub fn parse_rating(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().replace(',', ".");
    let value: f64 = cleaned.parse().ok()?;
    (0.0..=5.0).contains(&value).then_some(value)
}

/// Parse a review count out of chain output ("1,234" → 1234).
pub fn parse_review_count(raw: &str) -> Option<i64> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok().filter(|n| *n >= 0)
}

/// Pull `(lat, lng)` out of a detail-page URL.
pub fn parse_coordinates(url: &str) -> Option<(f64, f64)> {
    let caps = COORDS_RE.captures(url)?;
    let lat: f64 = caps.get(1)?.as_str().parse().ok()?;
    let lng: f64 = caps.get(2)?.as_str().parse().ok()?;
    Some((lat, lng))
}

/// Strip a field prefix from an accessible label ("Address: 1 Main St").
pub fn strip_label_prefix<'a>(value: &'a str, prefix: &str) -> &'a str {
    value.trim().trim_start_matches(prefix).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ratings_with_either_decimal_separator() {
        assert_eq!(parse_rating("4.5"), Some(4.5));
        assert_eq!(parse_rating("4,5"), Some(4.5));
        assert_eq!(parse_rating(" 3.0 "), Some(3.0));
        assert_eq!(parse_rating("12.5"), None);
        assert_eq!(parse_rating("stars"), None);
    }

    #[test]
    fn rating_regex_extracts_from_accessible_labels() {
        let caps = RATING_RE.captures("4.6 stars, 1,208 reviews").unwrap();
        assert_eq!(caps.get(1).unwrap().as_str(), "4.6");
        let caps = RATING_RE.captures("Rated 4,2 Stars").unwrap();
        assert_eq!(caps.get(1).unwrap().as_str(), "4,2");
    }

    #[test]
    fn parses_grouped_review_counts() {
        assert_eq!(parse_review_count("1,234"), Some(1234));
        assert_eq!(parse_review_count("87 reviews"), Some(87));
        assert_eq!(parse_review_count("no digits"), None);
    }

    #[test]
    fn extracts_coordinates_from_url() {
        let url = "https://www.google.com/maps/place/Cafe/@31.6339793,74.8722642,17z/data=!3m1";
        assert_eq!(parse_coordinates(url), Some((31.633_979_3, 74.872_264_2)));
        assert_eq!(parse_coordinates("https://example.com/no-coords"), None);
    }

    #[test]
    fn negative_coordinates_survive() {
        let url = "https://maps.example.com/@-33.8688,-151.2093,12z";
        assert_eq!(parse_coordinates(url), Some((-33.8688, -151.2093)));
    }

    #[test]
    fn strips_label_prefixes() {
        assert_eq!(strip_label_prefix("Address: 1 Main St", "Address:"), "1 Main St");
        assert_eq!(strip_label_prefix("Phone: +91 12345", "Phone:"), "+91 12345");
        assert_eq!(strip_label_prefix("1 Main St", "Address:"), "1 Main St");
    }

    #[test]
    fn name_chain_prefers_accessible_main_heading() {
        let first = NAME_CHAIN.first().unwrap();
        assert_eq!(first.css, r#"div[role="main"] h1"#);
        assert!(matches!(first.strategy, Strategy::AriaLabel));
        assert!(matches!(NAME_CHAIN.last().unwrap().strategy, Strategy::Text));
    }
}
