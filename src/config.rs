//! Runtime configuration loaded from environment variables.

use std::time::Duration;

/// Public map-search endpoint; the query is appended with `+` separators.
pub const DEFAULT_MAPS_SEARCH_URL: &str = "https://www.google.com/maps/search/";

/// Default user agents rotated across browser contexts.
const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
];

/// Application settings, all overridable through the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port (`PLACESCOUT_PORT`)
    pub port: u16,
    /// SQLite database path (`PLACESCOUT_DB_PATH`)
    pub db_path: String,
    /// Map-search endpoint (`MAPS_SEARCH_URL`); overridable for fixtures
    pub maps_search_url: String,

    // Scraper settings
    /// Cards extracted in parallel per scrape (`MAX_CONCURRENT_CARDS`)
    pub max_concurrent_cards: usize,
    /// Stop after this many scrolls with zero new cards (`STALE_SCROLL_LIMIT`)
    pub stale_scroll_limit: usize,
    /// Default number of results per scrape (`DEFAULT_TARGET_COUNT`)
    pub default_target_count: usize,
    /// Random delay bounds between scrolls, seconds (`SCROLL_DELAY_MIN`/`MAX`)
    pub scroll_delay_min: f64,
    pub scroll_delay_max: f64,
    /// Random delay bounds between card extractions (`CARD_EXTRACT_DELAY_MIN`/`MAX`)
    pub card_extract_delay_min: f64,
    pub card_extract_delay_max: f64,

    // Browser settings
    /// Run Chrome headless (`HEADLESS`)
    pub headless: bool,
    /// Per-operation browser timeout (`BROWSER_TIMEOUT_MS`)
    pub browser_timeout: Duration,
    /// User agents rotated per context (`USER_AGENTS`, comma-separated)
    pub user_agents: Vec<String>,

    // Session pool settings
    /// Maximum concurrent user sessions (`MAX_SESSIONS`)
    pub max_sessions: usize,
    /// Close sessions idle longer than this (`IDLE_TIMEOUT_MINUTES`)
    pub idle_timeout: Duration,
    /// Force-close sessions older than this (`SESSION_MAX_AGE_MINUTES`)
    pub session_max_age: Duration,

    /// Days until a pagination cursor expires (`CURSOR_TTL_DAYS`)
    pub cursor_ttl_days: i64,
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let user_agents = std::env::var("USER_AGENTS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|ua| !ua.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| DEFAULT_USER_AGENTS.iter().map(|&s| s.to_string()).collect());

        let db_path = std::env::var("PLACESCOUT_DB_PATH").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.placescout/placescout.db")
        });

        Self {
            port: env_parse("PLACESCOUT_PORT", 8000),
            db_path,
            maps_search_url: std::env::var("MAPS_SEARCH_URL")
                .unwrap_or_else(|_| DEFAULT_MAPS_SEARCH_URL.to_string()),
            max_concurrent_cards: env_parse("MAX_CONCURRENT_CARDS", 4),
            stale_scroll_limit: env_parse("STALE_SCROLL_LIMIT", 5),
            default_target_count: env_parse("DEFAULT_TARGET_COUNT", 50),
            scroll_delay_min: env_parse("SCROLL_DELAY_MIN", 1.0),
            scroll_delay_max: env_parse("SCROLL_DELAY_MAX", 3.0),
            card_extract_delay_min: env_parse("CARD_EXTRACT_DELAY_MIN", 0.5),
            card_extract_delay_max: env_parse("CARD_EXTRACT_DELAY_MAX", 1.5),
            headless: env_parse("HEADLESS", true),
            browser_timeout: Duration::from_millis(env_parse("BROWSER_TIMEOUT_MS", 60_000)),
            user_agents,
            max_sessions: env_parse("MAX_SESSIONS", 20),
            idle_timeout: Duration::from_secs(env_parse("IDLE_TIMEOUT_MINUTES", 30u64) * 60),
            session_max_age: Duration::from_secs(env_parse("SESSION_MAX_AGE_MINUTES", 120u64) * 60),
            cursor_ttl_days: env_parse("CURSOR_TTL_DAYS", 30),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        // Run against a clean environment: only assert fields no test sets.
        let config = Config::from_env();
        assert_eq!(config.max_concurrent_cards, 4);
        assert_eq!(config.stale_scroll_limit, 5);
        assert_eq!(config.default_target_count, 50);
        assert_eq!(config.max_sessions, 20);
        assert_eq!(config.cursor_ttl_days, 30);
        assert_eq!(config.browser_timeout, Duration::from_secs(60));
        assert_eq!(config.idle_timeout, Duration::from_secs(30 * 60));
        assert_eq!(config.session_max_age, Duration::from_secs(120 * 60));
        assert_eq!(config.user_agents.len(), 5);
    }
}
