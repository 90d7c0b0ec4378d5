//! Per-user browser session pool.
//!
//! One Chrome process serves every user; each user gets an isolated CDP
//! browser context (own cookies, storage, user agent) with a single page.
//! Admission is capped, idle and over-age sessions are swept in the
//! background, and the whole pool closes with the browser on shutdown.
//!
//! All pool state lives behind one async mutex: context creation and
//! disposal are quick CDP round-trips, and serializing them keeps the
//! active-session count authoritative.

use crate::config::Config;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetTimezoneOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::StreamExt;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Sweep cadence for the background cleanup task.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Injected into every context before any page script runs.
const STEALTH_INIT_SCRIPT: &str = r"
    Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
    Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
";

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to launch browser: {0}")]
    Launch(String),

    #[error("Maximum concurrent sessions ({0}) reached. Please try again in a few minutes.")]
    Exhausted(usize),

    #[error("Browser operation failed: {0}")]
    Cdp(#[from] CdpError),
}

/// Pool tuning, extracted from the application config.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub max_age: Duration,
    pub headless: bool,
    pub browser_timeout: Duration,
    pub user_agents: Vec<String>,
}

impl From<&Config> for PoolConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_sessions: config.max_sessions,
            idle_timeout: config.idle_timeout,
            max_age: config.session_max_age,
            headless: config.headless,
            browser_timeout: config.browser_timeout,
            user_agents: config.user_agents.clone(),
        }
    }
}

/// One user's isolated browser context.
struct UserSession {
    context_id: BrowserContextId,
    page: Page,
    created_at: Instant,
    last_activity: Instant,
    scrape_count: u64,
}

impl UserSession {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.scrape_count += 1;
    }
}

/// Ephemeral context handed to card-extraction workers. Not tracked in the
/// session map; callers dispose it when done.
pub struct WorkerPage {
    pub page: Page,
    context_id: BrowserContextId,
}

struct PoolInner {
    browser: Option<Browser>,
    handler_task: Option<JoinHandle<()>>,
    sessions: HashMap<String, UserSession>,
}

/// Browser session pool shared by all users.
pub struct SessionPool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    shutting_down: AtomicBool,
}

impl SessionPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        tracing::info!(
            max_sessions = config.max_sessions,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            max_age_secs = config.max_age.as_secs(),
            "session pool initialized"
        );
        Arc::new(Self {
            config,
            inner: Mutex::new(PoolInner {
                browser: None,
                handler_task: None,
                sessions: HashMap::new(),
            }),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Launch the shared browser and start the background sweeper. The
    /// sweeper runs regardless, so a failed launch here is retried lazily
    /// on the next acquire.
    pub async fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let Some(pool) = weak.upgrade() else { break };
                if pool.shutting_down.load(Ordering::Relaxed) {
                    break;
                }
                let mut inner = pool.inner.lock().await;
                let cleaned = pool.cleanup_locked(&mut inner).await;
                if cleaned > 0 {
                    tracing::info!(cleaned, "background cleanup removed sessions");
                }
            }
        });

        let mut inner = self.inner.lock().await;
        self.ensure_browser(&mut inner).await?;
        Ok(())
    }

    /// Get or create the isolated session for a user.
    ///
    /// At the cap, idle and over-age sessions are cleaned eagerly; if the
    /// pool is still full the call fails with [`PoolError::Exhausted`].
    pub async fn acquire(&self, user_id: &str) -> Result<Page, PoolError> {
        let mut inner = self.inner.lock().await;
        self.ensure_browser(&mut inner).await?;

        if let Some(session) = inner.sessions.get_mut(user_id) {
            session.touch();
            tracing::debug!(user_id, "reusing existing session");
            return Ok(session.page.clone());
        }

        if inner.sessions.len() >= self.config.max_sessions {
            self.cleanup_locked(&mut inner).await;
            if inner.sessions.len() >= self.config.max_sessions {
                return Err(PoolError::Exhausted(self.config.max_sessions));
            }
        }

        let session = self.create_session(&mut inner).await?;
        let page = session.page.clone();
        inner.sessions.insert(user_id.to_string(), session);
        tracing::info!(user_id, total = inner.sessions.len(), "created new session");
        Ok(page)
    }

    /// Close a user's session immediately.
    pub async fn release(&self, user_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.remove(user_id) {
            Self::dispose_context(&mut inner, &session.context_id).await;
            tracing::info!(user_id, remaining = inner.sessions.len(), "released session");
        }
    }

    /// Force-recreate a user's session. Useful when a context has been
    /// wedged by the remote site.
    pub async fn reset(&self, user_id: &str) -> Result<Page, PoolError> {
        self.release(user_id).await;
        self.acquire(user_id).await
    }

    /// Create a short-lived context for one card extraction.
    pub async fn worker_page(&self) -> Result<WorkerPage, PoolError> {
        let mut inner = self.inner.lock().await;
        self.ensure_browser(&mut inner).await?;
        let (context_id, page) = self.create_context_page(&mut inner).await?;
        Ok(WorkerPage { page, context_id })
    }

    /// Dispose a worker context. Close errors are swallowed so extraction
    /// always makes progress.
    pub async fn dispose_worker(&self, worker: WorkerPage) {
        let mut inner = self.inner.lock().await;
        Self::dispose_context(&mut inner, &worker.context_id).await;
    }

    /// Pool statistics for the session-info endpoint.
    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        let sessions = inner
            .sessions
            .iter()
            .map(|(user_id, s)| {
                (
                    user_id.clone(),
                    SessionInfo {
                        idle_minutes: minutes(now.duration_since(s.last_activity)),
                        age_minutes: minutes(now.duration_since(s.created_at)),
                        scrape_count: s.scrape_count,
                    },
                )
            })
            .collect();
        PoolStats {
            active_sessions: inner.sessions.len(),
            max_sessions: self.config.max_sessions,
            available_slots: self.config.max_sessions.saturating_sub(inner.sessions.len()),
            idle_timeout_minutes: minutes(self.config.idle_timeout),
            sessions,
        }
    }

    /// Close every session and the underlying browser.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down session pool");
        self.shutting_down.store(true, Ordering::Relaxed);

        let mut inner = self.inner.lock().await;
        let user_ids: Vec<String> = inner.sessions.keys().cloned().collect();
        for user_id in user_ids {
            if let Some(session) = inner.sessions.remove(&user_id) {
                Self::dispose_context(&mut inner, &session.context_id).await;
            }
        }

        if let Some(mut browser) = inner.browser.take() {
            if let Err(e) = browser.close().await {
                tracing::warn!(error = %e, "error closing browser");
            }
            let _ = browser.wait().await;
        }
        if let Some(task) = inner.handler_task.take() {
            task.abort();
        }
        tracing::info!("session pool shut down");
    }

    // ==================== Internals ====================

    async fn ensure_browser(&self, inner: &mut PoolInner) -> Result<(), PoolError> {
        if inner.browser.is_some() {
            return Ok(());
        }

        let user_data_dir =
            std::env::temp_dir().join(format!("placescout-chrome-{}", std::process::id()));
        std::fs::create_dir_all(&user_data_dir)
            .map_err(|e| PoolError::Launch(format!("user data dir: {e}")))?;

        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .request_timeout(self.config.browser_timeout)
            .user_data_dir(&user_data_dir)
            .viewport(chromiumoxide::handler::viewport::Viewport {
                width: 1920,
                height: 1080,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: true,
                has_touch: false,
            })
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-extensions")
            .arg("--disable-software-rasterizer")
            .arg("--disable-background-timer-throttling")
            .arg("--disable-backgrounding-occluded-windows")
            .arg("--disable-renderer-backgrounding");
        builder = if self.config.headless {
            builder.new_headless_mode()
        } else {
            builder.with_head()
        };
        let config = builder.build().map_err(PoolError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| PoolError::Launch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!(error = %e, "CDP handler error");
                }
            }
        });

        inner.browser = Some(browser);
        inner.handler_task = Some(handler_task);
        tracing::info!("shared browser launched");
        Ok(())
    }

    /// Create an isolated context with its page, fully configured. A partial
    /// failure tears the context down before surfacing the error.
    async fn create_session(&self, inner: &mut PoolInner) -> Result<UserSession, PoolError> {
        let (context_id, page) = self.create_context_page(inner).await?;
        let now = Instant::now();
        Ok(UserSession {
            context_id,
            page,
            created_at: now,
            last_activity: now,
            scrape_count: 0,
        })
    }

    async fn create_context_page(
        &self,
        inner: &mut PoolInner,
    ) -> Result<(BrowserContextId, Page), PoolError> {
        let browser = inner
            .browser
            .as_mut()
            .ok_or_else(|| PoolError::Launch("browser not running".to_string()))?;

        let context_id = browser
            .execute(CreateBrowserContextParams::default())
            .await?
            .result
            .browser_context_id;

        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(PoolError::Launch)?;

        let page = match browser.new_page(target).await {
            Ok(page) => page,
            Err(e) => {
                Self::dispose_on(browser, &context_id).await;
                return Err(PoolError::Cdp(e));
            }
        };

        if let Err(e) = self.configure_page(&page).await {
            Self::dispose_on(browser, &context_id).await;
            return Err(e);
        }

        Ok((context_id, page))
    }

    /// Apply the per-context disguise: rotated user agent, fixed timezone,
    /// and the anti-automation init script.
    async fn configure_page(&self, page: &Page) -> Result<(), PoolError> {
        let user_agent = self
            .config
            .user_agents
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_default();

        if !user_agent.is_empty() {
            let params = SetUserAgentOverrideParams::builder()
                .user_agent(user_agent)
                .accept_language("en-US")
                .build()
                .map_err(PoolError::Launch)?;
            page.execute(params).await?;
        }

        let timezone = SetTimezoneOverrideParams::builder()
            .timezone_id("America/New_York")
            .build()
            .map_err(PoolError::Launch)?;
        page.execute(timezone).await?;

        let stealth = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(STEALTH_INIT_SCRIPT)
            .build()
            .map_err(PoolError::Launch)?;
        page.execute(stealth).await?;

        Ok(())
    }

    /// Remove idle and over-age sessions. Must run under the pool lock.
    async fn cleanup_locked(&self, inner: &mut PoolInner) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, &'static str)> = inner
            .sessions
            .iter()
            .filter_map(|(user_id, session)| {
                expiry_reason(
                    now.duration_since(session.last_activity),
                    now.duration_since(session.created_at),
                    self.config.idle_timeout,
                    self.config.max_age,
                )
                .map(|reason| (user_id.clone(), reason))
            })
            .collect();

        let count = expired.len();
        for (user_id, reason) in expired {
            if let Some(session) = inner.sessions.remove(&user_id) {
                tracing::info!(user_id = %user_id, reason, "cleaning up session");
                Self::dispose_context(inner, &session.context_id).await;
            }
        }
        count
    }

    async fn dispose_context(inner: &mut PoolInner, context_id: &BrowserContextId) {
        if let Some(browser) = inner.browser.as_mut() {
            Self::dispose_on(browser, context_id).await;
        }
    }

    async fn dispose_on(browser: &mut Browser, context_id: &BrowserContextId) {
        let params = DisposeBrowserContextParams::builder()
            .browser_context_id(context_id.clone())
            .build();
        match params {
            Ok(params) => {
                if let Err(e) = browser.execute(params).await {
                    tracing::debug!(error = %e, "error disposing browser context");
                }
            }
            Err(e) => tracing::debug!(error = %e, "invalid dispose params"),
        }
    }
}

/// Why a session is eligible for cleanup, if it is.
fn expiry_reason(
    idle: Duration,
    age: Duration,
    idle_timeout: Duration,
    max_age: Duration,
) -> Option<&'static str> {
    if idle > idle_timeout {
        Some("idle")
    } else if age > max_age {
        Some("max_age")
    } else {
        None
    }
}

fn minutes(d: Duration) -> f64 {
    (d.as_secs_f64() / 60.0 * 10.0).round() / 10.0
}

/// Pool statistics for the session-info endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub available_slots: usize,
    pub idle_timeout_minutes: f64,
    pub sessions: HashMap<String, SessionInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub idle_minutes: f64,
    pub age_minutes: f64,
    pub scrape_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PoolConfig {
        PoolConfig {
            max_sessions: 2,
            idle_timeout: Duration::from_secs(30 * 60),
            max_age: Duration::from_secs(120 * 60),
            headless: true,
            browser_timeout: Duration::from_secs(60),
            user_agents: vec!["test-agent".to_string()],
        }
    }

    #[test]
    fn expiry_prefers_idle_over_age() {
        let idle_timeout = Duration::from_secs(100);
        let max_age = Duration::from_secs(1000);

        assert_eq!(
            expiry_reason(Duration::from_secs(101), Duration::from_secs(50), idle_timeout, max_age),
            Some("idle")
        );
        assert_eq!(
            expiry_reason(Duration::from_secs(5), Duration::from_secs(2000), idle_timeout, max_age),
            Some("max_age")
        );
        assert_eq!(
            expiry_reason(Duration::from_secs(5), Duration::from_secs(50), idle_timeout, max_age),
            None
        );
        // Boundary: exactly at the timeout is not yet expired.
        assert_eq!(
            expiry_reason(Duration::from_secs(100), Duration::from_secs(50), idle_timeout, max_age),
            None
        );
    }

    #[tokio::test]
    async fn stats_reflect_configuration_before_launch() {
        let pool = SessionPool::new(test_config());
        let stats = pool.stats().await;
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.max_sessions, 2);
        assert_eq!(stats.available_slots, 2);
        assert!((stats.idle_timeout_minutes - 30.0).abs() < f64::EPSILON);
    }

    // End-to-end pool behavior needs a real Chrome; run with
    // `cargo test -- --ignored` on a machine that has one.
    #[tokio::test]
    #[ignore = "requires Chrome"]
    async fn acquire_release_shutdown_invariants() {
        let pool = SessionPool::new(test_config());
        pool.start().await.unwrap();

        let _page_a = pool.acquire("user-a").await.unwrap();
        let _page_b = pool.acquire("user-b").await.unwrap();
        assert_eq!(pool.stats().await.active_sessions, 2);

        // Same user re-acquires without consuming a slot.
        let _again = pool.acquire("user-a").await.unwrap();
        assert_eq!(pool.stats().await.active_sessions, 2);

        // Third user hits the cap: nothing is idle or over-age to reclaim.
        let err = pool.acquire("user-c").await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted(2)));
        assert_eq!(pool.stats().await.active_sessions, 2);

        pool.release("user-a").await;
        assert_eq!(pool.stats().await.active_sessions, 1);
        let _page_c = pool.acquire("user-c").await.unwrap();

        pool.shutdown().await;
        assert_eq!(pool.stats().await.active_sessions, 0);
    }
}
