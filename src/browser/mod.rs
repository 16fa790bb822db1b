//! Browser sessions as a managed resource: pacing, timeouts, recycling.

#[cfg(feature = "chromium")]
pub mod chromium;
pub mod http;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{Backend, BrowserSettings};
use crate::error::FetchError;

/// One live browser context able to fetch bytes by URL.
#[async_trait]
pub trait Driver: Send {
    async fn fetch(&mut self, url: &str) -> Result<Vec<u8>, FetchError>;
    async fn close(&mut self);
}

/// Starts fresh drivers. Shared by every worker.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn Driver>, FetchError>;
}

#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    pub min_interval: Duration,
    pub fetch_timeout: Duration,
    /// Fetches before a full teardown; 0 never recycles.
    pub recycle_after: u32,
}

impl From<&BrowserSettings> for SessionPolicy {
    fn from(s: &BrowserSettings) -> Self {
        Self {
            min_interval: s.min_interval(),
            fetch_timeout: s.fetch_timeout(),
            recycle_after: s.recycle_after,
        }
    }
}

pub fn launcher_for(settings: &BrowserSettings) -> anyhow::Result<Arc<dyn Launcher>> {
    match settings.backend {
        #[cfg(feature = "chromium")]
        Backend::Chromium => Ok(Arc::new(chromium::ChromiumLauncher::new(settings))),
        #[cfg(not(feature = "chromium"))]
        Backend::Chromium => anyhow::bail!("built without the `chromium` feature; set browser.backend = \"http\""),
        Backend::Http => Ok(Arc::new(http::HttpLauncher::new(settings))),
    }
}

// ── Session ──

/// Exclusively owned by one worker for its lifetime.
pub struct Session {
    id: usize,
    launcher: Arc<dyn Launcher>,
    driver: Option<Box<dyn Driver>>,
    policy: SessionPolicy,
    last_fetch: Option<Instant>,
    since_launch: u32,
    fetches: u64,
    launches: u32,
    needs_relaunch: bool,
}

impl Session {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn fetches(&self) -> u64 {
        self.fetches
    }

    pub fn launches(&self) -> u32 {
        self.launches
    }

    /// Fetch one URL, waiting out the pacing interval first.
    pub async fn fetch(&mut self, url: &str) -> Result<Vec<u8>, FetchError> {
        let worn_out =
            self.policy.recycle_after > 0 && self.since_launch >= self.policy.recycle_after;
        if self.driver.is_none() || self.needs_relaunch || worn_out {
            self.recycle().await?;
        }

        if let Some(last) = self.last_fetch {
            tokio::time::sleep_until(last + self.policy.min_interval).await;
        }
        self.last_fetch = Some(Instant::now());
        self.since_launch += 1;
        self.fetches += 1;

        let Some(driver) = self.driver.as_mut() else {
            return Err(FetchError::transport(url, "session has no live browser"));
        };
        let outcome = tokio::time::timeout(self.policy.fetch_timeout, driver.fetch(url)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                // A page that hung may still be loading; start clean next time.
                self.needs_relaunch = true;
                Err(FetchError::Timeout {
                    url: url.to_string(),
                    elapsed: self.policy.fetch_timeout,
                })
            }
        }
    }

    /// Full teardown and a fresh context.
    pub async fn recycle(&mut self) -> Result<(), FetchError> {
        if let Some(mut old) = self.driver.take() {
            debug!(session = self.id, fetches = self.since_launch, "recycling browser session");
            old.close().await;
        }
        self.driver = Some(self.launcher.launch().await?);
        self.launches += 1;
        self.since_launch = 0;
        self.needs_relaunch = false;
        Ok(())
    }

    async fn close(mut self) {
        if let Some(mut driver) = self.driver.take() {
            driver.close().await;
        }
    }
}

// ── Pool ──

pub struct SessionPool {
    launcher: Arc<dyn Launcher>,
    policy: SessionPolicy,
    next_id: AtomicUsize,
}

impl SessionPool {
    pub fn new(launcher: Arc<dyn Launcher>, policy: SessionPolicy) -> Self {
        Self {
            launcher,
            policy,
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    /// Launch a new session; the browser is started eagerly.
    pub async fn acquire(&self) -> Result<Session, FetchError> {
        let driver = self.launcher.launch().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, "browser session ready");
        Ok(Session {
            id,
            launcher: Arc::clone(&self.launcher),
            driver: Some(driver),
            policy: self.policy,
            last_fetch: None,
            since_launch: 0,
            fetches: 0,
            launches: 1,
            needs_relaunch: false,
        })
    }

    pub async fn release(&self, session: Session) {
        debug!(session = session.id, fetches = session.fetches, "releasing browser session");
        session.close().await;
    }
}

// ── Retry ──

/// Longest single pause between two attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// `base * 2^(attempt-1)`, capped at [`MAX_BACKOFF`].
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    2u32.checked_pow(attempt.saturating_sub(1))
        .and_then(|factor| base.checked_mul(factor))
        .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
}

// ── Response classification ──

const CHALLENGE_MARKERS: &[&str] = &[
    "errors.edgesuite.net",
    "request unsuccessful. incapsula",
    "checking your browser before accessing",
    "just a moment...",
];

/// Map a completed response to blocked/transport, or accept it.
pub fn classify_response(url: &str, status: u16, body: &[u8]) -> Result<(), FetchError> {
    match status {
        403 | 429 => Err(FetchError::Blocked {
            url: url.to_string(),
            status: Some(status),
        }),
        s if s >= 400 => Err(FetchError::transport(url, format!("HTTP {s}"))),
        _ if is_challenge_page(body) => Err(FetchError::Blocked {
            url: url.to_string(),
            status: Some(status),
        }),
        _ => Ok(()),
    }
}

/// Edge denial pages are small HTML documents carrying one of a few phrases.
pub fn is_challenge_page(body: &[u8]) -> bool {
    if body.starts_with(b"%PDF") || body.len() > 32 * 1024 {
        return false;
    }
    let text = String::from_utf8_lossy(body).to_lowercase();
    CHALLENGE_MARKERS.iter().any(|m| text.contains(m)) || title_is_denial(&text)
}

/// "Access Denied" counts only as the page title; decisions may quote it.
fn title_is_denial(text: &str) -> bool {
    let Some(start) = text.find("<title") else {
        return false;
    };
    let rest = &text[start..];
    let (Some(open), Some(close)) = (rest.find('>'), rest.find("</title>")) else {
        return false;
    };
    open < close && rest[open + 1..close].contains("access denied")
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    use super::*;

    type Responder = dyn Fn(&str) -> Result<Vec<u8>, FetchError> + Send + Sync;

    /// In-memory launcher whose drivers answer from a closure.
    #[derive(Clone)]
    pub struct ScriptedLauncher {
        respond: Arc<Responder>,
        delay: Option<Duration>,
        launches: Arc<AtomicU32>,
        calls: Arc<Mutex<Vec<(String, Instant)>>>,
    }

    impl ScriptedLauncher {
        pub fn new(f: impl Fn(&str) -> Result<Vec<u8>, FetchError> + Send + Sync + 'static) -> Self {
            Self {
                respond: Arc::new(f),
                delay: None,
                launches: Arc::new(AtomicU32::new(0)),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn launch_count(&self) -> u32 {
            self.launches.load(Ordering::SeqCst)
        }

        pub fn calls(&self) -> Vec<(String, Instant)> {
            self.calls.lock().unwrap().clone()
        }

        pub fn pool(&self, min_interval: Duration) -> SessionPool {
            SessionPool::new(
                Arc::new(self.clone()),
                SessionPolicy {
                    min_interval,
                    fetch_timeout: Duration::from_secs(30),
                    recycle_after: 0,
                },
            )
        }
    }

    struct ScriptedDriver(ScriptedLauncher);

    #[async_trait]
    impl Launcher for ScriptedLauncher {
        async fn launch(&self) -> Result<Box<dyn Driver>, FetchError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedDriver(self.clone())))
        }
    }

    #[async_trait]
    impl Driver for ScriptedDriver {
        async fn fetch(&mut self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.0
                .calls
                .lock()
                .unwrap()
                .push((url.to_string(), Instant::now()));
            if let Some(delay) = self.0.delay {
                tokio::time::sleep(delay).await;
            }
            (self.0.respond)(url)
        }

        async fn close(&mut self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedLauncher;
    use super::*;
    use crate::error::FailureKind;

    fn ok_launcher() -> ScriptedLauncher {
        ScriptedLauncher::new(|url| Ok(url.as_bytes().to_vec()))
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_fetches_respect_min_interval() {
        let launcher = ok_launcher();
        let interval = Duration::from_millis(2500);
        let pool = launcher.pool(interval);
        let mut session = pool.acquire().await.unwrap();

        for i in 0..5 {
            session.fetch(&format!("https://x.test/{i}")).await.unwrap();
        }
        let calls = launcher.calls();
        assert_eq!(calls.len(), 5);
        for pair in calls.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= interval);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_pace_independently() {
        let launcher = ok_launcher();
        let pool = launcher.pool(Duration::from_secs(5));
        let mut a = pool.acquire().await.unwrap();
        let mut b = pool.acquire().await.unwrap();
        let start = Instant::now();
        a.fetch("https://x.test/a").await.unwrap();
        b.fetch("https://x.test/b").await.unwrap();
        assert!(Instant::now() - start < Duration::from_secs(1));
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test(start_paused = true)]
    async fn recycles_after_configured_fetch_count() {
        let launcher = ok_launcher();
        let pool = SessionPool::new(
            Arc::new(launcher.clone()),
            SessionPolicy {
                min_interval: Duration::ZERO,
                fetch_timeout: Duration::from_secs(5),
                recycle_after: 2,
            },
        );
        let mut session = pool.acquire().await.unwrap();
        for _ in 0..5 {
            session.fetch("https://x.test/").await.unwrap();
        }
        assert_eq!(session.launches(), 3);
        assert_eq!(launcher.launch_count(), 3);
        assert_eq!(session.fetches(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_times_out_and_relaunches() {
        let launcher = ok_launcher().with_delay(Duration::from_secs(120));
        let pool = SessionPool::new(
            Arc::new(launcher.clone()),
            SessionPolicy {
                min_interval: Duration::ZERO,
                fetch_timeout: Duration::from_secs(60),
                recycle_after: 0,
            },
        );
        let mut session = pool.acquire().await.unwrap();
        let err = session.fetch("https://x.test/slow").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Timeout);

        let _ = session.fetch("https://x.test/slow").await;
        assert_eq!(launcher.launch_count(), 2);
    }

    #[test]
    fn classifies_denials() {
        let denied = b"<html><head><title>Access Denied</title></head><body>Reference #18.5</body></html>";
        assert!(matches!(
            classify_response("u", 200, denied),
            Err(FetchError::Blocked { .. })
        ));
        assert_eq!(classify_response("u", 429, b"").unwrap_err().kind(), FailureKind::Blocked);
        assert_eq!(classify_response("u", 502, b"").unwrap_err().kind(), FailureKind::Transport);
        assert!(classify_response("u", 200, b"%PDF-1.7 access denied").is_ok());
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, 40), MAX_BACKOFF);
        assert_eq!(backoff_delay(base, u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn quoted_denial_in_a_decision_is_accepted() {
        let decision = b"<html><head><title>ISCR Case No. 21-01234</title></head><body>\
            <p>Applicant testified that the system returned access denied after his \
            account was suspended.</p></body></html>";
        assert!(classify_response("u", 200, decision).is_ok());
        let edge = b"<html><body>Access Denied. Reference errors.edgesuite.net/18.5</body></html>";
        assert!(is_challenge_page(edge));
    }
}
