//! Headless Chromium sessions via chromiumoxide.
//!
//! A session first navigates to the site origin so the edge challenge runs and
//! sets its cookies, then pulls document bytes with an in-page `fetch` so every
//! request carries them.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use futures::StreamExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{classify_response, Driver, Launcher};
use crate::config::BrowserSettings;
use crate::error::FetchError;

pub struct ChromiumLauncher {
    headless: bool,
    origin: String,
    user_agent: String,
}

impl ChromiumLauncher {
    pub fn new(settings: &BrowserSettings) -> Self {
        Self {
            headless: settings.headless,
            origin: settings.origin.clone(),
            user_agent: settings.user_agent.clone(),
        }
    }
}

#[async_trait]
impl Launcher for ChromiumLauncher {
    async fn launch(&self) -> Result<Box<dyn Driver>, FetchError> {
        let mut builder = BrowserConfig::builder()
            .window_size(1920, 1080)
            .arg("--disable-blink-features=AutomationControlled");
        if !self.headless {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|e| FetchError::transport(&self.origin, e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| FetchError::transport(&self.origin, e))?;
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| FetchError::transport(&self.origin, e))?;
        page.set_user_agent(SetUserAgentOverrideParams::new(self.user_agent.clone()))
            .await
            .map_err(|e| FetchError::transport(&self.origin, e))?;

        debug!(origin = %self.origin, "chromium launched");
        Ok(Box::new(ChromiumDriver {
            browser,
            page,
            events,
            origin: self.origin.clone(),
            warmed: false,
        }))
    }
}

struct ChromiumDriver {
    browser: Browser,
    page: Page,
    events: JoinHandle<()>,
    origin: String,
    warmed: bool,
}

#[derive(Deserialize)]
struct InPageResponse {
    status: u16,
    body: Vec<u8>,
}

fn fetch_script(url: &str) -> String {
    // serde_json gives a correctly escaped JS string literal.
    let literal = serde_json::to_string(url).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"(async () => {{
    const r = await fetch({literal}, {{ credentials: "include" }});
    const buf = new Uint8Array(await r.arrayBuffer());
    return {{ status: r.status, body: Array.from(buf) }};
}})()"#
    )
}

impl ChromiumDriver {
    async fn warm_up(&mut self) -> Result<(), FetchError> {
        self.page
            .goto(self.origin.as_str())
            .await
            .map_err(|e| FetchError::transport(&self.origin, e))?;
        let html = self
            .page
            .content()
            .await
            .map_err(|e| FetchError::transport(&self.origin, e))?;
        if super::is_challenge_page(html.as_bytes()) {
            return Err(FetchError::Blocked {
                url: self.origin.clone(),
                status: None,
            });
        }
        self.warmed = true;
        Ok(())
    }
}

#[async_trait]
impl Driver for ChromiumDriver {
    async fn fetch(&mut self, url: &str) -> Result<Vec<u8>, FetchError> {
        if !self.warmed {
            self.warm_up().await?;
        }
        let params = EvaluateParams::builder()
            .expression(fetch_script(url))
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(|e| FetchError::transport(url, e))?;
        let result = self
            .page
            .evaluate_expression(params)
            .await
            .map_err(|e| FetchError::transport(url, e))?;
        let response: InPageResponse = result
            .into_value()
            .map_err(|e| FetchError::transport(url, e))?;

        classify_response(url, response.status, &response.body)?;
        Ok(response.body)
    }

    async fn close(&mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("closing chromium: {}", e);
        }
        let _ = self.browser.wait().await;
        self.events.abort();
    }
}
