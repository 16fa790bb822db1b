//! Plain HTTP sessions. Enough for mirrors without an edge challenge.

use async_trait::async_trait;
use reqwest::Client;

use super::{classify_response, Driver, Launcher};
use crate::config::BrowserSettings;
use crate::error::FetchError;

pub struct HttpLauncher {
    user_agent: String,
}

impl HttpLauncher {
    pub fn new(settings: &BrowserSettings) -> Self {
        Self {
            user_agent: settings.user_agent.clone(),
        }
    }
}

#[async_trait]
impl Launcher for HttpLauncher {
    async fn launch(&self) -> Result<Box<dyn Driver>, FetchError> {
        // A fresh client per session gives a fresh cookie jar and connection pool.
        let client = Client::builder()
            .user_agent(self.user_agent.clone())
            .cookie_store(true)
            .build()
            .map_err(|e| FetchError::transport("client", e))?;
        Ok(Box::new(HttpDriver { client }))
    }
}

struct HttpDriver {
    client: Client,
}

#[async_trait]
impl Driver for HttpDriver {
    async fn fetch(&mut self, url: &str) -> Result<Vec<u8>, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::transport(url, e))?;
        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::transport(url, e))?;
        classify_response(url, status, &body)?;
        Ok(body.to_vec())
    }

    async fn close(&mut self) {}
}
