//! HTTP adapter: fetches the forum listing with a cookie-keeping browser-like client.
//!
//! Responses are run through a [`ChallengeClassifier`] before anyone looks at the body,
//! so an interstitial never reaches the extractor.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER};
use tokio::sync::RwLock;

use kwbot_core::{
    config::Config,
    errors::Error,
    fetch::{
        ChallengeClassifier, FetchMode, FetchOutcome, PageContent, PageFetcher, ResponseView,
        SignatureClassifier,
    },
    Result,
};

const ACCEPT_HTML: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
const ACCEPT_LANG: &str = "en-US,en;q=0.9";

#[derive(Clone, Debug)]
pub struct FetchSettings {
    pub listing_url: String,
    pub warmup_url: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl FetchSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            listing_url: cfg.target_url.clone(),
            warmup_url: cfg.warmup_url.clone(),
            user_agent: cfg.user_agent.clone(),
            timeout: cfg.request_timeout,
        }
    }
}

pub struct HttpFetcher {
    settings: FetchSettings,
    classifier: Arc<dyn ChallengeClassifier>,
    client: RwLock<reqwest::Client>,
}

impl HttpFetcher {
    pub fn new(settings: FetchSettings) -> Result<Self> {
        let client = build_client(&settings)?;
        Ok(Self {
            settings,
            classifier: Arc::new(SignatureClassifier::default()),
            client: RwLock::new(client),
        })
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ChallengeClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    fn url_for(&self, mode: FetchMode) -> &str {
        match mode {
            FetchMode::Warmup => &self.settings.warmup_url,
            FetchMode::Listing => &self.settings.listing_url,
        }
    }
}

fn build_client(settings: &FetchSettings) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(ACCEPT_LANG));

    reqwest::Client::builder()
        .user_agent(settings.user_agent.clone())
        .default_headers(headers)
        .cookie_store(true)
        .gzip(true)
        .timeout(settings.timeout)
        .build()
        .map_err(|e| Error::Config(format!("http client build failed: {e}")))
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, mode: FetchMode) -> Result<FetchOutcome> {
        let url = self.url_for(mode).to_string();
        let client = self.client.read().await.clone();

        let mut req = client.get(&url);
        if mode == FetchMode::Listing {
            req = req.header(REFERER, self.settings.warmup_url.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Error::Network(format!("GET {url}: {e}")))?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_ascii_lowercase(),
                    v.to_str().unwrap_or("").to_string(),
                )
            })
            .collect::<Vec<_>>();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Network(format!("GET {url}: reading body: {e}")))?;

        let view = ResponseView {
            status,
            headers: &headers,
            body: &body,
        };
        if let Some(signal) = self.classifier.classify(&view) {
            return Ok(FetchOutcome::Challenge(signal));
        }

        if !(200..300).contains(&status) {
            return Err(Error::Network(format!(
                "GET {url}: HTTP {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        Ok(FetchOutcome::Page(PageContent {
            url,
            status,
            body,
            fetched_at: Utc::now(),
        }))
    }

    async fn reset_session(&self) -> Result<()> {
        let fresh = build_client(&self.settings)?;
        *self.client.write().await = fresh;
        tracing::info!("http session reset, cookies dropped");
        Ok(())
    }
}
