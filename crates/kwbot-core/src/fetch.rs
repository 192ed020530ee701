use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Result;

/// Which page a fetch targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchMode {
    /// Site root; establishes cookies/session before listing fetches resume.
    Warmup,
    /// The post listing itself.
    Listing,
}

impl FetchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warmup => "warmup",
            Self::Listing => "listing",
        }
    }
}

/// A successfully fetched page.
#[derive(Clone, Debug)]
pub struct PageContent {
    pub url: String,
    pub status: u16,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChallengeSignal {
    pub status: u16,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub enum FetchOutcome {
    Page(PageContent),
    Challenge(ChallengeSignal),
}

/// Port for the HTTP side. Transport failures are `Error::Network`.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, mode: FetchMode) -> Result<FetchOutcome>;

    /// Drop cookies/session so the next warmup starts clean.
    async fn reset_session(&self) -> Result<()> {
        Ok(())
    }
}

/// What the classifier gets to look at. Header names are lowercase.
#[derive(Clone, Copy, Debug)]
pub struct ResponseView<'a> {
    pub status: u16,
    pub headers: &'a [(String, String)],
    pub body: &'a str,
}

impl ResponseView<'_> {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Decides whether a response is an anti-bot challenge rather than content.
///
/// Kept separate from the fetcher so site-specific heuristics can change without
/// touching the poll loop.
pub trait ChallengeClassifier: Send + Sync {
    fn classify(&self, resp: &ResponseView<'_>) -> Option<ChallengeSignal>;
}

/// Status/header/body-signature heuristics for Cloudflare-style interstitials.
#[derive(Clone, Debug)]
pub struct SignatureClassifier {
    /// Matched on 403/429/503 bodies.
    pub soft_signatures: Vec<String>,
    /// Matched on any body, including 2xx.
    pub strong_signatures: Vec<String>,
}

impl Default for SignatureClassifier {
    fn default() -> Self {
        let lower = |xs: &[&str]| xs.iter().map(|s| s.to_lowercase()).collect::<Vec<_>>();
        Self {
            soft_signatures: lower(&[
                "cloudflare",
                "attention required",
                "access denied",
                "ddos protection",
                "checking your browser",
                "captcha",
                // Also injected into normal pages by the bot-detection script.
                "challenge-platform",
            ]),
            strong_signatures: lower(&[
                "cf-chl-",
                "challenge-form",
                "cf-browser-verification",
                "<title>just a moment",
                "g-recaptcha",
                "hcaptcha.com",
            ]),
        }
    }
}

impl ChallengeClassifier for SignatureClassifier {
    fn classify(&self, resp: &ResponseView<'_>) -> Option<ChallengeSignal> {
        let signal = |reason: String| {
            Some(ChallengeSignal {
                status: resp.status,
                reason,
            })
        };

        if resp
            .header("cf-mitigated")
            .is_some_and(|v| v.eq_ignore_ascii_case("challenge"))
        {
            return signal("cf-mitigated: challenge".to_string());
        }

        let body = resp.body.to_lowercase();
        if let Some(sig) = self.strong_signatures.iter().find(|s| body.contains(s.as_str())) {
            return signal(format!("body signature {sig:?}"));
        }

        if matches!(resp.status, 403 | 429 | 503) {
            if let Some(sig) = self.soft_signatures.iter().find(|s| body.contains(s.as_str())) {
                return signal(format!("status {} with {sig:?}", resp.status));
            }
        }

        if matches!(resp.status, 403 | 503)
            && resp
                .header("server")
                .is_some_and(|v| v.to_lowercase().contains("cloudflare"))
        {
            return signal(format!("status {} from cloudflare edge", resp.status));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view<'a>(status: u16, headers: &'a [(String, String)], body: &'a str) -> ResponseView<'a> {
        ResponseView {
            status,
            headers,
            body,
        }
    }

    #[test]
    fn normal_page_is_not_a_challenge() {
        let c = SignatureClassifier::default();
        // Mentioning the CDN on a 200 page is fine.
        let body = r#"<html><script src="https://cdnjs.cloudflare.com/x.js"></script><body>ok</body></html>"#;
        assert!(c.classify(&view(200, &[], body)).is_none());
        assert!(c.classify(&view(500, &[], "internal error")).is_none());
        let with_jsd = r#"<body><a href="/post-1-1">Hello</a>
<script src="/cdn-cgi/challenge-platform/scripts/jsd/main.js"></script></body>"#;
        assert!(c.classify(&view(200, &[], with_jsd)).is_none());
        assert!(c.classify(&view(503, &[], with_jsd)).is_some());
        // A post title is not a challenge.
        let listing = r#"<body><a href="/post-9-1">Any tool to solve captcha?</a></body>"#;
        assert!(c.classify(&view(200, &[], listing)).is_none());
        assert!(c.classify(&view(403, &[], listing)).is_some());
    }

    #[test]
    fn detects_interstitial_by_body_status_and_header() {
        let c = SignatureClassifier::default();
        assert!(c
            .classify(&view(200, &[], "<html><head><title>Just a moment...</title>"))
            .is_some());
        assert!(c
            .classify(&view(200, &[], r#"<form id="challenge-form" action="/?__cf_chl_f_tk=x">"#))
            .is_some());
        assert!(c
            .classify(&view(403, &[], "Attention Required! | Cloudflare"))
            .is_some());

        let headers = vec![("cf-mitigated".to_string(), "challenge".to_string())];
        let sig = c.classify(&view(403, &headers, "")).unwrap();
        assert_eq!(sig.status, 403);

        let headers = vec![("Server".to_string(), "cloudflare".to_string())];
        assert!(c.classify(&view(503, &headers, "")).is_some());
        assert!(c.classify(&view(404, &headers, "")).is_none());
    }
}
