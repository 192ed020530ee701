//! Listing page → ordered `PostRecord`s.
//!
//! Tolerant anchor scanning rather than a DOM: every `<a href>` whose path carries a
//! numeric post id is a candidate, the anchor text is its title. Missing structure is
//! an error, never an empty result, so layout changes show up in the logs.

use std::{collections::HashSet, sync::OnceLock};

use regex::Regex;

use crate::{
    domain::{PostId, PostRecord},
    errors::Error,
    fetch::PageContent,
    formatting::decode_html_entities,
    Result,
};

const MIN_TITLE_CHARS: usize = 2;

fn anchor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<a\b([^>]*)>(.*?)</a\s*>").expect("valid regex"))
}

fn href_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).expect("valid regex")
    })
}

fn post_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)/(?:post|topic|thread|discussion)[-/](\d+)").expect("valid regex")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"))
}

fn body_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<body\b").expect("valid regex"))
}

#[derive(Clone, Copy, Debug)]
pub struct ListingExtractor {
    max_posts: usize,
}

impl ListingExtractor {
    pub fn new(max_posts: usize) -> Self {
        Self {
            max_posts: max_posts.max(1),
        }
    }

    /// Posts in page order, each id at most once.
    pub fn extract(&self, page: &PageContent) -> Result<Vec<PostRecord>> {
        if !body_re().is_match(&page.body) {
            return Err(Error::Parse(format!("{}: no <body> in response", page.url)));
        }

        let base = url::Url::parse(&page.url)
            .map_err(|e| Error::Parse(format!("bad page url {}: {e}", page.url)))?;

        let mut seen = HashSet::new();
        let mut post_links = 0usize;
        let mut out = Vec::new();

        for cap in anchor_re().captures_iter(&page.body) {
            let attrs = cap.get(1).map(|m| m.as_str()).unwrap_or("");
            let inner = cap.get(2).map(|m| m.as_str()).unwrap_or("");

            let Some(href) = href_attr(attrs) else {
                continue;
            };
            let href = decode_html_entities(href.trim());
            if href.contains("/space/") {
                continue;
            }
            let Ok(abs) = base.join(&href) else {
                continue;
            };
            let Some(num) = post_id_re()
                .captures(abs.path())
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
            else {
                continue;
            };
            post_links += 1;

            let id = PostId(format!("post_{num}"));
            if seen.contains(&id) {
                continue;
            }

            let title = anchor_text(inner);
            if title.chars().count() < MIN_TITLE_CHARS {
                continue;
            }

            seen.insert(id.clone());
            out.push(PostRecord {
                id,
                title,
                url: abs.to_string(),
                observed_at: page.fetched_at,
            });
            if out.len() >= self.max_posts {
                break;
            }
        }

        if post_links == 0 {
            return Err(Error::Parse(format!(
                "{}: no post links found (layout changed?)",
                page.url
            )));
        }

        Ok(out)
    }
}

fn href_attr(attrs: &str) -> Option<&str> {
    let cap = href_re().captures(attrs)?;
    cap.get(1)
        .or_else(|| cap.get(2))
        .or_else(|| cap.get(3))
        .map(|m| m.as_str())
}

fn anchor_text(inner: &str) -> String {
    let stripped = tag_re().replace_all(inner, " ");
    decode_html_entities(&stripped)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
