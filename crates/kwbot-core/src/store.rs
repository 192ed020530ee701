//! Durable monitor state: keywords, the seen-post ledger and the last block status.
//!
//! All access goes through [`StateStore`], a single mutex-guarded struct shared by the
//! poll loop and the command listener. Every mutation is flushed to the state file
//! before the lock is released; a failed flush is logged and counted but the in-memory
//! state stays authoritative for the running process.
//!
//! The state file is the same JSON document that carries the static config. Only the
//! `keywords`, `notified_entries` and `block_status` keys are rewritten; everything
//! else is preserved as found on disk.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::{
    domain::{Match, PostId, PostRecord},
    errors::Error,
    filter, Result,
};

const KEY_KEYWORDS: &str = "keywords";
const KEY_SEEN: &str = "notified_entries";
const KEY_BLOCK: &str = "block_status";

// ============== KeywordSet ==============

/// Case-normalized keyword set. Empty means "match nothing".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeywordSet {
    words: BTreeSet<String>,
}

impl KeywordSet {
    /// Trim, collapse inner whitespace and lowercase. `None` for blank input.
    pub fn normalize(raw: &str) -> Option<String> {
        let joined = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if joined.is_empty() {
            None
        } else {
            Some(joined.to_lowercase())
        }
    }

    /// Returns `false` if the (normalized) keyword was already present.
    pub fn insert(&mut self, normalized: String) -> bool {
        self.words.insert(normalized)
    }

    pub fn remove(&mut self, normalized: &str) -> bool {
        self.words.remove(normalized)
    }

    pub fn contains(&self, normalized: &str) -> bool {
        self.words.contains(normalized)
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Sorted.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.words.iter().map(|s| s.as_str())
    }

    /// Keywords contained in `title` (case-insensitive substring).
    pub fn matches(&self, title: &str) -> Vec<String> {
        if self.words.is_empty() {
            return Vec::new();
        }
        let haystack = title.to_lowercase();
        self.words
            .iter()
            .filter(|kw| haystack.contains(kw.as_str()))
            .cloned()
            .collect()
    }
}

impl<S: AsRef<str>> FromIterator<S> for KeywordSet {
    fn from_iter<I: IntoIterator<Item = S>>(items: I) -> Self {
        let words = items
            .into_iter()
            .filter_map(|s| Self::normalize(s.as_ref()))
            .collect();
        Self { words }
    }
}

// ============== SeenLedger ==============

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenEntry {
    pub id: PostId,
    pub seen_at: DateTime<Utc>,
}

/// Bounded set of processed post ids with least-recently-seen eviction.
///
/// Re-recording an id refreshes its recency, so an id that keeps showing up on the
/// listing page can never be evicted ahead of one that dropped off it.
#[derive(Clone, Debug)]
pub struct SeenLedger {
    capacity: usize,
    next_seq: u64,
    by_id: HashMap<PostId, (u64, DateTime<Utc>)>,
    order: BTreeMap<u64, PostId>,
}

impl SeenLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: 0,
            by_id: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    pub fn contains(&self, id: &PostId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Mark `id` as seen at `at`, making it the most recent entry.
    pub fn record(&mut self, id: PostId, at: DateTime<Utc>) {
        if let Some((old_seq, _)) = self.by_id.remove(&id) {
            self.order.remove(&old_seq);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, id.clone());
        self.by_id.insert(id, (seq, at));
        self.prune();
    }

    pub fn forget(&mut self, id: &PostId) -> bool {
        match self.by_id.remove(id) {
            Some((seq, _)) => {
                self.order.remove(&seq);
                true
            }
            None => false,
        }
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<SeenEntry> {
        self.order
            .values()
            .filter_map(|id| {
                self.by_id.get(id).map(|(_, at)| SeenEntry {
                    id: id.clone(),
                    seen_at: *at,
                })
            })
            .collect()
    }

    fn prune(&mut self) {
        while self.by_id.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.by_id.remove(&oldest);
        }
    }
}

// ============== BlockStatus ==============

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStatus {
    pub blocked: bool,
    #[serde(default)]
    pub last_challenge_at: Option<DateTime<Utc>>,
}

// ============== StateStore ==============

/// Result of a keyword mutation; carries the normalized form for replies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeywordChange {
    Added(String),
    AlreadyPresent(String),
    Removed(String),
    NotFound(String),
    Invalid,
}

#[derive(Debug)]
struct StoreState {
    keywords: KeywordSet,
    ledger: SeenLedger,
    block: BlockStatus,
    storage_failures: u64,
    /// Last good copy of the whole document; the base for writes while the main
    /// file is unreadable.
    base: Map<String, Value>,
}

pub struct StateStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl StateStore {
    /// Open (or start empty at) the state file. Fails only if the file exists but
    /// neither it nor its backup can be read.
    pub fn open(path: impl Into<PathBuf>, seen_capacity: usize) -> Result<Self> {
        let path = path.into();
        let doc = read_document(&path)?;
        let state = state_from_document(&doc, seen_capacity);
        tracing::info!(
            path = %path.display(),
            keywords = state.keywords.len(),
            seen = state.ledger.len(),
            "state loaded"
        );
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Load the state file but never write back (one-shot diagnostics).
    pub fn open_detached(path: &Path, seen_capacity: usize) -> Result<Self> {
        let doc = read_document(path)?;
        Ok(Self {
            path: None,
            state: Mutex::new(state_from_document(&doc, seen_capacity)),
        })
    }

    /// Non-persistent store (diagnostics and tests).
    pub fn in_memory(keywords: KeywordSet, seen_capacity: usize) -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState {
                keywords,
                ledger: SeenLedger::new(seen_capacity),
                block: BlockStatus::default(),
                storage_failures: 0,
                base: Map::new(),
            }),
        }
    }

    pub async fn add_keyword(&self, raw: &str) -> KeywordChange {
        let Some(kw) = KeywordSet::normalize(raw) else {
            return KeywordChange::Invalid;
        };
        let mut st = self.state.lock().await;
        if !st.keywords.insert(kw.clone()) {
            return KeywordChange::AlreadyPresent(kw);
        }
        self.flush(&mut st);
        KeywordChange::Added(kw)
    }

    pub async fn remove_keyword(&self, raw: &str) -> KeywordChange {
        let Some(kw) = KeywordSet::normalize(raw) else {
            return KeywordChange::Invalid;
        };
        let mut st = self.state.lock().await;
        if !st.keywords.remove(&kw) {
            return KeywordChange::NotFound(kw);
        }
        self.flush(&mut st);
        KeywordChange::Removed(kw)
    }

    /// Sorted snapshot.
    pub async fn keywords(&self) -> Vec<String> {
        let st = self.state.lock().await;
        st.keywords.iter().map(|s| s.to_string()).collect()
    }

    /// Dedup + match `posts`, then record every one of them as seen.
    ///
    /// Evaluation and recording happen under a single lock acquisition, so a concurrent
    /// `/add` lands either entirely before or entirely after this batch.
    pub async fn filter_and_record(&self, posts: &[PostRecord]) -> Vec<Match> {
        let mut st = self.state.lock().await;
        let matches = filter::select_matches(posts, &st.keywords, &st.ledger);

        // Newest posts come first on the page; record them last so they stay the longest.
        for post in posts.iter().rev() {
            st.ledger.record(post.id.clone(), post.observed_at);
        }

        if !posts.is_empty() {
            self.flush(&mut st);
        }
        matches
    }

    pub async fn is_seen(&self, id: &PostId) -> bool {
        self.state.lock().await.ledger.contains(id)
    }

    pub async fn seen_count(&self) -> usize {
        self.state.lock().await.ledger.len()
    }

    /// Drop ids from the ledger so a later cycle can match them again.
    pub async fn forget(&self, ids: &[PostId]) {
        if ids.is_empty() {
            return;
        }
        let mut st = self.state.lock().await;
        let mut changed = false;
        for id in ids {
            changed |= st.ledger.forget(id);
        }
        if changed {
            self.flush(&mut st);
        }
    }

    pub async fn block_status(&self) -> BlockStatus {
        self.state.lock().await.block.clone()
    }

    pub async fn set_block_status(&self, status: BlockStatus) {
        let mut st = self.state.lock().await;
        if st.block == status {
            return;
        }
        st.block = status;
        self.flush(&mut st);
    }

    pub async fn storage_failures(&self) -> u64 {
        self.state.lock().await.storage_failures
    }

    fn flush(&self, st: &mut StoreState) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_state(path, st) {
            st.storage_failures += 1;
            tracing::error!(
                error = %e,
                failures = st.storage_failures,
                "failed to persist state; in-memory state kept, changes may be lost on crash"
            );
        }
    }
}

// ============== Document I/O ==============

/// Read the JSON state document at `path`, falling back to `<path>.bak` if the main
/// file is malformed. A missing file yields an empty object.
pub fn read_document(path: &Path) -> Result<Value> {
    let backup = sibling(path, "bak");

    match read_json_object(path) {
        Ok(Some(v)) => return Ok(v),
        Ok(None) if !backup.exists() => return Ok(Value::Object(Map::new())),
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "state file unreadable, trying backup");
        }
    }

    match read_json_object(&backup) {
        Ok(Some(v)) => {
            tracing::warn!(path = %backup.display(), "loaded state from backup");
            Ok(v)
        }
        Ok(None) if !path.exists() => Ok(Value::Object(Map::new())),
        Ok(None) => Err(Error::Storage {
            path: path.to_path_buf(),
            reason: "state file is malformed and no backup exists".to_string(),
        }),
        Err(e) => Err(Error::Storage {
            path: path.to_path_buf(),
            reason: format!("state file and backup unreadable: {e}"),
        }),
    }
}

fn read_json_object(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let txt = fs::read_to_string(path)?;
    if txt.trim().is_empty() {
        return Ok(Some(Value::Object(Map::new())));
    }
    let v: Value = serde_json::from_str(&txt)?;
    if !v.is_object() {
        return Err(Error::Parse(format!(
            "{} is not a JSON object",
            path.display()
        )));
    }
    Ok(Some(v))
}

fn write_state(path: &Path, st: &mut StoreState) -> Result<()> {
    // Re-read so operator edits to the config sections are never clobbered.
    let (mut doc, main_valid) = match read_json_object(path) {
        Ok(Some(Value::Object(map))) => {
            st.base = map.clone();
            (map, true)
        }
        Ok(None) => (st.base.clone(), false),
        Ok(Some(_)) | Err(_) => {
            tracing::warn!(path = %path.display(), "state file unreadable, rewriting from last loaded document");
            (st.base.clone(), false)
        }
    };

    doc.insert(
        KEY_KEYWORDS.to_string(),
        Value::Array(
            st.keywords
                .iter()
                .map(|s| Value::String(s.to_string()))
                .collect(),
        ),
    );
    doc.insert(
        KEY_SEEN.to_string(),
        serde_json::to_value(st.ledger.entries())?,
    );
    doc.insert(KEY_BLOCK.to_string(), serde_json::to_value(&st.block)?);

    let txt = serde_json::to_string_pretty(&Value::Object(doc))?;
    write_atomic(path, &txt, main_valid).map_err(|e| Error::Storage {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Write to `<path>.tmp`, keep the previous file as `<path>.bak`, then rename into place.
/// The backup is only refreshed from a main file that parsed.
fn write_atomic(path: &Path, contents: &str, refresh_backup: bool) -> std::io::Result<()> {
    let tmp = sibling(path, "tmp");
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(&tmp, contents)?;

    if refresh_backup && path.exists() {
        if let Err(e) = fs::copy(path, sibling(path, "bak")) {
            tracing::warn!(error = %e, "failed to refresh state backup");
        }
    }

    let res = fs::rename(&tmp, path);
    if res.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    res
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".");
    s.push(suffix);
    PathBuf::from(s)
}

fn state_from_document(doc: &Value, seen_capacity: usize) -> StoreState {
    let keywords = doc
        .get(KEY_KEYWORDS)
        .and_then(|v| v.as_array())
        .map(|xs| xs.iter().filter_map(|x| x.as_str()).collect::<KeywordSet>())
        .unwrap_or_default();

    let mut ledger = SeenLedger::new(seen_capacity);
    for entry in seen_entries_from(doc.get(KEY_SEEN)) {
        ledger.record(entry.id, entry.seen_at);
    }

    let block = doc
        .get(KEY_BLOCK)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();

    StoreState {
        keywords,
        ledger,
        block,
        storage_failures: 0,
        base: doc.as_object().cloned().unwrap_or_default(),
    }
}

/// Accepts the current array form and the older `{ id: { "time": "..." } }` map,
/// returning entries oldest first.
fn seen_entries_from(v: Option<&Value>) -> Vec<SeenEntry> {
    match v {
        Some(Value::Array(xs)) => xs
            .iter()
            .filter_map(|x| serde_json::from_value::<SeenEntry>(x.clone()).ok())
            .collect(),
        Some(Value::Object(map)) => {
            let now = Utc::now();
            let mut out: Vec<SeenEntry> = map
                .iter()
                .map(|(id, meta)| SeenEntry {
                    id: PostId(id.clone()),
                    seen_at: meta
                        .get("time")
                        .and_then(|t| t.as_str())
                        .and_then(parse_legacy_time)
                        .unwrap_or(now),
                })
                .collect();
            out.sort_by(|a, b| a.seen_at.cmp(&b.seen_at));
            out
        }
        _ => Vec::new(),
    }
}

fn parse_legacy_time(s: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post(id: &str, title: &str) -> PostRecord {
        PostRecord {
            id: PostId(id.to_string()),
            title: title.to_string(),
            url: format!("https://forum.example/{id}"),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn normalize_trims_collapses_and_lowercases() {
        assert_eq!(
            KeywordSet::normalize("  Hetzner   CX22 "),
            Some("hetzner cx22".to_string())
        );
        assert_eq!(KeywordSet::normalize("   "), None);
    }

    #[test]
    fn ledger_evicts_least_recently_seen() {
        let mut l = SeenLedger::new(3);
        let t = Utc::now();
        for id in ["a", "b", "c"] {
            l.record(PostId(id.to_string()), t);
        }
        // "a" shows up again, so "b" is now the oldest.
        l.record(PostId("a".to_string()), t);
        l.record(PostId("d".to_string()), t);

        assert!(l.contains(&PostId("a".to_string())));
        assert!(!l.contains(&PostId("b".to_string())));
        assert!(l.contains(&PostId("c".to_string())));
        assert!(l.contains(&PostId("d".to_string())));
        assert_eq!(l.len(), 3);

        let order: Vec<_> = l.entries().into_iter().map(|e| e.id.0).collect();
        assert_eq!(order, vec!["c", "a", "d"]);
    }

    #[tokio::test]
    async fn add_keyword_is_idempotent() {
        let store = StateStore::in_memory(KeywordSet::default(), 10);
        assert_eq!(
            store.add_keyword("Foo").await,
            KeywordChange::Added("foo".to_string())
        );
        assert_eq!(
            store.add_keyword(" foo ").await,
            KeywordChange::AlreadyPresent("foo".to_string())
        );
        assert_eq!(store.keywords().await, vec!["foo".to_string()]);
        assert_eq!(store.add_keyword("  ").await, KeywordChange::Invalid);
    }

    #[tokio::test]
    async fn remove_absent_keyword_is_not_found() {
        let store = StateStore::in_memory(KeywordSet::from_iter(["bar"]), 10);
        assert_eq!(
            store.remove_keyword("foo").await,
            KeywordChange::NotFound("foo".to_string())
        );
        assert_eq!(store.keywords().await, vec!["bar".to_string()]);
        assert_eq!(
            store.remove_keyword("BAR").await,
            KeywordChange::Removed("bar".to_string())
        );
        assert!(store.keywords().await.is_empty());
    }

    #[tokio::test]
    async fn persists_and_preserves_config_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            serde_json::to_string(&json!({
                "telegram": { "bot_token": "t", "chat_id": "1" },
                "keywords": ["vps"]
            }))
            .unwrap(),
        )
        .unwrap();

        let store = StateStore::open(&path, 100).unwrap();
        assert_eq!(store.keywords().await, vec!["vps".to_string()]);
        store.add_keyword("Dedicated").await;
        store.filter_and_record(&[post("post_1", "cheap vps")]).await;

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["telegram"]["bot_token"], "t");
        assert_eq!(doc["keywords"], json!(["dedicated", "vps"]));
        assert_eq!(doc["notified_entries"][0]["id"], "post_1");
        assert!(sibling(&path, "bak").exists());

        let reopened = StateStore::open(&path, 100).unwrap();
        assert!(reopened.is_seen(&PostId("post_1".to_string())).await);
        assert_eq!(reopened.keywords().await.len(), 2);
        assert_eq!(reopened.storage_failures().await, 0);
    }

    #[test]
    fn malformed_file_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        std::fs::write(sibling(&path, "bak"), r#"{"keywords":["gpu"]}"#).unwrap();

        let doc = read_document(&path).unwrap();
        assert_eq!(doc["keywords"], json!(["gpu"]));

        std::fs::remove_file(sibling(&path, "bak")).unwrap();
        assert!(matches!(
            read_document(&path),
            Err(Error::Storage { .. })
        ));
    }

    #[tokio::test]
    async fn write_after_backup_load_keeps_config_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let bak = sibling(&path, "bak");
        std::fs::write(&path, "{ truncated").unwrap();
        std::fs::write(
            &bak,
            serde_json::to_string(&json!({
                "telegram": { "bot_token": "t", "chat_id": "1" },
                "monitor": { "listing_url": "https://forum.example/" },
                "keywords": ["vps"]
            }))
            .unwrap(),
        )
        .unwrap();

        let store = StateStore::open(&path, 100).unwrap();
        store.add_keyword("gpu").await;

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["telegram"]["bot_token"], "t");
        assert_eq!(doc["monitor"]["listing_url"], "https://forum.example/");
        assert_eq!(doc["keywords"], json!(["gpu", "vps"]));

        let backup: Value = serde_json::from_str(&std::fs::read_to_string(&bak).unwrap()).unwrap();
        assert_eq!(backup["telegram"]["bot_token"], "t");

        // The next write runs against a good main file and refreshes the backup from it.
        store.add_keyword("ssd").await;
        let backup: Value = serde_json::from_str(&std::fs::read_to_string(&bak).unwrap()).unwrap();
        assert_eq!(backup["keywords"], json!(["gpu", "vps"]));
        assert_eq!(store.storage_failures().await, 0);
    }

    #[tokio::test]
    async fn concurrent_add_is_seen_by_next_cycle() {
        let store = std::sync::Arc::new(StateStore::in_memory(KeywordSet::default(), 100));
        let first = vec![post("post_1", "cheap gpu server")];

        let adder = {
            let store = store.clone();
            tokio::spawn(async move { store.add_keyword("gpu").await })
        };
        let cycle = {
            let store = store.clone();
            let posts = first.clone();
            tokio::spawn(async move { store.filter_and_record(&posts).await })
        };
        assert_eq!(adder.await.unwrap(), KeywordChange::Added("gpu".to_string()));
        let first_matches = cycle.await.unwrap();
        // Either before or after the add, never a partial view.
        assert!(first_matches.len() <= 1);
        assert!(store.is_seen(&PostId("post_1".to_string())).await);

        let next = store
            .filter_and_record(&[post("post_2", "GPU box for rent")])
            .await;
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].keywords, vec!["gpu".to_string()]);
    }

    #[test]
    fn missing_file_is_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let doc = read_document(&dir.path().join("nope.json")).unwrap();
        assert_eq!(doc, json!({}));
    }

    #[test]
    fn reads_legacy_notified_entries_map() {
        let doc = json!({
            "notified_entries": {
                "post_2": { "title": "b", "time": "2025-03-02 10:00:00" },
                "post_1": { "title": "a", "time": "2025-03-01 10:00:00" }
            }
        });
        let st = state_from_document(&doc, 10);
        let ids: Vec<_> = st.ledger.entries().into_iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec!["post_1", "post_2"]);
    }

    #[tokio::test]
    async fn unwritable_path_counts_failure_but_keeps_memory_state() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every rename fail.
        let path = dir.path().join("state.json");
        std::fs::create_dir_all(&path).unwrap();

        let store = StateStore {
            path: Some(path),
            state: Mutex::new(StoreState {
                keywords: KeywordSet::default(),
                ledger: SeenLedger::new(10),
                block: BlockStatus::default(),
                storage_failures: 0,
                base: Map::new(),
            }),
        };
        store.add_keyword("foo").await;
        assert_eq!(store.keywords().await, vec!["foo".to_string()]);
        assert_eq!(store.storage_failures().await, 1);
    }
}
