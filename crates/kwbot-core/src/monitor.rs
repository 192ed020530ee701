//! The poll loop: fetch → extract → filter → notify, with adaptive backoff.
//!
//! One [`Monitor`] owns the fetch state machine. Anything shared with the command
//! listener lives in the [`StateStore`]; the store lock is never held while a fetch or
//! a delivery is in flight.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Config, DeliveryPolicy},
    domain::{Match, PostId, PostRecord},
    extract::ListingExtractor,
    fetch::{ChallengeSignal, FetchMode, FetchOutcome, PageContent, PageFetcher},
    notify::Notifier,
    store::{BlockStatus, StateStore},
};

/// Interval and backoff knobs, split out of [`Config`] so the state machine can be
/// exercised on its own.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base_interval: Duration,
    pub jitter_range: Duration,
    pub factor: f64,
    pub max_interval: Duration,
    pub reset_after_successes: u32,
}

impl BackoffPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            base_interval: cfg.base_interval,
            jitter_range: cfg.jitter_range,
            factor: cfg.backoff_factor,
            max_interval: cfg.max_interval,
            reset_after_successes: cfg.reset_after_successes.max(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FetchState {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_challenge_at: Option<DateTime<Utc>>,
    pub current_interval: Duration,
    pub next_mode: FetchMode,
    /// Set by a challenge; the next warmup starts from a fresh session.
    pub session_stale: bool,
}

impl FetchState {
    /// Fresh state: base interval, and a warmup before the first listing fetch.
    pub fn new(policy: &BackoffPolicy) -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_challenge_at: None,
            current_interval: policy.base_interval,
            next_mode: FetchMode::Warmup,
            session_stale: false,
        }
    }

    pub fn on_success(&mut self, policy: &BackoffPolicy) {
        self.consecutive_failures = 0;
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.next_mode = FetchMode::Listing;
        self.session_stale = false;
        if self.consecutive_successes >= policy.reset_after_successes {
            self.current_interval = policy.base_interval;
        }
    }

    pub fn on_challenge(&mut self, policy: &BackoffPolicy, at: DateTime<Utc>) {
        self.on_failure(policy);
        self.last_challenge_at = Some(at);
        self.next_mode = FetchMode::Warmup;
        self.session_stale = true;
    }

    /// Mode is left alone: a transport error says nothing about the session.
    pub fn on_network_error(&mut self, policy: &BackoffPolicy) {
        self.on_failure(policy);
    }

    fn on_failure(&mut self, policy: &BackoffPolicy) {
        self.consecutive_successes = 0;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.current_interval =
            Duration::try_from_secs_f64(self.current_interval.as_secs_f64() * policy.factor)
            .ok()
            .unwrap_or(policy.max_interval)
            .min(policy.max_interval)
            .max(policy.base_interval);
    }

    /// Current interval plus a fresh jitter draw in `[0, jitter_range]`.
    pub fn next_delay(&self, policy: &BackoffPolicy) -> Duration {
        self.current_interval
            .saturating_add(random_between(Duration::ZERO, policy.jitter_range))
    }
}

fn random_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let lo = u64::try_from(min.as_millis()).unwrap_or(u64::MAX);
    let hi = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::rng().random_range(lo..=hi))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Ok,
    Challenge(ChallengeSignal),
    NetworkError(String),
    /// The page came back but its structure was not recognised; zero posts.
    ParseError(String),
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Challenge(_) => "challenge",
            Self::NetworkError(_) => "network_error",
            Self::ParseError(_) => "parse_error",
        }
    }
}

/// What one cycle did.
#[derive(Clone, Debug)]
pub struct CycleReport {
    pub mode: FetchMode,
    pub outcome: CycleOutcome,
    pub posts: usize,
    pub matches: Vec<Match>,
    pub delivered: Vec<PostId>,
    pub lost: Vec<PostId>,
    pub next_delay: Duration,
}

pub struct Monitor {
    store: Arc<StateStore>,
    fetcher: Arc<dyn PageFetcher>,
    extractor: ListingExtractor,
    notifier: Option<Notifier>,
    policy: BackoffPolicy,
    delivery_policy: DeliveryPolicy,
    settle: (Duration, Duration),
    state: FetchState,
}

impl Monitor {
    /// `notifier: None` runs the full pipeline but only reports matches.
    pub fn new(
        cfg: &Config,
        store: Arc<StateStore>,
        fetcher: Arc<dyn PageFetcher>,
        notifier: Option<Notifier>,
    ) -> Self {
        let policy = BackoffPolicy::from_config(cfg);
        Self {
            store,
            fetcher,
            extractor: ListingExtractor::new(cfg.max_posts),
            notifier,
            policy,
            delivery_policy: cfg.delivery_policy,
            settle: (cfg.warmup_settle_min, cfg.warmup_settle_max),
            state: FetchState::new(&policy),
        }
    }

    pub fn state(&self) -> &FetchState {
        &self.state
    }

    /// Run cycles until `cancel` fires. A cycle in flight always runs to the end, so a
    /// recorded batch is never left half delivered.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            base_ms = self.policy.base_interval.as_millis() as u64,
            max_ms = self.policy.max_interval.as_millis() as u64,
            "poll loop started"
        );

        while !cancel.is_cancelled() {
            let report = self.run_cycle().await;

            tracing::info!(
                mode = report.mode.as_str(),
                outcome = report.outcome.as_str(),
                posts = report.posts,
                matches = report.matches.len(),
                delivered = report.delivered.len(),
                lost = report.lost.len(),
                delay_ms = report.next_delay.as_millis() as u64,
                "cycle finished"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(report.next_delay) => {}
            }
        }

        tracing::info!("poll loop stopped");
    }

    /// One fetch → extract → filter → notify pass. Never fails; failures are folded
    /// into the report and the backoff state.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mode = self.state.next_mode;
        let mut report = CycleReport {
            mode,
            outcome: CycleOutcome::Ok,
            posts: 0,
            matches: Vec::new(),
            delivered: Vec::new(),
            lost: Vec::new(),
            next_delay: Duration::ZERO,
        };

        match self.fetch_listing(mode).await {
            Ok(page) => {
                let posts = match self.extractor.extract(&page) {
                    Ok(posts) => posts,
                    Err(e) => {
                        tracing::warn!(error = %e, "listing page not recognised");
                        report.outcome = CycleOutcome::ParseError(e.to_string());
                        Vec::new()
                    }
                };
                self.state.on_success(&self.policy);
                self.clear_block_status().await;

                report.posts = posts.len();
                self.process(&posts, &mut report).await;
            }
            Err(CycleOutcome::Challenge(signal)) => {
                let now = Utc::now();
                tracing::warn!(
                    status = signal.status,
                    reason = %signal.reason,
                    "anti-bot challenge, backing off"
                );
                self.state.on_challenge(&self.policy, now);
                self.store
                    .set_block_status(BlockStatus {
                        blocked: true,
                        last_challenge_at: Some(now),
                    })
                    .await;
                report.outcome = CycleOutcome::Challenge(signal);
            }
            Err(outcome) => {
                self.state.on_network_error(&self.policy);
                report.outcome = outcome;
            }
        }

        report.next_delay = self.state.next_delay(&self.policy);
        report
    }

    /// Fetch the listing, doing the warmup first when `mode` asks for it.
    async fn fetch_listing(&self, mode: FetchMode) -> Result<PageContent, CycleOutcome> {
        if mode == FetchMode::Warmup {
            if self.state.session_stale {
                if let Err(e) = self.fetcher.reset_session().await {
                    tracing::warn!(error = %e, "session reset failed");
                }
            }
            self.fetch_page(FetchMode::Warmup).await?;
            let settle = random_between(self.settle.0, self.settle.1);
            if !settle.is_zero() {
                tracing::debug!(settle_ms = settle.as_millis() as u64, "warmup done, settling");
                sleep(settle).await;
            }
        }
        self.fetch_page(FetchMode::Listing).await
    }

    async fn fetch_page(&self, mode: FetchMode) -> Result<PageContent, CycleOutcome> {
        match self.fetcher.fetch(mode).await {
            Ok(FetchOutcome::Page(page)) => {
                tracing::debug!(mode = mode.as_str(), status = page.status, bytes = page.body.len(), "fetched");
                Ok(page)
            }
            Ok(FetchOutcome::Challenge(signal)) => Err(CycleOutcome::Challenge(signal)),
            Err(e) => {
                tracing::warn!(mode = mode.as_str(), error = %e, "fetch failed");
                Err(CycleOutcome::NetworkError(e.to_string()))
            }
        }
    }

    async fn process(&self, posts: &[PostRecord], report: &mut CycleReport) {
        if posts.is_empty() {
            return;
        }
        let matches = self.store.filter_and_record(posts).await;

        if let Some(notifier) = &self.notifier {
            for m in &matches {
                match notifier.notify(m).await {
                    Ok(_) => {
                        tracing::info!(post_id = %m.post.id, keywords = ?m.keywords, "notified");
                        report.delivered.push(m.post.id.clone());
                    }
                    Err(e) => {
                        tracing::error!(
                            post_id = %m.post.id,
                            error = %e,
                            policy = ?self.delivery_policy,
                            "notification lost"
                        );
                        report.lost.push(m.post.id.clone());
                    }
                }
            }
        }

        if self.delivery_policy == DeliveryPolicy::RetryNextCycle && !report.lost.is_empty() {
            self.store.forget(&report.lost).await;
        }
        report.matches = matches;
    }

    async fn clear_block_status(&self) {
        let current = self.store.block_status().await;
        if current.blocked {
            tracing::info!("listing reachable again, clearing block status");
            self.store
                .set_block_status(BlockStatus {
                    blocked: false,
                    ..current
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::test_config,
        domain::ChatId,
        errors::Error,
        store::KeywordSet,
        testing::FakeMessenger,
        Result,
    };
    use async_trait::async_trait;
    use std::{collections::VecDeque, sync::Mutex};

    const LISTING: &str = r#"<html><body>
      <a href="/post-11-1">Cheap VPS offer</a>
      <a href="/post-10-1">Selling a bicycle</a>
    </body></html>"#;

    #[derive(Default)]
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<FetchOutcome>>>,
        modes: Mutex<Vec<FetchMode>>,
        resets: Mutex<usize>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<FetchOutcome>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            }
        }

        fn modes(&self) -> Vec<FetchMode> {
            self.modes.lock().unwrap().clone()
        }

        fn resets(&self) -> usize {
            *self.resets.lock().unwrap()
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch(&self, mode: FetchMode) -> Result<FetchOutcome> {
            self.modes.lock().unwrap().push(mode);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Network("script exhausted".to_string())))
        }

        async fn reset_session(&self) -> Result<()> {
            *self.resets.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn page(body: &str) -> Result<FetchOutcome> {
        Ok(FetchOutcome::Page(PageContent {
            url: "https://forum.example/?sortBy=postTime".to_string(),
            status: 200,
            body: body.to_string(),
            fetched_at: Utc::now(),
        }))
    }

    fn home() -> Result<FetchOutcome> {
        page("<html><body>home</body></html>")
    }

    fn challenge() -> Result<FetchOutcome> {
        Ok(FetchOutcome::Challenge(ChallengeSignal {
            status: 403,
            reason: "cf-mitigated: challenge".to_string(),
        }))
    }

    struct Harness {
        monitor: Monitor,
        store: Arc<StateStore>,
        fetcher: Arc<ScriptedFetcher>,
        messenger: Arc<FakeMessenger>,
    }

    fn harness(cfg: Config, script: Vec<Result<FetchOutcome>>, messenger: FakeMessenger) -> Harness {
        let store = Arc::new(StateStore::in_memory(["vps"].into_iter().collect::<KeywordSet>(), 100));
        let fetcher = Arc::new(ScriptedFetcher::new(script));
        let messenger = Arc::new(messenger);
        let notifier = Notifier::new(
            messenger.clone(),
            cfg.chat_id,
            cfg.notify_attempts,
            cfg.notify_retry_delay,
        );
        let monitor = Monitor::new(&cfg, store.clone(), fetcher.clone(), Some(notifier));
        Harness {
            monitor,
            store,
            fetcher,
            messenger,
        }
    }

    fn id(s: &str) -> PostId {
        PostId(s.to_string())
    }

    #[tokio::test]
    async fn first_cycle_warms_up_then_notifies_matches() {
        let mut h = harness(test_config(), vec![home(), page(LISTING)], FakeMessenger::default());
        let r = h.monitor.run_cycle().await;

        assert_eq!(r.mode, FetchMode::Warmup);
        assert_eq!(r.outcome, CycleOutcome::Ok);
        assert_eq!(h.fetcher.modes(), vec![FetchMode::Warmup, FetchMode::Listing]);
        assert_eq!(r.posts, 2);
        assert_eq!(r.delivered, vec![id("post_11")]);
        assert!(r.lost.is_empty());
        assert_eq!(h.messenger.sent_to(), vec![ChatId(42)]);
        // Non-matching posts are recorded too.
        assert!(h.store.is_seen(&id("post_10")).await);
        assert_eq!(r.next_delay, Duration::from_secs(30));
        assert_eq!(h.monitor.state().next_mode, FetchMode::Listing);
    }

    #[tokio::test]
    async fn same_page_twice_notifies_once() {
        let mut h = harness(
            test_config(),
            vec![home(), page(LISTING), page(LISTING)],
            FakeMessenger::default(),
        );
        h.monitor.run_cycle().await;
        let r = h.monitor.run_cycle().await;
        assert_eq!(r.mode, FetchMode::Listing);
        assert!(r.matches.is_empty());
        assert_eq!(h.messenger.sent_html().len(), 1);
    }

    #[tokio::test]
    async fn challenge_switches_to_warmup_and_backs_off() {
        let mut h = harness(
            test_config(),
            vec![home(), page(LISTING), challenge(), home(), page(LISTING)],
            FakeMessenger::default(),
        );

        let r1 = h.monitor.run_cycle().await;
        assert_eq!(r1.outcome, CycleOutcome::Ok);

        let r2 = h.monitor.run_cycle().await;
        assert_eq!(r2.mode, FetchMode::Listing);
        assert!(matches!(r2.outcome, CycleOutcome::Challenge(_)));
        assert_eq!(r2.next_delay, Duration::from_secs(60));
        assert_eq!(h.monitor.state().next_mode, FetchMode::Warmup);
        assert!(h.store.block_status().await.blocked);

        let r3 = h.monitor.run_cycle().await;
        assert_eq!(r3.mode, FetchMode::Warmup);
        assert_eq!(r3.outcome, CycleOutcome::Ok);
        assert_eq!(h.fetcher.resets(), 1);
        // One success is not enough to reset the interval.
        assert!(r3.next_delay > Duration::from_secs(30));
        let block = h.store.block_status().await;
        assert!(!block.blocked);
        assert!(block.last_challenge_at.is_some());
    }

    #[tokio::test]
    async fn warmup_challenge_skips_listing() {
        let mut h = harness(test_config(), vec![challenge()], FakeMessenger::default());
        let r = h.monitor.run_cycle().await;
        assert!(matches!(r.outcome, CycleOutcome::Challenge(_)));
        assert_eq!(h.fetcher.modes(), vec![FetchMode::Warmup]);
        assert_eq!(h.monitor.state().next_mode, FetchMode::Warmup);
    }

    #[tokio::test]
    async fn network_error_backs_off_without_changing_mode() {
        let mut h = harness(
            test_config(),
            vec![home(), page(LISTING), Err(Error::Network("connection reset".to_string()))],
            FakeMessenger::default(),
        );
        h.monitor.run_cycle().await;
        let r = h.monitor.run_cycle().await;
        assert!(matches!(r.outcome, CycleOutcome::NetworkError(_)));
        assert_eq!(r.next_delay, Duration::from_secs(60));
        assert_eq!(h.monitor.state().next_mode, FetchMode::Listing);
        assert!(!h.store.block_status().await.blocked);
    }

    #[tokio::test]
    async fn parse_error_counts_as_fetch_success() {
        let mut h = harness(
            test_config(),
            vec![home(), page("<html><body>maintenance</body></html>")],
            FakeMessenger::default(),
        );
        let r = h.monitor.run_cycle().await;
        assert!(matches!(r.outcome, CycleOutcome::ParseError(_)));
        assert_eq!(r.posts, 0);
        assert_eq!(r.next_delay, Duration::from_secs(30));
        assert_eq!(h.monitor.state().consecutive_successes, 1);
        assert_eq!(h.store.seen_count().await, 0);
    }

    #[tokio::test]
    async fn lost_delivery_stays_seen_by_default() {
        let failures = (0..3).map(|_| Error::delivery("telegram down")).collect();
        let mut h = harness(
            test_config(),
            vec![home(), page(LISTING), page(LISTING)],
            FakeMessenger::failing(failures),
        );
        let r = h.monitor.run_cycle().await;
        assert_eq!(r.lost, vec![id("post_11")]);
        assert!(r.delivered.is_empty());
        assert!(h.store.is_seen(&id("post_11")).await);

        let r = h.monitor.run_cycle().await;
        assert!(r.matches.is_empty());
        assert!(h.messenger.sent_html().is_empty());
    }

    #[tokio::test]
    async fn retry_next_cycle_redelivers_lost_post() {
        let mut cfg = test_config();
        cfg.delivery_policy = DeliveryPolicy::RetryNextCycle;
        let failures = (0..3).map(|_| Error::delivery("telegram down")).collect();
        let mut h = harness(
            cfg,
            vec![home(), page(LISTING), page(LISTING)],
            FakeMessenger::failing(failures),
        );
        let r = h.monitor.run_cycle().await;
        assert_eq!(r.lost, vec![id("post_11")]);
        assert!(!h.store.is_seen(&id("post_11")).await);

        let r = h.monitor.run_cycle().await;
        assert_eq!(r.delivered, vec![id("post_11")]);
        assert_eq!(h.messenger.sent_html().len(), 1);
    }

    #[tokio::test]
    async fn without_notifier_matches_are_only_reported() {
        let cfg = test_config();
        let store = Arc::new(StateStore::in_memory(["vps"].into_iter().collect::<KeywordSet>(), 100));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![home(), page(LISTING)]));
        let mut monitor = Monitor::new(&cfg, store, fetcher, None);
        let r = monitor.run_cycle().await;
        assert_eq!(r.matches.len(), 1);
        assert!(r.delivered.is_empty() && r.lost.is_empty());
    }

    #[test]
    fn backoff_is_capped_and_resets_after_successes() {
        let policy = BackoffPolicy {
            base_interval: Duration::from_secs(30),
            jitter_range: Duration::ZERO,
            factor: 2.0,
            max_interval: Duration::from_secs(100),
            reset_after_successes: 3,
        };
        let mut st = FetchState::new(&policy);
        for _ in 0..5 {
            st.on_network_error(&policy);
        }
        assert_eq!(st.current_interval, Duration::from_secs(100));
        assert_eq!(st.consecutive_failures, 5);

        st.on_success(&policy);
        st.on_success(&policy);
        assert_eq!(st.current_interval, Duration::from_secs(100));
        st.on_success(&policy);
        assert_eq!(st.current_interval, Duration::from_secs(30));
        assert_eq!(st.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn cancel_during_send_finishes_the_cycle() {
        let mut cfg = test_config();
        cfg.delivery_policy = DeliveryPolicy::RetryNextCycle;
        let h = harness(
            cfg,
            vec![home(), page(LISTING)],
            FakeMessenger::default().with_send_delay(Duration::from_millis(200)),
        );
        let (store, messenger) = (h.store.clone(), h.messenger.clone());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.monitor.run(cancel.clone()));

        for _ in 0..100 {
            if messenger.attempts() > 0 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        assert!(store.is_seen(&id("post_11")).await);
        assert_eq!(messenger.sent_html().len(), 1);
    }

    #[test]
    fn huge_backoff_factor_saturates_at_max_interval() {
        let policy = BackoffPolicy {
            base_interval: Duration::from_secs(30),
            jitter_range: Duration::MAX,
            factor: 1e30,
            max_interval: Duration::from_secs(600),
            reset_after_successes: 3,
        };
        let mut st = FetchState::new(&policy);
        st.on_network_error(&policy);
        assert_eq!(st.current_interval, Duration::from_secs(600));
        assert!(st.next_delay(&policy) >= Duration::from_secs(600));
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = BackoffPolicy {
            base_interval: Duration::from_secs(30),
            jitter_range: Duration::from_secs(10),
            factor: 2.0,
            max_interval: Duration::from_secs(600),
            reset_after_successes: 3,
        };
        let st = FetchState::new(&policy);
        for _ in 0..50 {
            let d = st.next_delay(&policy);
            assert!(d >= Duration::from_secs(30) && d <= Duration::from_secs(40));
        }
    }
}
