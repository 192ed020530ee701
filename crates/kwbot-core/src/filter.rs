//! Dedup & keyword match.
//!
//! Pure selection over one fetched batch; recording the batch into the ledger is the
//! store's job (see `StateStore::filter_and_record`).

use std::collections::HashSet;

use crate::{
    domain::{Match, PostRecord},
    store::{KeywordSet, SeenLedger},
};

/// Posts from `posts` that are not in `ledger` and whose title contains at least one
/// keyword, in source order. A post repeated within the batch is considered once.
pub fn select_matches(
    posts: &[PostRecord],
    keywords: &KeywordSet,
    ledger: &SeenLedger,
) -> Vec<Match> {
    let mut batch = HashSet::new();
    let mut out = Vec::new();

    for post in posts {
        if ledger.contains(&post.id) || !batch.insert(&post.id) {
            continue;
        }
        let matched = keywords.matches(&post.title);
        if matched.is_empty() {
            continue;
        }
        out.push(Match {
            post: post.clone(),
            keywords: matched,
        });
    }

    out
}
