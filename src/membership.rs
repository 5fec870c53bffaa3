//! Maintainer membership resolution with a session-lifetime cache.
//!
//! The dashboard needs to know, for every actor it encounters, whether that
//! actor belongs to the maintaining organization. Lookups are cached for the
//! whole session; staleness is acceptable since org membership rarely changes
//! mid-session.

use crate::error::FetchError;
use crate::github::GitHubClient;
use futures::future::BoxFuture;
use moka::future::Cache;
use std::sync::Arc;

/// Upstream membership check. 2xx means member, 404 means not a member.
pub trait MembershipSource: Send + Sync {
    fn check<'a>(&'a self, org: &'a str, login: &'a str) -> BoxFuture<'a, Result<bool, FetchError>>;
}

impl MembershipSource for GitHubClient {
    fn check<'a>(&'a self, org: &'a str, login: &'a str) -> BoxFuture<'a, Result<bool, FetchError>> {
        Box::pin(self.check_org_membership(org, login))
    }
}

impl<S: MembershipSource> MembershipSource for Arc<S> {
    fn check<'a>(&'a self, org: &'a str, login: &'a str) -> BoxFuture<'a, Result<bool, FetchError>> {
        (**self).check(org, login)
    }
}

/// Answers "is this actor maintainer-class?" without ever failing.
///
/// Used by the analyzer, which may ask about the same handful of logins many
/// times per batch, so positive and negative answers are both cached. A
/// transient lookup failure conservatively resolves to `false` and is *not*
/// cached, so the next batch gets another chance at a real answer.
pub struct MembershipResolver<S = Arc<GitHubClient>> {
    source: S,
    org: Option<String>,
    cache: Cache<String, bool>,
}

impl<S: MembershipSource> MembershipResolver<S> {
    pub fn new(source: S, org: Option<String>, max_capacity: u64) -> Self {
        Self {
            source,
            org,
            cache: Cache::builder().max_capacity(max_capacity).build(),
        }
    }

    pub async fn is_privileged(&self, login: &str) -> bool {
        let Some(org) = self.org.as_deref() else {
            return false;
        };

        let key = login.to_lowercase();
        if let Some(cached) = self.cache.get(&key).await {
            return cached;
        }

        match self.source.check(org, &key).await {
            Ok(is_member) => {
                self.cache.insert(key, is_member).await;
                is_member
            }
            Err(err) => {
                tracing::warn!(login = %key, error = %err, "membership check failed, treating as non-member");
                false
            }
        }
    }

    #[cfg(test)]
    async fn cached_entries(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}
