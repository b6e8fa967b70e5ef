use reqwest::{Client, Response};
use tokio_util::sync::CancellationToken;

use super::race::{MirrorRacer, RaceError, Won};
use crate::USER_AGENT;
use crate::paths::filename_from_url;

/// Equivalent URLs for one resource, in preference order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MirrorSet {
    urls: Vec<String>,
}

impl MirrorSet {
    pub fn new(urls: impl IntoIterator<Item = String>) -> Self {
        let mut set = Self { urls: Vec::new() };
        for url in urls {
            set.push(url);
        }
        set
    }

    pub fn single(url: impl Into<String>) -> Self {
        Self::new([url.into()])
    }

    /// Mirror copies of `upstream` first, upstream itself last.
    ///
    /// A mirror URL is the base joined with the upstream file name.
    pub fn with_fallback(mirror_bases: &[String], upstream: &str) -> Self {
        let file = filename_from_url(upstream);
        let mirrors = mirror_bases
            .iter()
            .map(|base| format!("{}/{file}", base.trim_end_matches('/')));
        Self::new(mirrors.chain(std::iter::once(upstream.to_string())))
    }

    fn push(&mut self, url: String) {
        if !url.is_empty() && !self.urls.contains(&url) {
            self.urls.push(url);
        }
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    /// Race GET requests across the set. Only the response headers are awaited;
    /// the caller streams the winner's body.
    ///
    /// # Errors
    ///
    /// Non-success statuses count as failed attempts.
    pub async fn get(
        &self,
        client: &Client,
        racer: &MirrorRacer,
        cancel: &CancellationToken,
    ) -> Result<Won<Response>, RaceError<reqwest::Error>> {
        racer
            .race(self.urls.len(), cancel, |index| {
                let url = &self.urls[index];
                tracing::debug!(url = %url, index, "requesting mirror");
                let request = client.get(url).header(reqwest::header::USER_AGENT, USER_AGENT);
                async move { request.send().await?.error_for_status() }
            })
            .await
    }
}
