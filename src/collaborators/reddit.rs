//! Content mining from Reddit's public JSON search.

use anyhow::{Context, Result};
use async_trait::async_trait;
use memeloop_common::IterationContext;
use serde::Deserialize;

use crate::config::RedditConfig;
use crate::pipeline::ContentMiner;

const POST_EXCERPT_CHARS: usize = 800;

pub struct RedditMiner {
    client: reqwest::Client,
    base_url: String,
    threads_per_topic: usize,
    max_queries: usize,
    user_agent: String,
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Child>,
}

#[derive(Debug, Deserialize)]
struct Child {
    data: Thread,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thread {
    pub title: String,
    #[serde(default)]
    pub selftext: String,
    pub permalink: String,
    #[serde(default)]
    pub subreddit: String,
}

impl RedditMiner {
    pub fn new(client: reqwest::Client, config: &RedditConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            threads_per_topic: config.threads_per_topic.max(1),
            max_queries: config.max_queries,
            user_agent: config.user_agent.clone(),
        }
    }

    async fn search(&self, query: &str) -> Result<Vec<Thread>> {
        let limit = self.threads_per_topic.to_string();
        let listing = self
            .client
            .get(format!("{}/search.json", self.base_url))
            .header("User-Agent", &self.user_agent)
            .query(&[
                ("q", query),
                ("sort", "relevance"),
                ("type", "link"),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("Failed to search Reddit for '{}'", query))?
            .error_for_status()
            .context("Reddit search returned an error status")?
            .json::<Listing>()
            .await
            .context("Failed to parse Reddit search response")?;

        Ok(listing
            .data
            .children
            .into_iter()
            .map(|c| c.data)
            .take(self.threads_per_topic)
            .collect())
    }
}

#[async_trait]
impl ContentMiner for RedditMiner {
    async fn mine(&self, prompt: &str, ctx: &IterationContext) -> Result<String> {
        let queries = expand_topics(prompt, ctx, self.max_queries);
        tracing::info!(queries = queries.len(), "mining Reddit");

        let mut sections = Vec::with_capacity(queries.len());
        let mut failures = 0;
        let mut last_error = None;
        for (i, query) in queries.iter().enumerate() {
            tracing::debug!(query = %query, index = i + 1, total = queries.len(), "searching");
            match self.search(query).await {
                Ok(threads) => sections.push(format_section(query, &self.base_url, &threads)),
                Err(e) => {
                    tracing::warn!(query = %query, error = %e, "Reddit search failed");
                    failures += 1;
                    sections.push(format_section(query, &self.base_url, &[]));
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if failures == queries.len() => Err(e.context("Every Reddit search failed")),
            _ => Ok(sections.join("\n---\n")),
        }
    }
}

/// Derive search queries from the prompt and the reviewer's feedback so far.
///
/// The most recent feedback comes first so it survives the `max` cut.
pub fn expand_topics(prompt: &str, ctx: &IterationContext, max: usize) -> Vec<String> {
    let prompt = prompt.trim();
    let mut queries = vec![prompt.to_string()];
    let feedback: Vec<&str> = ctx.feedback().collect();
    for f in feedback.iter().rev() {
        queries.push(format!("{} {}", prompt, f));
    }
    queries.push(format!("{} memes", prompt));

    let mut seen = std::collections::HashSet::new();
    queries.retain(|q| seen.insert(q.to_lowercase()));
    queries.truncate(max.max(1));
    queries
}

fn format_section(topic: &str, base_url: &str, threads: &[Thread]) -> String {
    if threads.is_empty() {
        return format!("TOPIC: {}\nDATA COLLECTED: No Reddit threads found.\n", topic);
    }
    let mut out = format!("TOPIC: {}\nDATA COLLECTED:\n", topic);
    for thread in threads {
        let post: String = thread.selftext.trim().chars().take(POST_EXCERPT_CHARS).collect();
        out.push_str(&format!(
            "SOURCE: {}{}\nSUBREDDIT: r/{}\nTITLE: {}\nPOST: {}\n",
            base_url,
            thread.permalink,
            thread.subreddit,
            thread.title.trim(),
            post
        ));
    }
    out
}
