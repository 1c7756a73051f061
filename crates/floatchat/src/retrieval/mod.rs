use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RetrievalUnavailable;

pub const DEFAULT_SNIPPET_COUNT: usize = 10;

/// One retrieved fragment; `rank` is its position in the result (0 = best).
#[derive(Debug, Clone, PartialEq, Serialize, schemars::JsonSchema)]
pub struct ContextSnippet {
    pub rank: usize,
    pub text: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Semantic search over a pre-built index owned by another system.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    /// Most relevant first. An index that answers with nothing returns
    /// `Ok(vec![])`; only an unreachable index is an error.
    async fn search(
        &self,
        question: &str,
        k: usize,
    ) -> Result<Vec<ContextSnippet>, RetrievalUnavailable>;
}

/// Stand-in when no index endpoint is configured; requests run in
/// empty-context mode.
#[derive(Debug, Clone, Default)]
pub struct DisabledRetriever;

#[async_trait]
impl ContextRetriever for DisabledRetriever {
    async fn search(
        &self,
        _question: &str,
        _k: usize,
    ) -> Result<Vec<ContextSnippet>, RetrievalUnavailable> {
        Err(RetrievalUnavailable(
            "no retrieval endpoint configured".to_string(),
        ))
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    k: usize,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(alias = "page_content", alias = "content")]
    text: String,

    #[serde(default)]
    score: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    Wrapped { results: Vec<SearchHit> },
    Bare(Vec<SearchHit>),
}

/// `POST <endpoint>` with `{"query", "k"}`; the index answers with
/// `{"results": [{"text", "score"}]}` or a bare array of hits.
#[derive(Debug, Clone)]
pub struct HttpRetriever {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRetriever {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| anyhow::anyhow!("failed to build retrieval client: {error}"))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ContextRetriever for HttpRetriever {
    async fn search(
        &self,
        question: &str,
        k: usize,
    ) -> Result<Vec<ContextSnippet>, RetrievalUnavailable> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&SearchRequest { query: question, k })
            .send()
            .await
            .map_err(|error| RetrievalUnavailable(format!("request failed: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RetrievalUnavailable(format!(
                "index responded with status {}",
                status.as_u16()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|error| RetrievalUnavailable(format!("failed to read response: {error}")))?;
        parse_search_response(&body, k)
    }
}

pub fn parse_search_response(
    body: &str,
    k: usize,
) -> Result<Vec<ContextSnippet>, RetrievalUnavailable> {
    let hits = match serde_json::from_str::<SearchResponse>(body)
        .map_err(|error| RetrievalUnavailable(format!("undecodable index response: {error}")))?
    {
        SearchResponse::Wrapped { results } => results,
        SearchResponse::Bare(hits) => hits,
    };

    Ok(hits
        .into_iter()
        .take(k)
        .enumerate()
        .map(|(rank, hit)| ContextSnippet {
            rank,
            text: hit.text,
            score: hit.score,
        })
        .collect())
}

/// Numbered block interpolated into prompts, most relevant first.
#[must_use]
pub fn render_context_block(snippets: &[ContextSnippet]) -> String {
    if snippets.is_empty() {
        return "(no context retrieved)".to_string();
    }
    snippets
        .iter()
        .map(|snippet| format!("[{}] {}", snippet.rank + 1, snippet.text.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}
