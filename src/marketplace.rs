use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.upwork.com/graphql";
const PAGE_SIZE: u32 = 50;

/// A posting as the marketplace reports it. Every field other than the id and
/// title may be missing or malformed; normalization decides what to keep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobPosting {
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    pub budget_amount: Option<String>,
    pub budget_currency: Option<String>,
    pub created_date_time: Option<String>,
    pub duration: Option<String>,
    pub client: Option<ClientInfo>,
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientInfo {
    pub total_hires: Option<i64>,
    pub total_reviews: Option<i64>,
    pub total_feedback: Option<f64>,
    pub verification_status: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub postings: Vec<JobPosting>,
    pub total_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    /// Saved niche keywords; `None` means whatever the marketplace returns by
    /// default for the connected account.
    pub query: Option<String>,
}

#[async_trait]
pub trait MarketplaceClient: Send + Sync {
    async fn search_job_postings(&self, access_token: &str, criteria: &SearchCriteria) -> Result<SearchResults>;
}

// --- Upwork GraphQL client ---

const SEARCH_QUERY: &str = r#"
query search($filter: MarketplaceJobPostingsSearchFilter) {
  marketplaceJobPostingsSearch(marketPlaceJobFilter: $filter) {
    totalCount
    edges {
      node {
        id
        ciphertext
        title
        description
        createdDateTime
        duration
        amount { rawValue currency }
        client { totalHires totalReviews totalFeedback verificationStatus }
        skills { name }
      }
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<SearchData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchData {
    marketplace_job_postings_search: Option<SearchConnection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchConnection {
    total_count: Option<u64>,
    #[serde(default)]
    edges: Vec<Edge>,
}

#[derive(Debug, Deserialize)]
struct Edge {
    node: PostingNode,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PostingNode {
    id: Option<String>,
    ciphertext: Option<String>,
    title: Option<String>,
    description: Option<String>,
    created_date_time: Option<String>,
    duration: Option<String>,
    amount: Option<Money>,
    client: Option<ClientInfo>,
    skills: Vec<Skill>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Money {
    raw_value: Option<Value>,
    currency: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Skill {
    name: Option<String>,
}

impl PostingNode {
    fn into_posting(self) -> Option<JobPosting> {
        let external_id = self.id.or(self.ciphertext).filter(|id| !id.is_empty())?;
        let title = self.title.filter(|t| !t.trim().is_empty())?;
        let (budget_amount, budget_currency) = match self.amount {
            Some(money) => (money.raw_value.and_then(value_as_text), money.currency),
            None => (None, None),
        };
        Some(JobPosting {
            external_id,
            title,
            description: self.description,
            budget_amount,
            budget_currency,
            created_date_time: self.created_date_time,
            duration: self.duration,
            client: self.client,
            skills: self.skills.into_iter().filter_map(|s| s.name).collect(),
        })
    }
}

/// Amounts arrive as strings or bare numbers depending on the field; keep the
/// text form and let normalization parse it.
fn value_as_text(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub struct UpworkClient {
    http: reqwest::Client,
    api_url: String,
}

impl UpworkClient {
    pub fn new(api_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build marketplace HTTP client")?;
        Ok(Self {
            http,
            api_url: api_url.to_string(),
        })
    }

    fn parse_response(body: GraphQlResponse) -> Result<SearchResults> {
        let connection = body
            .data
            .and_then(|d| d.marketplace_job_postings_search)
            .ok_or_else(|| {
                let messages: Vec<_> = body.errors.iter().map(|e| e.message.as_str()).collect();
                anyhow!("Marketplace search returned no data: {}", messages.join("; "))
            })?;

        let raw_count = connection.edges.len();
        let postings: Vec<JobPosting> = connection
            .edges
            .into_iter()
            .filter_map(|edge| edge.node.into_posting())
            .collect();
        if postings.len() < raw_count {
            tracing::warn!(
                dropped = raw_count - postings.len(),
                "Skipped postings without an id or title"
            );
        }
        Ok(SearchResults {
            total_count: connection.total_count.unwrap_or(postings.len() as u64),
            postings,
        })
    }
}

#[async_trait]
impl MarketplaceClient for UpworkClient {
    async fn search_job_postings(&self, access_token: &str, criteria: &SearchCriteria) -> Result<SearchResults> {
        let mut filter = json!({ "pagination_eq": { "after": "0", "first": PAGE_SIZE } });
        if let Some(query) = criteria.query.as_deref().filter(|q| !q.trim().is_empty()) {
            filter["searchExpression_eq"] = json!(query);
        }

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(access_token)
            .json(&json!({ "query": SEARCH_QUERY, "variables": { "filter": filter } }))
            .send()
            .await
            .context("Failed to send marketplace search request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Marketplace search failed with status {}: {}",
                status,
                error_text
            ));
        }

        let body: GraphQlResponse = response
            .json()
            .await
            .context("Failed to parse marketplace search response")?;
        Self::parse_response(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_tolerates_missing_fields() {
        let body: GraphQlResponse = serde_json::from_value(json!({
            "data": {
                "marketplaceJobPostingsSearch": {
                    "totalCount": 42,
                    "edges": [
                        { "node": {
                            "id": "111",
                            "title": "Landing page",
                            "amount": { "rawValue": 5000, "currency": "USD" },
                            "skills": [{ "name": "react" }, {}],
                            "createdDateTime": "2026-01-02T03:04:05Z"
                        }},
                        { "node": { "id": "222", "title": "No budget", "amount": null } },
                        { "node": { "title": "Missing id" } },
                        { "node": { "id": "333" } }
                    ]
                }
            }
        }))
        .unwrap();

        let results = UpworkClient::parse_response(body).unwrap();
        assert_eq!(results.total_count, 42);
        assert_eq!(results.postings.len(), 2);

        let first = &results.postings[0];
        assert_eq!(first.external_id, "111");
        assert_eq!(first.budget_amount.as_deref(), Some("5000"));
        assert_eq!(first.budget_currency.as_deref(), Some("USD"));
        assert_eq!(first.skills, vec!["react".to_string()]);

        assert!(results.postings[1].budget_amount.is_none());
    }

    #[test]
    fn test_parse_response_surfaces_graphql_errors() {
        let body: GraphQlResponse = serde_json::from_value(json!({
            "data": null,
            "errors": [{ "message": "Token expired" }]
        }))
        .unwrap();
        let err = UpworkClient::parse_response(body).unwrap_err();
        assert!(err.to_string().contains("Token expired"));
    }
}
