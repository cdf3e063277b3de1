use std::{future::Future, time::Duration};

use meter_client::domain::{ConsumptionSample, TimeRange};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::config::OctopusConfig;
use crate::pipeline::{ConsumptionSource, PipelineError};

const TOKEN_MUTATION: &str = r#"
mutation obtainKrakenToken($input: ObtainJSONWebTokenInput!) {
    obtainKrakenToken(input: $input) {
        token
    }
}
"#;

const ACCOUNTS_QUERY: &str = r#"
query getAccountNames {
    viewer {
        accounts {
            ... on Account {
                number
            }
        }
    }
}
"#;

const CONSUMPTION_QUERY: &str = r#"
query getAccountMeasurements(
    $propertyId: ID!
    $first: Int!
    $after: String
    $utilityFilters: [UtilityFiltersInput!]
    $startAt: DateTime
    $endAt: DateTime
    $timezone: String
) {
    property(id: $propertyId) {
        measurements(
            first: $first
            after: $after
            utilityFilters: $utilityFilters
            startAt: $startAt
            endAt: $endAt
            timezone: $timezone
        ) {
            pageInfo {
                hasNextPage
                endCursor
            }
            edges {
                node {
                    value
                    unit
                    ... on IntervalMeasurementType {
                        startAt
                        endAt
                        durationInSeconds
                    }
                }
            }
        }
    }
}
"#;

/// Hard stop for cursor pagination; 100 pages of 500 hourly readings is over five years.
const MAX_PAGES: usize = 100;

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

fn join_errors(errors: &[GraphQlError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenData {
    obtain_kraken_token: Option<TokenPayload>,
}

#[derive(Debug, Deserialize)]
struct TokenPayload {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ViewerData {
    viewer: Option<Viewer>,
}

#[derive(Debug, Deserialize)]
struct Viewer {
    #[serde(default)]
    accounts: Vec<AccountRef>,
}

#[derive(Debug, Deserialize)]
struct AccountRef {
    number: Option<String>,
}

fn account_numbers_from(data: Option<ViewerData>) -> Vec<String> {
    data.and_then(|d| d.viewer)
        .map(|v| v.accounts.into_iter().filter_map(|a| a.number).collect())
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct MeasurementsData {
    property: Option<Property>,
}

#[derive(Debug, Deserialize)]
struct Property {
    measurements: Connection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection {
    #[serde(default)]
    page_info: Option<PageInfo>,
    #[serde(default)]
    edges: Vec<Edge>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Edge {
    node: MeasurementNode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeasurementNode {
    value: Value,
    start_at: Option<String>,
}

/// Readings come back as decimal strings; plain JSON numbers are accepted too.
fn parse_value(v: &Value) -> Option<f64> {
    let parsed = match v {
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    parsed.filter(|x| x.is_finite())
}

fn node_to_sample(node: &MeasurementNode) -> Result<ConsumptionSample, PipelineError> {
    let start_raw = node
        .start_at
        .as_deref()
        .ok_or_else(|| PipelineError::Fetch("measurement without startAt".to_string()))?;
    let start = OffsetDateTime::parse(start_raw, &Rfc3339)
        .map_err(|e| PipelineError::Fetch(format!("invalid startAt '{start_raw}': {e}")))?;
    let value_kwh = parse_value(&node.value)
        .ok_or_else(|| PipelineError::Fetch(format!("non-numeric value {} at {start_raw}", node.value)))?;

    Ok(ConsumptionSample { start, value_kwh })
}

/// Convert a page of edges, keeping only samples inside the half-open range.
///
/// A single malformed node rejects the whole batch.
fn samples_from_edges(edges: &[Edge], range: TimeRange) -> Result<Vec<ConsumptionSample>, PipelineError> {
    let mut out = Vec::with_capacity(edges.len());
    for edge in edges {
        let sample = node_to_sample(&edge.node)?;
        if range.contains(sample.start) {
            out.push(sample);
        }
    }
    Ok(out)
}

struct Pages {
    samples: Vec<ConsumptionSample>,
    /// The page cap was reached while the API still reported more pages.
    truncated: bool,
}

/// Follow the cursor from the first page until the API reports no next page
/// or `MAX_PAGES` pages were read.
async fn collect_pages<F, Fut>(range: TimeRange, mut fetch_page: F) -> Result<Pages, PipelineError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Connection, PipelineError>>,
{
    let mut samples = Vec::new();
    let mut after: Option<String> = None;

    for _ in 0..MAX_PAGES {
        let page = fetch_page(after.take()).await?;
        samples.extend(samples_from_edges(&page.edges, range)?);

        match page.page_info {
            Some(PageInfo {
                has_next_page: true,
                end_cursor: Some(cursor),
            }) if !page.edges.is_empty() => after = Some(cursor),
            _ => {
                return Ok(Pages {
                    samples,
                    truncated: false,
                })
            }
        }
    }

    Ok(Pages {
        samples,
        truncated: true,
    })
}

fn format_instant(ts: OffsetDateTime) -> Result<String, PipelineError> {
    ts.format(&Rfc3339)
        .map_err(|e| PipelineError::Fetch(format!("cannot format {ts}: {e}")))
}

/// Hourly consumption readings from the Octopus Energy (Kraken) GraphQL API.
pub struct OctopusSource {
    http: reqwest::Client,
    graphql_url: String,
    property_id: String,
    email: String,
    password: String,
    page_size: u32,
    timezone: String,
    token: tokio::sync::Mutex<Option<String>>,
}

impl OctopusSource {
    pub fn new(cfg: &OctopusConfig, timezone: &str) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| PipelineError::Fetch(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            graphql_url: cfg.graphql_url.clone(),
            property_id: cfg.property_id.clone(),
            email: cfg.email.clone(),
            password: cfg.password.clone(),
            page_size: cfg.page_size,
            timezone: timezone.to_string(),
            token: tokio::sync::Mutex::new(None),
        })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        body: &Value,
        token: Option<&str>,
    ) -> Result<GraphQlResponse<T>, PipelineError> {
        let mut req = self.http.post(&self.graphql_url).json(body);
        if let Some(token) = token {
            req = req.header(reqwest::header::AUTHORIZATION, token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| PipelineError::Fetch(format!("metering API request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PipelineError::Fetch(format!("metering API returned {status}")));
        }

        resp.json::<GraphQlResponse<T>>()
            .await
            .map_err(|e| PipelineError::Fetch(format!("malformed metering API response: {e}")))
    }

    async fn login(&self) -> Result<String, PipelineError> {
        if self.email.is_empty() || self.password.is_empty() {
            return Err(PipelineError::Fetch("metering API credentials are not configured".to_string()));
        }

        let body = json!({
            "query": TOKEN_MUTATION,
            "variables": {
                "input": { "email": self.email, "password": self.password }
            },
        });
        let resp: GraphQlResponse<TokenData> = self.post(&body, None).await?;

        if !resp.errors.is_empty() {
            return Err(PipelineError::Fetch(format!("login failed: {}", join_errors(&resp.errors))));
        }

        resp.data
            .and_then(|d| d.obtain_kraken_token)
            .map(|t| t.token)
            .ok_or_else(|| PipelineError::Fetch("login response carried no token".to_string()))
    }

    async fn token(&self) -> Result<String, PipelineError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }

        let token = self.login().await?;
        tracing::debug!("obtained metering API token");
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn forget_token(&self) {
        *self.token.lock().await = None;
    }

    /// Numbers of the accounts the configured credentials can see.
    pub async fn account_numbers(&self) -> Result<Vec<String>, PipelineError> {
        let token = self.token().await?;
        let body = json!({
            "operationName": "getAccountNames",
            "query": ACCOUNTS_QUERY,
        });
        let resp: GraphQlResponse<ViewerData> = self.post(&body, Some(&token)).await?;

        if !resp.errors.is_empty() {
            self.forget_token().await;
            return Err(PipelineError::Fetch(format!(
                "accounts query failed: {}",
                join_errors(&resp.errors)
            )));
        }

        Ok(account_numbers_from(resp.data))
    }

    async fn fetch_page(
        &self,
        token: &str,
        range: TimeRange,
        after: Option<&str>,
    ) -> Result<Connection, PipelineError> {
        let body = json!({
            "operationName": "getAccountMeasurements",
            "query": CONSUMPTION_QUERY,
            "variables": {
                "propertyId": self.property_id,
                "first": self.page_size,
                "after": after,
                "utilityFilters": [{
                    "electricityFilters": {
                        "readingDirection": "CONSUMPTION",
                        "readingFrequencyType": "HOUR_INTERVAL",
                    }
                }],
                "timezone": self.timezone,
                "startAt": format_instant(range.from)?,
                "endAt": format_instant(range.to)?,
            },
        });

        let resp: GraphQlResponse<MeasurementsData> = self.post(&body, Some(token)).await?;

        if !resp.errors.is_empty() {
            // Expired tokens surface as GraphQL errors; log in again next time.
            self.forget_token().await;
            return Err(PipelineError::Fetch(format!(
                "measurements query failed: {}",
                join_errors(&resp.errors)
            )));
        }

        resp.data
            .and_then(|d| d.property)
            .map(|p| p.measurements)
            .ok_or_else(|| PipelineError::Fetch(format!("property {} not found", self.property_id)))
    }
}

#[async_trait::async_trait]
impl ConsumptionSource for OctopusSource {
    async fn fetch(&self, range: TimeRange) -> Result<Vec<ConsumptionSample>, PipelineError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let token = self.token().await?;
        let token = token.as_str();
        let Pages {
            mut samples,
            truncated,
        } = collect_pages(range, move |after| async move {
            self.fetch_page(token, range, after.as_deref()).await
        })
        .await?;

        if truncated {
            tracing::warn!(
                range_from = %range.from,
                range_to = %range.to,
                max_pages = MAX_PAGES,
                "page limit reached with more pages pending, the rest of the range was not fetched"
            );
        }

        samples.sort_by_key(|s| s.start);
        samples.dedup_by_key(|s| s.start);

        tracing::debug!(
            range_from = %range.from,
            range_to = %range.to,
            samples = samples.len(),
            "fetched consumption samples"
        );

        Ok(samples)
    }
}
