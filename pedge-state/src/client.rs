//! Client for the power-edge control plane.
//!
//! The control plane stores one state document per node and serves it back
//! as YAML. Compliance and version reports are opaque JSON blobs.

use std::time::Duration;

use reqwest::{Response, StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use crate::error::ControlPlaneError;
use crate::state::State;

type Result<T> = std::result::Result<T, ControlPlaneError>;

/// Response of `GET /nodes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NodeList {
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub count: usize,
}

/// Typed client for the control plane REST API (`{base}/api/v1`).
#[derive(Clone)]
pub struct ControlPlaneClient {
    base_url: String,
    api: Url,
    http: reqwest::Client,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let mut api = Url::parse(&base_url)
            .map_err(|e| ControlPlaneError::InvalidUrl(format!("{base_url}: {e}")))?;
        api.path_segments_mut()
            .map_err(|()| ControlPlaneError::InvalidUrl(base_url.clone()))?
            .pop_if_empty()
            .extend(["api", "v1"]);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url,
            api,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// API URL for `segments`, each percent-encoded as one path segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.api.clone();
        // `new` rejected bases that cannot carry a path
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        url
    }

    /// List node ids that have a stored state document.
    pub async fn list_nodes(&self) -> Result<NodeList> {
        let resp = self.http.get(self.url(&["nodes"])).send().await?;
        let resp = check(resp, "nodes").await?;
        resp.json::<NodeList>()
            .await
            .map_err(|e| ControlPlaneError::Decode(e.to_string()))
    }

    /// Fetch the desired state for a node.
    pub async fn get_state(&self, node_id: &str) -> Result<State> {
        debug!(node_id, "Fetching state from control plane");
        let resp = self
            .http
            .get(self.url(&["nodes", node_id]))
            .send()
            .await?;
        let resp = check(resp, node_id).await?;
        let body = resp.text().await?;
        State::from_yaml(&body).map_err(|e| ControlPlaneError::Decode(e.to_string()))
    }

    /// Store the desired state for a node.
    pub async fn put_state(&self, node_id: &str, state: &State) -> Result<()> {
        let body = state
            .to_yaml()
            .map_err(|e| ControlPlaneError::Encode(e.to_string()))?;
        let resp = self
            .http
            .put(self.url(&["nodes", node_id]))
            .header(reqwest::header::CONTENT_TYPE, "application/x-yaml")
            .body(body)
            .send()
            .await?;
        check(resp, node_id).await?;
        Ok(())
    }

    pub async fn delete_state(&self, node_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&["nodes", node_id]))
            .send()
            .await?;
        check(resp, node_id).await?;
        Ok(())
    }

    /// System versions last reported for a node.
    pub async fn versions(&self, node_id: &str) -> Result<serde_json::Value> {
        self.get_json(&["nodes", node_id, "versions"], node_id).await
    }

    /// Compliance status last reported for a node.
    pub async fn compliance(&self, node_id: &str) -> Result<serde_json::Value> {
        self.get_json(&["nodes", node_id, "compliance"], node_id).await
    }

    async fn get_json(&self, segments: &[&str], what: &str) -> Result<serde_json::Value> {
        let resp = self.http.get(self.url(segments)).send().await?;
        let resp = check(resp, what).await?;
        resp.json()
            .await
            .map_err(|e| ControlPlaneError::Decode(e.to_string()))
    }
}

/// Map non-success statuses onto error variants.
async fn check(resp: Response, what: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => ControlPlaneError::NotFound(what.to_string()),
        StatusCode::BAD_REQUEST => ControlPlaneError::BadRequest(body.trim().to_string()),
        other => ControlPlaneError::Status {
            code: other.as_u16(),
            body: body.trim().to_string(),
        },
    })
}
