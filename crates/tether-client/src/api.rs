//! Authenticated HTTP surface for bulk fetches.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tether_protocol::api::{
    ApiArtifact, ApiMachine, ApiMessage, ApiSession, CreateArtifactRequest, FriendsResponse,
    MessagesResponse, SessionsResponse, UserProfile, UserSearchResponse,
};

/// The server's HTTP endpoints, behind a trait so tests can serve from memory.
#[async_trait]
pub trait SyncApi: Send + Sync {
    async fn list_sessions(&self) -> SyncResult<Vec<ApiSession>>;

    /// Full message history, newest first.
    async fn session_messages(&self, session_id: &str) -> SyncResult<Vec<ApiMessage>>;

    async fn list_machines(&self) -> SyncResult<Vec<ApiMachine>>;

    async fn list_artifacts(&self) -> SyncResult<Vec<ApiArtifact>>;

    async fn get_artifact(&self, artifact_id: &str) -> SyncResult<ApiArtifact>;

    async fn create_artifact(&self, request: &CreateArtifactRequest) -> SyncResult<ApiArtifact>;

    async fn friends(&self) -> SyncResult<Vec<UserProfile>>;

    async fn search_users(&self, query: &str) -> SyncResult<Vec<UserProfile>>;
}

#[derive(Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpApi {
    pub fn new(endpoint: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// A bearer-authenticated request builder for `path` (e.g. `/v1/sessions`).
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.endpoint))
            .bearer_auth(&self.token)
    }

    async fn send(&self, builder: RequestBuilder, path: &str) -> SyncResult<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(path = %path, status = %status, "http request failed");
            return Err(SyncError::Http {
                status: Some(status.as_u16()),
                message: format!("{path}: {}", body.trim()),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
        let response = self.send(self.request(Method::GET, path), path).await?;
        Ok(response.json().await?)
    }

    /// Send `method` to `path` with an optional JSON body and return the
    /// response itself. Non-2xx statuses are errors.
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> SyncResult<Response> {
        let mut builder = self.request(method, path);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        self.send(builder, path).await
    }
}

#[async_trait]
impl SyncApi for HttpApi {
    async fn list_sessions(&self) -> SyncResult<Vec<ApiSession>> {
        let body: SessionsResponse = self.get_json("/v1/sessions").await?;
        Ok(body.sessions)
    }

    async fn session_messages(&self, session_id: &str) -> SyncResult<Vec<ApiMessage>> {
        let body: MessagesResponse = self
            .get_json(&format!("/v1/sessions/{session_id}/messages"))
            .await?;
        Ok(body.messages)
    }

    async fn list_machines(&self) -> SyncResult<Vec<ApiMachine>> {
        self.get_json("/v1/machines").await
    }

    async fn list_artifacts(&self) -> SyncResult<Vec<ApiArtifact>> {
        self.get_json("/v1/artifacts").await
    }

    async fn get_artifact(&self, artifact_id: &str) -> SyncResult<ApiArtifact> {
        self.get_json(&format!("/v1/artifacts/{artifact_id}")).await
    }

    async fn create_artifact(&self, request: &CreateArtifactRequest) -> SyncResult<ApiArtifact> {
        let path = "/v1/artifacts";
        let builder = self.request(Method::POST, path).json(request);
        let response = self.send(builder, path).await?;
        Ok(response.json().await?)
    }

    async fn friends(&self) -> SyncResult<Vec<UserProfile>> {
        let body: FriendsResponse = self.get_json("/v1/friends").await?;
        Ok(body.friends)
    }

    async fn search_users(&self, query: &str) -> SyncResult<Vec<UserProfile>> {
        let path = "/v1/user/search";
        let builder = self.request(Method::GET, path).query(&[("query", query)]);
        let response = self.send(builder, path).await?;
        let body: UserSearchResponse = response.json().await?;
        Ok(body.users)
    }
}
