//! REST client for the DocIt server. Every response is unwrapped from the
//! `{ success, data | error }` envelope into `Result<T, ApiError>`.

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use shared::{
    codes, ApiEnvelope, AuthCallbackRequest, AuthTokensResponse, AuthUrlResponse,
    CreateWorkspaceRequest, InviteRequest, RefreshRequest, RefreshResponse, UserInfo,
    WorkspaceInfo,
};
use thiserror::Error;
use uuid::Uuid;

use crate::session::TokenRefresher;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} ({code})")]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The access token was missing, expired or malformed
    pub fn is_unauthorized(&self) -> bool {
        self.code == codes::UNAUTHORIZED
    }

    pub fn signed_out() -> Self {
        Self::new(codes::INVALID_TOKEN, "Session expired, run `docit login` again")
    }

    fn network(e: reqwest::Error) -> Self {
        Self::new(codes::NETWORK_ERROR, format!("Could not reach the server: {}", e))
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Chat endpoint for a workspace, on the same host as the REST API
    pub fn chat_url(&self, workspace_id: Uuid) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        format!("{}/ws?workspaceId={}", ws_base, workspace_id)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let resp = request.send().await.map_err(ApiError::network)?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(ApiError::network)?;

        match serde_json::from_slice::<ApiEnvelope<T>>(&bytes) {
            Ok(envelope) => envelope
                .into_result()
                .map_err(|e| ApiError::new(e.code, e.message)),
            Err(_) => Err(ApiError::new(
                "REQUEST_FAILED",
                format!("Unexpected response from server ({})", status),
            )),
        }
    }

    pub async fn google_url(&self) -> Result<AuthUrlResponse, ApiError> {
        self.send(self.http.get(self.url("/api/auth/google"))).await
    }

    pub async fn exchange_code(&self, code: &str) -> Result<AuthTokensResponse, ApiError> {
        let body = AuthCallbackRequest {
            code: code.to_string(),
        };
        self.send(self.http.post(self.url("/api/auth/google/callback")).json(&body))
            .await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, ApiError> {
        let body = RefreshRequest {
            refresh_token: refresh_token.to_string(),
        };
        self.send(self.http.post(self.url("/api/auth/refresh")).json(&body))
            .await
    }

    pub async fn me(&self, access_token: &str) -> Result<UserInfo, ApiError> {
        self.send(
            self.http
                .get(self.url("/api/auth/me"))
                .bearer_auth(access_token),
        )
        .await
    }

    pub async fn create_workspace(
        &self,
        access_token: &str,
        body: &CreateWorkspaceRequest,
    ) -> Result<WorkspaceInfo, ApiError> {
        self.send(
            self.http
                .post(self.url("/api/workspaces"))
                .bearer_auth(access_token)
                .json(body),
        )
        .await
    }

    pub async fn workspace(
        &self,
        access_token: &str,
        workspace_id: Uuid,
    ) -> Result<WorkspaceInfo, ApiError> {
        self.send(
            self.http
                .get(self.url(&format!("/api/workspaces/{}", workspace_id)))
                .bearer_auth(access_token),
        )
        .await
    }

    pub async fn invite(
        &self,
        access_token: &str,
        workspace_id: Uuid,
        body: &InviteRequest,
    ) -> Result<WorkspaceInfo, ApiError> {
        self.send(
            self.http
                .post(self.url(&format!("/api/workspaces/{}/invite", workspace_id)))
                .bearer_auth(access_token)
                .json(body),
        )
        .await
    }
}

#[async_trait]
impl TokenRefresher for ApiClient {
    async fn rotate_access(&self, refresh_token: &str) -> Result<String, ApiError> {
        Ok(self.refresh(refresh_token).await?.access_token)
    }
}
