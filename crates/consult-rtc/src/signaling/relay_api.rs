//! Relay REST client
//!
//! Thin typed wrapper over the relay's room endpoints. Used directly by the
//! poll transport, and by the persistent channel for room status queries.

use super::protocol::{
    JoinRequest, JoinResponse, MessagesResponse, RoomId, RoomStatus, SignalRequest,
    SignalingEnvelope,
};
use crate::{Error, Result};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Relay REST client authenticated with a bearer token
#[derive(Clone)]
pub struct RelayApi {
    /// Base URL (e.g., "http://localhost:8080")
    base_url: Url,

    /// Bearer token
    token: String,

    /// Reqwest HTTP client
    client: reqwest::Client,
}

impl RelayApi {
    /// Create a new relay client
    ///
    /// # Arguments
    ///
    /// * `base_url` - Relay base URL
    /// * `token` - Bearer token sent on every request
    /// * `timeout` - Per-request timeout
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::InvalidConfig(format!("Invalid relay URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidConfig(format!(
                "Relay URL cannot be a base: {}",
                base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::HttpError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            token: token.to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base}/rooms/{room}/{action}` with the room id escaped as one path segment
    fn room_url(&self, room: &RoomId, action: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidConfig("Relay URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["rooms", room.as_str(), action]);
        Ok(url)
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AuthenticationFailed(format!("{}: {}", status, body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::HttpError(format!("{}: {}", status, body)));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::SerializationError(format!("Invalid relay response: {}", e)))
    }

    async fn expect_success(response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::AuthenticationFailed(status.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::HttpError(format!("{}: {}", status, body)));
        }
        Ok(())
    }

    /// `POST /rooms/{roomId}/join`
    pub async fn join(&self, room: &RoomId, appointment_id: &str) -> Result<JoinResponse> {
        let url = self.room_url(room, "join")?;
        debug!("POST {}", url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&JoinRequest {
                appointment_id: appointment_id.to_string(),
            })
            .send()
            .await?;
        Self::read_json(response).await
    }

    /// `POST /rooms/{roomId}/leave`
    pub async fn leave(&self, room: &RoomId) -> Result<()> {
        let url = self.room_url(room, "leave")?;
        debug!("POST {}", url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::expect_success(response).await
    }

    /// `POST /rooms/{roomId}/signal`
    pub async fn signal(&self, room: &RoomId, envelope: &SignalingEnvelope) -> Result<()> {
        let url = self.room_url(room, "signal")?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&SignalRequest {
                signal: envelope.clone(),
                target_id: envelope.target_id.clone(),
            })
            .send()
            .await?;
        Self::expect_success(response).await
    }

    /// `GET /rooms/{roomId}/messages?since=`
    pub async fn messages(&self, room: &RoomId, since: f64) -> Result<MessagesResponse> {
        let mut url = self.room_url(room, "messages")?;
        url.query_pairs_mut().append_pair("since", &since.to_string());
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::read_json(response).await
    }

    /// `GET /rooms/{roomId}/status`
    pub async fn status(&self, room: &RoomId) -> Result<RoomStatus> {
        let url = self.room_url(room, "status")?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::read_json(response).await
    }
}
