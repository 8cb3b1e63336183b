//! The wire transport (spec §6): a `Transport` trait carrying the five
//! request kinds plus a reachability check, and a `reqwest`-blocking
//! default implementation.
//!
//! Kept separate from [`crate::client`] so the sync procedures stay
//! testable against a fake transport without a live server.

use std::time::Duration;

use crate::error::Result;
use crate::message::{Payload, PullMessage, PullRequestMessage, PushMessage, RegisterMessage};
use crate::model::Version;

/// Everything a sync cycle needs from the network. `base_url` is supplied
/// once at construction; every call is relative to it.
pub trait Transport: Send + Sync {
    fn register(&self, registry_user_id: Option<i64>) -> Result<RegisterMessage>;
    fn pull(&self, request: &PullRequestMessage) -> Result<PullMessage>;
    fn push(&self, message: &PushMessage) -> Result<Version>;
    fn repair(&self, exclude_extensions: bool) -> Result<(PullMessage, Option<i64>)>;
    fn query(&self, model_name: &str, column: &str, value: &str) -> Result<Payload>;
    /// `HEAD /ping`; `Ok(true)` means the server answered with 2xx.
    fn ping(&self) -> Result<bool>;
}

/// Synchronous, `reqwest`-blocking implementation of [`Transport`] — the
/// teacher's code is entirely synchronous, so this crate never reaches for
/// an async runtime either.
#[cfg(feature = "http")]
pub struct ReqwestTransport {
    base_url: String,
    client: reqwest::blocking::Client,
    registry_user_id_header: Option<String>,
}

#[cfg(feature = "http")]
impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(crate::error::SyncError::Network)?;
        Ok(ReqwestTransport { base_url: base_url.into(), client, registry_user_id_header: None })
    }

    /// Sets a static bearer-ish header sent on every request, filled in by
    /// the host's authentication callback equivalent.
    pub fn with_auth_header(mut self, value: impl Into<String>) -> Self {
        self.registry_user_id_header = Some(value.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.registry_user_id_header {
            Some(value) => builder.header("Authorization", value),
            None => builder,
        }
    }
}

#[cfg(feature = "http")]
impl Transport for ReqwestTransport {
    fn register(&self, registry_user_id: Option<i64>) -> Result<RegisterMessage> {
        let mut req = self.authed(self.client.post(self.url("/register")));
        if let Some(id) = registry_user_id {
            req = req.json(&serde_json::json!({ "registry_user_id": id }));
        }
        decode_response(req.send())
    }

    fn pull(&self, request: &PullRequestMessage) -> Result<PullMessage> {
        let req = self.authed(self.client.get(self.url("/pull")).json(request));
        decode_response(req.send())
    }

    fn push(&self, message: &PushMessage) -> Result<Version> {
        let req = self.authed(self.client.post(self.url("/push")).json(message));
        let response = req.send().map_err(crate::error::SyncError::Network)?;
        if !response.status().is_success() {
            return Err(push_rejection(response));
        }
        response
            .json::<Version>()
            .map_err(|err| crate::error::SyncError::BadResponse(err.to_string()))
    }

    fn repair(&self, exclude_extensions: bool) -> Result<(PullMessage, Option<i64>)> {
        let mut req = self.authed(self.client.get(self.url("/repair")));
        if exclude_extensions {
            req = req.query(&[("exclude_extensions", "true")]);
        }
        let response = req.send().map_err(crate::error::SyncError::Network)?;
        if !response.status().is_success() {
            return Err(crate::error::SyncError::BadResponse(response.status().to_string()));
        }
        #[derive(serde::Deserialize)]
        struct RepairResponse {
            #[serde(flatten)]
            pull: PullMessage,
            latest_version_id: Option<i64>,
        }
        let body: RepairResponse = response
            .json()
            .map_err(|err| crate::error::SyncError::BadResponse(err.to_string()))?;
        Ok((body.pull, body.latest_version_id))
    }

    fn query(&self, model_name: &str, column: &str, value: &str) -> Result<Payload> {
        let param = format!("{model_name}_{column}");
        let req = self
            .authed(self.client.get(self.url("/query")))
            .query(&[("model", model_name), (&param, value)]);
        #[derive(serde::Deserialize)]
        struct QueryResponse {
            payload: Payload,
        }
        let response: QueryResponse = decode_response(req.send())?;
        Ok(response.payload)
    }

    fn ping(&self) -> Result<bool> {
        let response = self
            .authed(self.client.head(self.url("/ping")))
            .send()
            .map_err(crate::error::SyncError::Network)?;
        Ok(response.status().is_success())
    }
}

#[cfg(feature = "http")]
fn decode_response<T: serde::de::DeserializeOwned>(result: std::result::Result<reqwest::blocking::Response, reqwest::Error>) -> Result<T> {
    let response = result.map_err(crate::error::SyncError::Network)?;
    if !response.status().is_success() {
        return Err(crate::error::SyncError::BadResponse(response.status().to_string()));
    }
    response.json().map_err(|err| crate::error::SyncError::BadResponse(err.to_string()))
}

#[cfg(feature = "http")]
fn push_rejection(response: reqwest::blocking::Response) -> crate::error::SyncError {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        error: Vec<String>,
    }
    let status = response.status();
    match response.json::<ErrorBody>() {
        Ok(body) => crate::error::SyncError::PushRejected(body.error.join("; ")),
        Err(_) => crate::error::SyncError::PushRejected(status.to_string()),
    }
}
