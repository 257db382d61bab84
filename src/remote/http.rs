//! REST client for the document store.
//!
//! Endpoints, relative to the configured base URL:
//! - `POST   {resource}`      create, responds `{"id": "..."}`
//! - `PUT    {resource}/{id}` replace
//! - `DELETE {resource}/{id}` delete
//! - `GET    {resource}/{id}` fetch one, 404 when absent
//! - `GET    {resource}`      fetch the whole collection as a JSON array

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::RemoteStore;
use crate::error::RemoteError;

#[derive(Debug, Deserialize)]
struct CreatedResponse {
  id: String,
}

/// Document store client wrapper
#[derive(Clone)]
pub struct HttpRemote {
  client: Client,
  base: Url,
  token: Option<String>,
}

impl HttpRemote {
  pub fn new(base: Url, token: Option<String>, timeout: Duration) -> Result<Self, RemoteError> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| RemoteError::Transport(format!("failed to build http client: {}", e)))?;

    Ok(Self {
      client,
      base,
      token,
    })
  }

  /// Resource and id are pushed as single path segments, percent-encoded,
  /// so they can never leave the base URL's host or path prefix.
  fn url(&self, resource_type: &str, id: Option<&str>) -> Result<Url, RemoteError> {
    let mut url = self.base.clone();
    {
      let mut segments = url
        .path_segments_mut()
        .map_err(|_| RemoteError::Transport(format!("base URL cannot hold a path: {}", self.base)))?;
      segments.pop_if_empty().push(resource_type);
      if let Some(id) = id {
        segments.push(id);
      }
    }
    Ok(url)
  }

  async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
    let request = match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    };

    request.send().await.map_err(map_reqwest_error)
  }
}

#[async_trait]
impl RemoteStore for HttpRemote {
  async fn create(&self, resource_type: &str, payload: &Value) -> Result<String, RemoteError> {
    let url = self.url(resource_type, None)?;
    debug!(%url, "POST");
    let response = check(self.send(self.client.post(url).json(payload)).await?).await?;

    let created: CreatedResponse = response
      .json()
      .await
      .map_err(|e| RemoteError::Decode(e.to_string()))?;
    Ok(created.id)
  }

  async fn update(&self, resource_type: &str, id: &str, payload: &Value) -> Result<(), RemoteError> {
    let url = self.url(resource_type, Some(id))?;
    debug!(%url, "PUT");
    check(self.send(self.client.put(url).json(payload)).await?).await?;
    Ok(())
  }

  async fn delete(&self, resource_type: &str, id: &str) -> Result<(), RemoteError> {
    let url = self.url(resource_type, Some(id))?;
    debug!(%url, "DELETE");
    let response = self.send(self.client.delete(url)).await?;
    // Already gone is as good as deleted.
    if response.status() == StatusCode::NOT_FOUND {
      return Ok(());
    }
    check(response).await?;
    Ok(())
  }

  async fn fetch_one(&self, resource_type: &str, id: &str) -> Result<Option<Value>, RemoteError> {
    let url = self.url(resource_type, Some(id))?;
    debug!(%url, "GET");
    let response = self.send(self.client.get(url)).await?;
    if response.status() == StatusCode::NOT_FOUND {
      return Ok(None);
    }

    let value = check(response)
      .await?
      .json()
      .await
      .map_err(|e| RemoteError::Decode(e.to_string()))?;
    Ok(Some(value))
  }

  async fn fetch_collection(&self, resource_type: &str) -> Result<Vec<Value>, RemoteError> {
    let url = self.url(resource_type, None)?;
    debug!(%url, "GET");
    check(self.send(self.client.get(url)).await?)
      .await?
      .json()
      .await
      .map_err(|e| RemoteError::Decode(e.to_string()))
  }
}

/// Turn a non-success response into an error carrying the body text.
async fn check(response: Response) -> Result<Response, RemoteError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  let message = response.text().await.unwrap_or_default();
  Err(RemoteError::Status {
    status: status.as_u16(),
    message,
  })
}

fn map_reqwest_error(e: reqwest::Error) -> RemoteError {
  if e.is_timeout() {
    RemoteError::Timeout
  } else if e.is_connect() {
    RemoteError::Offline
  } else {
    RemoteError::Transport(e.to_string())
  }
}
