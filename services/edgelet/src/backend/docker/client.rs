//! Docker Engine HTTP client over the engine's Unix socket.

use std::path::Path;

use hyper::{Body, Client, Method, Request, Response, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::models::ErrorMessage;
use crate::backend::BackendError;

/// Engine API client.
pub struct EngineClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl EngineClient {
    /// Create a client for the given socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        let client = Client::unix();
        Self {
            socket_path,
            client,
        }
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    /// GET and decode a JSON body.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        let response = self.send(Method::GET, path, None).await?;
        read_json(response).await
    }

    /// POST a JSON body and decode the JSON answer.
    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BackendError> {
        let body = serde_json::to_vec(body)?;
        let response = self.send(Method::POST, path, Some(body)).await?;
        read_json(response).await
    }

    /// POST without a body and decode the JSON answer.
    pub async fn post_for<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        let response = self.send(Method::POST, path, None).await?;
        read_json(response).await
    }

    /// POST without a body, ignoring the answer.
    pub async fn post_empty(&self, path: &str) -> Result<(), BackendError> {
        let response = self.send(Method::POST, path, None).await?;
        hyper::body::to_bytes(response.into_body()).await?;
        Ok(())
    }

    /// POST without a body and hand back the streamed answer.
    pub async fn post_stream(&self, path: &str) -> Result<Body, BackendError> {
        let response = self.send(Method::POST, path, None).await?;
        Ok(response.into_body())
    }

    /// GET and hand back the streamed answer.
    pub async fn get_stream(&self, path: &str) -> Result<Body, BackendError> {
        let response = self.send(Method::GET, path, None).await?;
        Ok(response.into_body())
    }

    pub async fn delete(&self, path: &str) -> Result<(), BackendError> {
        let response = self.send(Method::DELETE, path, None).await?;
        hyper::body::to_bytes(response.into_body()).await?;
        Ok(())
    }

    /// Perform a request. Non-success statuses become [`BackendError::Api`];
    /// `304 Not Modified` (already started, already stopped) counts as success.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response<Body>, BackendError> {
        let uri = Uri::new(&self.socket_path, path);

        debug!(method = %method, path = path, "Engine API request");

        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        let request = match body {
            Some(bytes) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(bytes))?,
            None => builder.body(Body::empty())?,
        };

        let response = self.client.request(request).await?;
        let status = response.status();

        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(response);
        }

        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        let message = serde_json::from_slice::<ErrorMessage>(&bytes)
            .map(|e| e.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).trim().to_string());
        debug!(status = %status, message = %message, "Engine API error");

        Err(BackendError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

async fn read_json<T: DeserializeOwned>(response: Response<Body>) -> Result<T, BackendError> {
    let bytes = hyper::body::to_bytes(response.into_body()).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Encode query parameters.
pub fn query(pairs: &[(&str, &str)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

/// Whether an error is the engine's 404.
pub fn is_missing(error: &BackendError) -> bool {
    matches!(error, BackendError::Api { status: 404, .. })
}
