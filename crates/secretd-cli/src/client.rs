//! HTTP/1.1 client over the agent's Unix-domain socket.
//!
//! One connection per request: commands are single-shot, so the handshake
//! cost is irrelevant and the client stays stateless. Error envelopes from
//! the agent are mapped back onto the core error taxonomy by status.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::{header, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use secretd_core::error::{Error, ErrorBody, ErrorDetail, Result};
use secretd_core::operation::CreateOperationParameters;
use secretd_core::store::{Items, SecretStore, SecretsById};
use secretd_core::{
    Instance, Instances, Operation, OperationName, OperationParameters, Range, Secret, Secrets,
};
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;

/// A store implementation speaking to a running agent.
#[derive(Debug, Clone)]
pub struct SecretClient {
    socket: PathBuf,
}

impl SecretClient {
    /// Creates a client for the agent listening on `socket`.
    #[must_use]
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: String,
        body: Option<Vec<u8>>,
    ) -> Result<T> {
        let stream = UnixStream::connect(&self.socket).await.map_err(|e| {
            Error::BadConfig(format!(
                "failed to connect to {}: {e}",
                self.socket.display()
            ))
        })?;
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::Journal(format!("handshake failed: {e}")))?;
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, "localhost")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| Error::BadRequest(format!("failed to build request - {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::Journal(format!("request failed: {e}")))?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Journal(format!("failed to read response: {e}")))?
            .to_bytes();

        if let Ok(envelope) = serde_json::from_slice::<ErrorBody>(&bytes) {
            if let Some(detail) = envelope.error {
                return Err(remote_error(detail, retry_after));
            }
        }
        if !status.is_success() {
            return Err(Error::Journal(format!("unexpected response status {status}")));
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            Error::BadRequest(format!(
                "failed to parse response, {e} - '{}'",
                String::from_utf8_lossy(&bytes)
            ))
        })
    }
}

/// Reconstructs the taxonomy variant matching a remote error envelope.
fn remote_error(detail: ErrorDetail, retry_after: Option<u64>) -> Error {
    match StatusCode::from_u16(detail.status) {
        Ok(StatusCode::UNAUTHORIZED) => Error::Unauthenticated(detail.message),
        Ok(StatusCode::FORBIDDEN) => Error::Forbidden(detail.message),
        Ok(StatusCode::TOO_MANY_REQUESTS) => Error::RateLimited {
            retry_after: retry_after.unwrap_or_default(),
        },
        Ok(status) if status.is_client_error() => Error::BadRequest(detail.message),
        _ => Error::Journal(detail.message),
    }
}

fn range_query(range: Range) -> String {
    format!("?from={}&to={}", range.from, range.to)
}

#[async_trait]
impl SecretStore for SecretClient {
    async fn list_secrets(&self) -> Result<Secrets> {
        let items: Items<SecretsById> = self
            .request(Method::GET, "/secrets".to_string(), None)
            .await?;
        Ok(items.items.0)
    }

    async fn get_secret(&self, secret_id: &str) -> Result<Secret> {
        self.request(Method::GET, format!("/secrets/{secret_id}"), None)
            .await
    }

    async fn secret_history(&self, secret_id: &str, range: Range) -> Result<Vec<Operation>> {
        self.request(
            Method::GET,
            format!("/secrets/{secret_id}/operations{}", range_query(range)),
            None,
        )
        .await
    }

    async fn list_instances(&self, secret_id: &str, range: Range) -> Result<Instances> {
        let items: Items<Instances> = self
            .request(
                Method::GET,
                format!("/secrets/{secret_id}/instances{}", range_query(range)),
                None,
            )
            .await?;
        Ok(items.items)
    }

    async fn get_instance(&self, secret_id: &str, instance_id: &str) -> Result<Instance> {
        self.request(
            Method::GET,
            format!("/secrets/{secret_id}/instances/{instance_id}"),
            None,
        )
        .await
    }

    async fn get_active(&self, secret_id: &str) -> Result<Option<Instance>> {
        self.request(Method::GET, format!("/secrets/{secret_id}/active"), None)
            .await
    }

    async fn create(&self, secret_id: &str, parameters: OperationParameters) -> Result<Instance> {
        let body = serde_json::to_vec(&parameters)
            .map_err(|e| Error::BadRequest(format!("failed to serialize parameters - {e}")))?;
        self.request(
            Method::POST,
            format!("/secrets/{secret_id}/instances"),
            Some(body),
        )
        .await
    }

    async fn operate(
        &self,
        secret_id: &str,
        instance_id: &str,
        name: OperationName,
        parameters: OperationParameters,
    ) -> Result<Instance> {
        let body = serde_json::to_vec(&CreateOperationParameters { name, parameters })
            .map_err(|e| Error::BadRequest(format!("failed to serialize parameters - {e}")))?;
        self.request(
            Method::POST,
            format!("/secrets/{secret_id}/instances/{instance_id}/operations"),
            Some(body),
        )
        .await
    }

    async fn instance_history(
        &self,
        secret_id: &str,
        instance_id: &str,
        range: Range,
    ) -> Result<Vec<Operation>> {
        self.request(
            Method::GET,
            format!(
                "/secrets/{secret_id}/instances/{instance_id}/operations{}",
                range_query(range)
            ),
            None,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_map_back_onto_the_taxonomy() {
        let detail = |status, message: &str| ErrorDetail {
            status,
            message: message.to_string(),
        };
        assert!(matches!(
            remote_error(detail(400, "cannot activate"), None),
            Error::BadRequest(_)
        ));
        assert!(matches!(
            remote_error(detail(401, "who are you"), None),
            Error::Unauthenticated(_)
        ));
        assert!(matches!(
            remote_error(detail(403, "no"), None),
            Error::Forbidden(_)
        ));
        assert!(matches!(
            remote_error(detail(429, "rate limit exceeded"), Some(60)),
            Error::RateLimited { retry_after: 60 }
        ));
        assert!(matches!(
            remote_error(detail(500, "boom"), None),
            Error::Journal(_)
        ));
    }

    #[tokio::test]
    async fn connect_failure_is_surfaced() {
        let client = SecretClient::new(PathBuf::from("/nonexistent/agent.sock"));
        let err = client.list_secrets().await.unwrap_err();
        assert!(matches!(err, Error::BadConfig(_)), "{err:?}");
    }
}
