//! Engine client (C9): a thin HTTP client dialing the control socket, plus
//! the concurrent multi-function fan-out helpers compose uses to load,
//! unload, stop, and tail logs for a whole service list at once.
//!
//! Each request opens its own short-lived `UnixStream` and speaks HTTP/1.1
//! over it via `hyper::client::conn::http1` — no connection pool, mirroring
//! how small a "thin client to one local daemon" needs to be. Fan-out uses
//! `futures_util::future::join_all`, the same crate `serve/proxy.rs` reaches
//! for when racing multiple futures against an arbitrary backend.

use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;

use crate::registry::FunctionMetadata;
use crate::server::types::encode_payload;

/// Ceiling for `ping`; compose's engine-health poller uses this within its
/// own 10s check loop at 2s intervals.
pub const PING_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("control socket not found at {0}: the engine doesn't appear to be running")]
    SocketNotFound(PathBuf),
    #[error("connection refused at {0}: the engine may have exited without removing its socket")]
    ConnectionRefused(PathBuf),
    #[error("timed out waiting for the engine to respond")]
    Timeout,
    #[error("http transport error: {0}")]
    Transport(String),
    #[error("engine returned {kind} ({status}): {message}")]
    Remote {
        status: u16,
        kind: String,
        message: String,
    },
    #[error("{0}")]
    Aggregate(String),
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

/// Compose-style service descriptor: the one thing a separate YAML parser
/// is expected to hand the client after parsing `ignition-compose.yml`.
/// `restart` rejects unknown values at deserialization time rather than
/// silently ignoring them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    /// `namespace/name[:ref]`, see [`crate::registry::parse_function_reference`].
    pub function: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub restart: Option<RestartPolicy>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Always,
    OnFailure,
    No,
}

/// A thin HTTP-over-UDS client for the control plane.
#[derive(Clone)]
pub struct EngineClient {
    socket_path: PathBuf,
}

impl EngineClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    async fn connect(&self) -> Result<UnixStream, ClientError> {
        UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| classify_connect_error(&self.socket_path, &e))
    }

    async fn request<B: Serialize, R: DeserializeOwned>(
        &self,
        method: http::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<R, ClientError> {
        let bytes = self.request_raw(method, path, body).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ClientError::Transport(format!("error decoding response body: {e}")))
    }

    /// Send a request and return the raw response body bytes (used both for
    /// JSON responses and for `/call`, whose body is opaque plugin output).
    async fn request_raw<B: Serialize>(
        &self,
        method: http::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Bytes, ClientError> {
        let stream = self.connect().await?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!(error = %err, "control connection closed");
            }
        });

        let payload = match body {
            Some(body) => serde_json::to_vec(body)
                .map_err(|e| ClientError::Transport(format!("error encoding request body: {e}")))?,
            None => b"{}".to_vec(),
        };

        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::HOST, "ignition")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            let parsed: Result<ErrorBody, _> = serde_json::from_slice(&body_bytes);
            return Err(match parsed {
                Ok(body) => ClientError::Remote {
                    status: status.as_u16(),
                    kind: body.error,
                    message: body.message,
                },
                Err(_) => ClientError::Remote {
                    status: status.as_u16(),
                    kind: "Unknown".to_string(),
                    message: String::from_utf8_lossy(&body_bytes).into_owned(),
                },
            });
        }

        Ok(body_bytes)
    }

    /// Ping the engine with a bounded timeout, classifying connection
    /// failures into specific, user-actionable messages.
    pub async fn ping(&self) -> Result<(), ClientError> {
        match tokio::time::timeout(PING_TIMEOUT, self.status()).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    pub async fn status(&self) -> Result<serde_json::Value, ClientError> {
        self.request::<(), _>(http::Method::GET, "/status", None).await
    }

    pub async fn load(
        &self,
        namespace: &str,
        name: &str,
        digest: &str,
        config: HashMap<String, String>,
        force_load: bool,
    ) -> Result<serde_json::Value, ClientError> {
        let body = serde_json::json!({
            "namespace": namespace,
            "name": name,
            "digest": digest,
            "config": config,
            "force_load": force_load,
        });
        self.request(http::Method::POST, "/load", Some(&body)).await
    }

    pub async fn unload(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let body = serde_json::json!({ "namespace": namespace, "name": name });
        self.request::<_, serde_json::Value>(http::Method::POST, "/unload", Some(&body))
            .await?;
        Ok(())
    }

    pub async fn stop(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let body = serde_json::json!({ "namespace": namespace, "name": name });
        self.request::<_, serde_json::Value>(http::Method::POST, "/stop", Some(&body))
            .await?;
        Ok(())
    }

    pub async fn call(
        &self,
        namespace: &str,
        name: &str,
        entrypoint: &str,
        payload: &[u8],
        config: HashMap<String, String>,
    ) -> Result<Vec<u8>, ClientError> {
        let body = serde_json::json!({
            "namespace": namespace,
            "name": name,
            "entrypoint": entrypoint,
            "payload": encode_payload(payload),
            "config": config,
        });
        let bytes = self
            .request_raw(http::Method::POST, "/call", Some(&body))
            .await?;
        Ok(bytes.to_vec())
    }

    pub async fn call_once(
        &self,
        namespace: &str,
        name: &str,
        reference: &str,
        entrypoint: &str,
        payload: &[u8],
        config: HashMap<String, String>,
    ) -> Result<Vec<u8>, ClientError> {
        let body = serde_json::json!({
            "namespace": namespace,
            "name": name,
            "reference": reference,
            "entrypoint": entrypoint,
            "payload": encode_payload(payload),
            "config": config,
        });
        let bytes = self
            .request_raw(http::Method::POST, "/call-once", Some(&body))
            .await?;
        Ok(bytes.to_vec())
    }

    pub async fn build(
        &self,
        namespace: &str,
        name: &str,
        path: &str,
        tag: Option<&str>,
        manifest: serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        let body = serde_json::json!({
            "namespace": namespace,
            "name": name,
            "path": path,
            "tag": tag,
            "manifest": manifest,
        });
        self.request(http::Method::POST, "/build", Some(&body)).await
    }

    pub async fn list_all(&self) -> Result<Vec<FunctionMetadata>, ClientError> {
        self.request::<_, Vec<FunctionMetadata>>(http::Method::POST, "/list", Some(&serde_json::json!({})))
            .await
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<FunctionMetadata, ClientError> {
        let body = serde_json::json!({ "namespace": namespace, "name": name });
        self.request(http::Method::POST, "/list", Some(&body)).await
    }

    pub async fn loaded(&self) -> Result<Vec<serde_json::Value>, ClientError> {
        self.request::<(), _>(http::Method::GET, "/loaded", None).await
    }

    pub async fn reassign_tag(
        &self,
        namespace: &str,
        name: &str,
        tag: &str,
        digest: &str,
    ) -> Result<(), ClientError> {
        let body = serde_json::json!({
            "namespace": namespace,
            "name": name,
            "tag": tag,
            "digest": digest,
        });
        self.request::<_, serde_json::Value>(http::Method::POST, "/reassign-tag", Some(&body))
            .await?;
        Ok(())
    }

    pub async fn logs(
        &self,
        namespace: &str,
        name: &str,
        since: Option<u64>,
        tail: Option<usize>,
    ) -> Result<Vec<String>, ClientError> {
        let mut path = format!("/logs/{namespace}/{name}?");
        if let Some(since) = since {
            path.push_str(&format!("since={since}&"));
        }
        if let Some(tail) = tail {
            path.push_str(&format!("tail={tail}&"));
        }
        self.request::<(), _>(http::Method::GET, path.trim_end_matches(['&', '?']), None)
            .await
    }

    /// Unload every `(namespace, name)` in `keys` concurrently, aggregating
    /// per-key failures into one joined error that still names each key.
    pub async fn unload_functions(&self, keys: &[(String, String)]) -> Result<(), ClientError> {
        self.fan_out(keys, |client, (ns, name)| {
            let client = client.clone();
            let ns = ns.clone();
            let name = name.clone();
            async move { client.unload(&ns, &name).await }
        })
        .await
    }

    /// Stop every `(namespace, name)` in `keys` concurrently, same
    /// aggregation behavior as [`Self::unload_functions`].
    pub async fn stop_functions(&self, keys: &[(String, String)]) -> Result<(), ClientError> {
        self.fan_out(keys, |client, (ns, name)| {
            let client = client.clone();
            let ns = ns.clone();
            let name = name.clone();
            async move { client.stop(&ns, &name).await }
        })
        .await
    }

    async fn fan_out<F, Fut>(&self, keys: &[(String, String)], make: F) -> Result<(), ClientError>
    where
        F: Fn(&Self, &(String, String)) -> Fut,
        Fut: Future<Output = Result<(), ClientError>>,
    {
        let futures = keys.iter().map(|key| make(self, key));
        let results = futures_util::future::join_all(futures).await;

        let mut errors = Vec::new();
        for (key, result) in keys.iter().zip(results) {
            if let Err(err) = result {
                errors.push(format!("{}/{}: {err}", key.0, key.1));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ClientError::Aggregate(errors.join("; ")))
        }
    }
}

fn classify_connect_error(socket_path: &Path, err: &std::io::Error) -> ClientError {
    match err.kind() {
        ErrorKind::NotFound => ClientError::SocketNotFound(socket_path.to_path_buf()),
        ErrorKind::ConnectionRefused => ClientError::ConnectionRefused(socket_path.to_path_buf()),
        ErrorKind::TimedOut => ClientError::Timeout,
        _ => ClientError::Transport(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_policy_rejects_unknown_values() {
        let err = serde_json::from_str::<RestartPolicy>("\"sometimes\"").unwrap_err();
        assert!(err.to_string().contains("unknown variant"));
    }

    #[test]
    fn restart_policy_parses_kebab_case() {
        assert_eq!(
            serde_json::from_str::<RestartPolicy>("\"on-failure\"").unwrap(),
            RestartPolicy::OnFailure
        );
    }

    #[tokio::test]
    async fn ping_against_missing_socket_is_socket_not_found() {
        let client = EngineClient::new("/tmp/ignition-definitely-not-a-real-socket.sock");
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, ClientError::SocketNotFound(_)));
    }
}
