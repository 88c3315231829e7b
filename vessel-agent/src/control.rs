//! The control-plane API client.
//!
//! `ControlClient` is composed with (not inherited from) [`HttpClient`]: it
//! owns one and binds it to the versioned control-plane path prefix,
//! injecting the `Authorization: Bearer <client_token>` header on every
//! route except `install_client`.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use vessel::store::models::ProviderRecord;
use vessel::store::LocalStore;
use vessel::BackupFile;

use crate::error::{AgentError, AgentResult};
use crate::http::{HttpClient, Request};

const API_PREFIX: &str = "/v1";

#[derive(Debug, Serialize)]
struct InstallRequest<'a> {
    deployment_key: &'a str,
    hostname: &'a str,
    os: &'a str,
}

#[derive(Debug, Deserialize)]
struct InstallResponse {
    client_token: String,
    user_id: String,
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    agent_version: &'a str,
    uptime: u64,
}

#[derive(Debug, Deserialize)]
struct HeartbeatResponse {
    settings: serde_json::Value,
    providers: Vec<ProviderRecord>,
}

/// A heartbeat's parsed response: the authoritative provider list plus
/// whatever opaque settings blob the control plane returned alongside it.
pub struct HeartbeatOutcome {
    pub providers: Vec<ProviderRecord>,
    pub settings: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct InitUploadRequest<'a> {
    path_hash: String,
    path: &'a str,
    size: u64,
    sha256: String,
    parts: u32,
    chunk_size: u64,
}

#[derive(Debug, Deserialize)]
struct InitUploadResponse {
    upload_key: String,
}

#[derive(Debug, Deserialize)]
struct CompleteUploadResponse {
    status: String,
}

#[derive(Debug, Serialize)]
struct StatusRequest {
    files_seen: u64,
    bytes_uploaded: u64,
    errors: u64,
}

/// The control-plane client.
pub struct ControlClient {
    http: HttpClient,
    client_token: Option<String>,
    agent_version: String,
}

impl ControlClient {
    pub fn new(http: HttpClient, agent_version: impl Into<String>) -> Self {
        Self {
            http,
            client_token: None,
            agent_version: agent_version.into(),
        }
    }

    /// Refreshes the bearer token used on authenticated routes from a
    /// freshly read value (normally the caller pulled this from
    /// `LocalStore::get_client_identity`).
    pub fn refresh_client_token(&mut self, token: Option<String>) {
        self.client_token = token;
    }

    /// Returns the local store's highest-priority enabled provider (§4.5).
    pub fn get_storage_provider(&self, store: &LocalStore) -> AgentResult<Option<ProviderRecord>> {
        Ok(store.highest_priority_enabled_provider()?)
    }

    /// Posts an aggregated status tick (§4.7): files seen, bytes uploaded,
    /// and errors accumulated since the last push. Drives control-plane
    /// visibility only; failures here never affect upload correctness.
    pub async fn post_status(
        &mut self,
        files_seen: u64,
        bytes_uploaded: u64,
        errors: u64,
    ) -> AgentResult<()> {
        let payload = StatusRequest {
            files_seen,
            bytes_uploaded,
            errors,
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|e| AgentError::Protocol(format!("failed to encode status: {e}")))?;

        let auth = self.auth_header()?;
        let request = Request::new("POST", format!("{API_PREFIX}/status"))
            .header(auth.0, auth.1)
            .header("Content-Type", "application/json")
            .body(body);

        let response = self.http.send(&request).await?;
        ensure_success(response.status, || "post_status".to_string())
    }

    fn auth_header(&self) -> AgentResult<(String, String)> {
        let token = self
            .client_token
            .as_deref()
            .ok_or_else(|| AgentError::Protocol("no client token set".into()))?;
        Ok(("Authorization".to_string(), format!("Bearer {token}")))
    }

    /// Enrolls this agent with the control plane using its deployment key.
    /// Idempotent: a server that reports the deployment key already
    /// installed still yields a usable client token.
    pub async fn install_client(
        &mut self,
        deployment_key: &str,
        hostname: &str,
        os: &str,
    ) -> AgentResult<(String, String)> {
        let payload = InstallRequest {
            deployment_key,
            hostname,
            os,
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|e| AgentError::Protocol(format!("failed to encode install request: {e}")))?;

        let request = Request::new("POST", format!("{API_PREFIX}/install"))
            .header("Content-Type", "application/json")
            .body(body);

        let response = self.http.send(&request).await?;
        let parsed = parse_json_response::<InstallResponse>(response)?;
        debug!(user_id = %parsed.user_id, "installed client");
        Ok((parsed.client_token, parsed.user_id))
    }

    /// Posts a heartbeat and returns the authoritative provider list and
    /// settings blob from the response, for the caller to reconcile into
    /// the local store.
    pub async fn heartbeat(&mut self, uptime_secs: u64) -> AgentResult<HeartbeatOutcome> {
        let payload = HeartbeatRequest {
            agent_version: &self.agent_version,
            uptime: uptime_secs,
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|e| AgentError::Protocol(format!("failed to encode heartbeat: {e}")))?;

        let auth = self.auth_header()?;
        let request = Request::new("POST", format!("{API_PREFIX}/heartbeat"))
            .header(auth.0, auth.1)
            .header("Content-Type", "application/json")
            .body(body);

        let response = self.http.send(&request).await?;
        let parsed = parse_json_response::<HeartbeatResponse>(response)?;
        info!(providers = parsed.providers.len(), "heartbeat acknowledged");
        Ok(HeartbeatOutcome {
            providers: parsed.providers,
            settings: parsed.settings,
        })
    }

    /// Starts (or resumes) an upload for a file, returning the server's
    /// upload key. Idempotent by path-hash while the upload is open.
    pub async fn init_upload(&mut self, file: &mut BackupFile) -> AgentResult<String> {
        let sha256 = file.content_sha256().await?;
        let canonical_path = file.canonical_path().to_string_lossy().into_owned();
        let payload = InitUploadRequest {
            path_hash: file.path_hash().to_hex(),
            path: &canonical_path,
            size: file.size(),
            sha256: sha256.to_hex(),
            parts: file.total_parts(),
            chunk_size: file.chunk_size(),
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|e| AgentError::Protocol(format!("failed to encode init_upload: {e}")))?;

        let auth = self.auth_header()?;
        let request = Request::new("POST", format!("{API_PREFIX}/upload/init"))
            .header(auth.0, auth.1)
            .header("Content-Type", "application/json")
            .body(body);

        let response = self.http.send(&request).await?;
        let parsed = parse_json_response::<InitUploadResponse>(response)?;
        Ok(parsed.upload_key)
    }

    /// Uploads one part of a file's content. Sends the part's byte range
    /// and SHA-256 as headers, in addition to the whole-file SHA-256 sent
    /// at `init_upload`; the server uses whichever it needs.
    pub async fn upload_file_part(
        &mut self,
        upload_key: &str,
        file: &BackupFile,
        part_number: u32,
    ) -> AgentResult<()> {
        let range = file.part_range(part_number);
        let bytes = file.chunk(range.offset, range.length).await?;
        let part_sha256 = vessel::hash::sha256_bytes(&bytes);

        let auth = self.auth_header()?;
        let request = Request::new("POST", format!("{API_PREFIX}/upload/part"))
            .header(auth.0, auth.1)
            .header("X-Vessel-Upload-Key", upload_key)
            .header("X-Vessel-Part-Number", part_number.to_string())
            .header("X-Vessel-Part-Offset", range.offset.to_string())
            .header("X-Vessel-Part-Length", range.length.to_string())
            .header("X-Vessel-Part-Sha256", part_sha256.to_hex())
            .body(bytes);

        let response = self.http.send(&request).await?;
        ensure_success(response.status, || "upload_file_part".to_string())?;
        Ok(())
    }

    /// Finalizes an upload. Returns `Ok(())` only when the server reports
    /// successful reassembly.
    pub async fn complete_upload(&mut self, upload_key: &str) -> AgentResult<()> {
        let body = serde_json::to_vec(&serde_json::json!({ "upload_key": upload_key }))
            .map_err(|e| AgentError::Protocol(format!("failed to encode complete_upload: {e}")))?;

        let auth = self.auth_header()?;
        let request = Request::new("POST", format!("{API_PREFIX}/upload/complete"))
            .header(auth.0, auth.1)
            .header("Content-Type", "application/json")
            .body(body);

        let response = self.http.send(&request).await?;
        let parsed = parse_json_response::<CompleteUploadResponse>(response)?;
        if parsed.status != "ok" {
            return Err(AgentError::Protocol(format!(
                "upload reassembly failed: {}",
                parsed.status
            )));
        }
        Ok(())
    }
}

fn ensure_success(status: u16, context: impl FnOnce() -> String) -> AgentResult<()> {
    if (200..300).contains(&status) {
        return Ok(());
    }
    let message = context();
    if (500..600).contains(&status) || status == 408 || status == 429 {
        Err(AgentError::Server { status, message })
    } else {
        Err(AgentError::Client { status, message })
    }
}

fn parse_json_response<T: serde::de::DeserializeOwned>(
    response: crate::http::Response,
) -> AgentResult<T> {
    ensure_success(response.status, || {
        String::from_utf8_lossy(&response.body).into_owned()
    })?;
    serde_json::from_slice(&response.body)
        .map_err(|e| AgentError::Protocol(format!("malformed response body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_success_classifies_server_vs_client_errors() {
        assert!(ensure_success(200, || String::new()).is_ok());
        assert!(matches!(
            ensure_success(503, || String::new()),
            Err(AgentError::Server { status: 503, .. })
        ));
        assert!(matches!(
            ensure_success(429, || String::new()),
            Err(AgentError::Server { status: 429, .. })
        ));
        assert!(matches!(
            ensure_success(404, || String::new()),
            Err(AgentError::Client { status: 404, .. })
        ));
    }

    #[test]
    fn test_auth_header_requires_token() {
        let http = HttpClient::new("https://example.com").unwrap();
        let client = ControlClient::new(http, "test");
        assert!(client.auth_header().is_err());
    }

    /// S5: among enabled providers `p1`/`p2` and disabled `p3`,
    /// `get_storage_provider` returns the highest-priority enabled one.
    #[test]
    fn test_get_storage_provider_delegates_to_store() {
        let store = vessel::store::LocalStore::open_in_memory().unwrap();
        store
            .upsert_provider(&vessel::store::ProviderRecord {
                id: "p1".into(),
                provider_type: "s3".into(),
                priority: 10,
                endpoint: "https://p1".into(),
                credentials: String::new(),
                enabled: true,
            })
            .unwrap();
        store
            .upsert_provider(&vessel::store::ProviderRecord {
                id: "p2".into(),
                provider_type: "s3".into(),
                priority: 5,
                endpoint: "https://p2".into(),
                credentials: String::new(),
                enabled: true,
            })
            .unwrap();
        store
            .upsert_provider(&vessel::store::ProviderRecord {
                id: "p3".into(),
                provider_type: "azure".into(),
                priority: 1,
                endpoint: "https://p3".into(),
                credentials: String::new(),
                enabled: false,
            })
            .unwrap();

        let http = HttpClient::new("https://example.com").unwrap();
        let client = ControlClient::new(http, "test");
        let chosen = client.get_storage_provider(&store).unwrap().unwrap();
        assert_eq!(chosen.id, "p2");
    }

    #[test]
    fn test_auth_header_formats_bearer() {
        let http = HttpClient::new("https://example.com").unwrap();
        let mut client = ControlClient::new(http, "test");
        client.refresh_client_token(Some("tok-123".to_string()));
        let (name, value) = client.auth_header().unwrap();
        assert_eq!(name, "Authorization");
        assert_eq!(value, "Bearer tok-123");
    }

    /// S6 enrollment, against a fake control plane over loopback: a fresh
    /// client installs and receives a usable token.
    #[tokio::test]
    async fn test_install_client_over_loopback() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]);
            assert!(request.starts_with("POST /v1/install HTTP/1.1\r\n"));
            assert!(request.contains("\"deployment_key\":\"dk-xyz\""));

            let body = r#"{"client_token":"tok-abc","user_id":"user-1"}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let http = HttpClient::new(&format!("http://{addr}")).unwrap();
        let mut client = ControlClient::new(http, "test-agent/1.0");
        let (token, user_id) = client
            .install_client("dk-xyz", "test-host", "linux")
            .await
            .unwrap();

        assert_eq!(token, "tok-abc");
        assert_eq!(user_id, "user-1");

        server.await.unwrap();
    }
}
