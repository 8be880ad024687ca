//! Rollback executors shipped with rollguard.
//!
//! `WebhookRollback` asks the deployment pipeline to redeploy an earlier
//! revision by POSTing JSON to a plain-HTTP endpoint. The request body is
//! `{"application_id": ..., "target_deployment_id": ...}`; any 2xx answer
//! counts as success.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, StatusCode, Uri};
use http_body_util::Full;
use tracing::{debug, info};

use crate::collaborators::{BoxFuture, RollbackError, RollbackExecutor};

/// Rollback executor backed by an HTTP webhook.
pub struct WebhookRollback {
    endpoint: Uri,
    timeout: Duration,
    /// `(application_id, target)` pairs already rolled back.
    completed: Mutex<HashSet<(String, String)>>,
}

impl WebhookRollback {
    /// Create an executor for an `http://host[:port]/path` endpoint.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RollbackError> {
        let endpoint: Uri = url
            .parse()
            .map_err(|e: http::uri::InvalidUri| RollbackError::InvalidEndpoint(e.to_string()))?;
        if endpoint.scheme_str() != Some("http") || endpoint.authority().is_none() {
            return Err(RollbackError::InvalidEndpoint(format!(
                "{url}: expected http://host[:port]/path"
            )));
        }
        Ok(Self {
            endpoint,
            timeout,
            completed: Mutex::new(HashSet::new()),
        })
    }

    fn already_done(&self, key: &(String, String)) -> bool {
        self.completed
            .lock()
            .map(|done| done.contains(key))
            .unwrap_or(false)
    }

    fn mark_done(&self, key: (String, String)) {
        if let Ok(mut done) = self.completed.lock() {
            done.insert(key);
        }
    }

    async fn post(&self, body: Vec<u8>) -> Result<StatusCode, RollbackError> {
        let authority = self
            .endpoint
            .authority()
            .ok_or_else(|| RollbackError::InvalidEndpoint(self.endpoint.to_string()))?;
        let address = match authority.port_u16() {
            Some(_) => authority.as_str().to_string(),
            None => format!("{}:80", authority.host()),
        };
        let path = self
            .endpoint
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");

        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| RollbackError::Request(e.to_string()))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| RollbackError::Request(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "rollback webhook connection closed");
            }
        });

        let req = http::Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(HOST, authority.as_str())
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, "rollguard/0.1")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| RollbackError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| RollbackError::Request(e.to_string()))?;
        Ok(resp.status())
    }
}

impl RollbackExecutor for WebhookRollback {
    fn rollback<'a>(
        &'a self,
        application_id: &'a str,
        target_deployment_id: &'a str,
    ) -> BoxFuture<'a, Result<(), RollbackError>> {
        Box::pin(async move {
            let key = (application_id.to_string(), target_deployment_id.to_string());
            if self.already_done(&key) {
                debug!(%application_id, target = %target_deployment_id, "rollback already performed");
                return Ok(());
            }

            let body = serde_json::json!({
                "application_id": application_id,
                "target_deployment_id": target_deployment_id,
            });
            let body = serde_json::to_vec(&body).map_err(|e| RollbackError::Request(e.to_string()))?;

            let status = tokio::time::timeout(self.timeout, self.post(body))
                .await
                .map_err(|_| RollbackError::Timeout)??;
            if !status.is_success() {
                return Err(RollbackError::Rejected(status.as_u16()));
            }

            info!(%application_id, target = %target_deployment_id, "rollback requested");
            self.mark_done(key);
            Ok(())
        })
    }
}

/// Executor used when no webhook is configured; every attempt fails so the
/// failure surfaces as a critical notification.
#[derive(Debug, Default)]
pub struct UnconfiguredRollback;

impl RollbackExecutor for UnconfiguredRollback {
    fn rollback<'a>(
        &'a self,
        _application_id: &'a str,
        _target_deployment_id: &'a str,
    ) -> BoxFuture<'a, Result<(), RollbackError>> {
        Box::pin(async { Err(RollbackError::NotConfigured) })
    }
}
