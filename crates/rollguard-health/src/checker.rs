//! Health check probe logic.
//!
//! The default health-check executor: probes every reported instance of a
//! deployment over HTTP and folds the answers into one verdict. Restart
//! counts come from the instance reports in the state store.

use std::time::Duration;

use tracing::{debug, warn};

use rollguard_rollout::{BoxFuture, HealthProbe};
use rollguard_state::{HealthStatus, InstanceStatus, StateStore};

/// Probe that checks the instances recorded for a deployment.
#[derive(Clone)]
pub struct InstanceProbe {
    state: StateStore,
    /// HTTP path to probe on each instance (e.g. "/healthz").
    path: String,
    /// Timeout for a single instance probe.
    timeout: Duration,
}

impl InstanceProbe {
    pub fn new(state: StateStore, path: &str, timeout: Duration) -> Self {
        Self {
            state,
            path: path.to_string(),
            timeout,
        }
    }

    async fn probe_deployment(&self, application_id: &str, deployment_id: &str) -> HealthStatus {
        let instances = match self.state.list_instances_for_deployment(application_id, deployment_id) {
            Ok(instances) => instances,
            Err(e) => {
                warn!(%application_id, %deployment_id, error = %e, "failed to load instances");
                return HealthStatus::Unknown;
            }
        };

        let mut results = Vec::with_capacity(instances.len());
        for inst in instances.iter().filter(|i| i.status != InstanceStatus::Stopped) {
            results.push(http_probe(&inst.address, &self.path, self.timeout).await);
        }

        let verdict = aggregate(&results);
        debug!(%application_id, %deployment_id, instances = results.len(), ?verdict, "deployment probed");
        verdict
    }
}

impl HealthProbe for InstanceProbe {
    fn check_health<'a>(
        &'a self,
        application_id: &'a str,
        deployment_id: &'a str,
    ) -> BoxFuture<'a, HealthStatus> {
        Box::pin(self.probe_deployment(application_id, deployment_id))
    }

    fn restart_count<'a>(
        &'a self,
        application_id: &'a str,
        deployment_id: &'a str,
    ) -> BoxFuture<'a, Option<u32>> {
        Box::pin(async move {
            match self.state.restart_count_for_deployment(application_id, deployment_id) {
                Ok(count) => count,
                Err(e) => {
                    warn!(%application_id, %deployment_id, error = %e, "failed to load restart counts");
                    None
                }
            }
        })
    }
}

/// Fold per-instance results into a deployment verdict.
///
/// Any unhealthy instance makes the deployment unhealthy. The deployment is
/// healthy only when every probed instance answered healthy; anything else
/// (no instances, unreachable instances) is unknown.
pub fn aggregate(results: &[HealthStatus]) -> HealthStatus {
    if results.contains(&HealthStatus::Unhealthy) {
        HealthStatus::Unhealthy
    } else if !results.is_empty() && results.iter().all(|r| *r == HealthStatus::Healthy) {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unknown
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Unknown` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> HealthStatus {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return HealthStatus::Unknown;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return HealthStatus::Unknown;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", address)
            .header("user-agent", "rollguard-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "invalid health probe request");
                return HealthStatus::Unknown;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => HealthStatus::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-2xx");
                HealthStatus::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                HealthStatus::Unknown
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "health probe timed out");
        HealthStatus::Unknown
    })
}
