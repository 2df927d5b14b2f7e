//! Engine-side subscriber: applies pushed snapshots to the kernel and
//! answers each push with an ACK or a NACK.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chainward_core::error::{EngineError, Result};
use chainward_core::protocol::discovery::{DiscoveryRequest, DiscoveryResponse, ROUTE_CHAIN_TYPE_URL};

use crate::kernel::Kernel;

pub struct ConfigSubscriber {
    kernel: Arc<Kernel>,
    subscription: DiscoveryRequest,
    accepted_version: String,
}

impl ConfigSubscriber {
    pub fn new(kernel: Arc<Kernel>, node_id: impl Into<String>, resource_names: Vec<String>) -> Self {
        Self {
            kernel,
            subscription: DiscoveryRequest::subscribe(node_id, resource_names),
            accepted_version: String::new(),
        }
    }

    /// Last version applied to the kernel (empty before the first ACK).
    pub fn accepted_version(&self) -> &str {
        &self.accepted_version
    }

    /// Apply one push and build the answer for it.
    ///
    /// A rejected push leaves the kernel's route table untouched and keeps
    /// the previously accepted version.
    pub fn handle_push(&mut self, push: &DiscoveryResponse) -> DiscoveryRequest {
        let metrics = self.kernel.metrics().clone();
        match self.apply(push) {
            Ok(()) => {
                self.accepted_version = push.version_info.clone();
                metrics.config_updates.inc(&[("result", "ack")]);
                tracing::info!(
                    version = %push.version_info,
                    routes = push.resources.len(),
                    "configuration accepted"
                );
                self.subscription.ack(push)
            }
            Err(e) => {
                metrics.config_updates.inc(&[("result", "nack")]);
                tracing::warn!(
                    version = %push.version_info,
                    kept = %self.accepted_version,
                    code = e.code().as_str(),
                    error = %e,
                    "configuration rejected"
                );
                self.subscription.nack(push, &self.accepted_version, &e)
            }
        }
    }

    fn apply(&self, push: &DiscoveryResponse) -> Result<()> {
        if !push.type_url.is_empty() && push.type_url != ROUTE_CHAIN_TYPE_URL {
            return Err(EngineError::InvalidConfig(format!(
                "unexpected resource type `{}`",
                push.type_url
            )));
        }
        if let Some(stray) = push.resources.iter().find(|r| !self.subscription.wants(&r.route_key)) {
            return Err(EngineError::InvalidConfig(format!(
                "pushed route `{}` was not subscribed",
                stray.route_key
            )));
        }
        self.kernel.apply_snapshot(&push.version_info, &push.resources)
    }

    /// Drive the subscription until the server side closes or `cancel` fires.
    pub async fn run(
        mut self,
        requests: mpsc::Sender<DiscoveryRequest>,
        mut pushes: mpsc::Receiver<DiscoveryResponse>,
        cancel: CancellationToken,
    ) -> Result<()> {
        requests
            .send(self.subscription.clone())
            .await
            .map_err(|_| EngineError::Internal("distribution stream closed".into()))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                push = pushes.recv() => {
                    let Some(push) = push else { break; };
                    let answer = self.handle_push(&push);
                    if requests.send(answer).await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!(accepted = %self.accepted_version, "subscriber stopped");
        Ok(())
    }
}
