//! BridgeService: transport-agnostic entry point for MCP calls.
//!
//! Owns the supervisor and turns one caller request into one child exchange:
//! normalize the method, make sure the handshake is done, forward, and hand
//! back the child's response under the caller's id.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::bridge::protocol::{ChildId, RpcRequest, result_response};
use crate::config::{BridgeConfig, Secret};
use crate::error::BridgeError;
use crate::handshake::{INITIALIZE, INITIALIZED_NOTIFICATION};
use crate::health::HealthResponse;
use crate::normalize::{CanonicalMethod, normalize};
use crate::spawner::ChildSpawner;
use crate::supervisor::Supervisor;
use crate::version::VersionInfo;

const NOTIFICATION_PREFIX: &str = "notifications/";

/// What a caller gets back.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// The child's JSON-RPC response, carrying the caller's id.
    Response(Value),
    /// A notification was accepted; there is no response body.
    Accepted,
}

pub struct BridgeService {
    supervisor: Arc<Supervisor>,
}

impl BridgeService {
    pub fn new(config: BridgeConfig, spawner: Arc<dyn ChildSpawner>) -> Self {
        Self {
            supervisor: Supervisor::new(config, spawner),
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn config(&self) -> &BridgeConfig {
        self.supervisor.config()
    }

    /// Spawn the child and run the first handshake in the background.
    ///
    /// A failed first spawn is not fatal: the restart policy takes over and
    /// `/health` reports the outcome.
    pub fn start(&self) {
        match self.supervisor.start() {
            Ok(child) => {
                let supervisor = Arc::clone(&self.supervisor);
                tokio::spawn(async move {
                    if let Err(e) = supervisor.ensure_ready().await {
                        tracing::warn!(%child, error = %e, "Initial handshake failed");
                    }
                });
            }
            Err(e) => tracing::error!(error = %e, "Initial child spawn failed"),
        }
    }

    pub async fn call(
        &self,
        request: RpcRequest,
        credential: Option<Secret>,
    ) -> Result<CallOutcome, BridgeError> {
        let RpcRequest {
            method, params, id, ..
        } = request;

        if method.starts_with(NOTIFICATION_PREFIX) {
            return self.forward_notification(&method, params).await;
        }

        if method == INITIALIZE {
            self.supervisor.ensure_ready().await?;
            let result = self.supervisor.handshake().initialize_result().ok_or_else(|| {
                BridgeError::Handshake("child restarted during initialize".to_string())
            })?;
            return Ok(CallOutcome::Response(result_response(id.as_ref(), result)));
        }

        let (method, mut params) = normalize(&method, params);
        if let Some(credential) = credential.as_ref()
            && CanonicalMethod::from_alias(&method) == Some(CanonicalMethod::ToolsCall)
        {
            attach_credential(&mut params, credential);
        }

        let child = self.supervisor.ensure_ready().await?;
        tracing::debug!(%child, method = %method, caller_id = ?id, "Forwarding request");
        let mut response = self.supervisor.send_to(child, &method, Some(params)).await?;

        if let Some(object) = response.as_object_mut() {
            object.insert("id".to_string(), json!(id));
        }
        Ok(CallOutcome::Response(response))
    }

    async fn forward_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<CallOutcome, BridgeError> {
        if method == INITIALIZED_NOTIFICATION {
            tracing::debug!("Swallowing caller's initialized notification");
            return Ok(CallOutcome::Accepted);
        }
        let child: ChildId = self.supervisor.ensure_ready().await?;
        self.supervisor.notify_to(child, method, params).await?;
        Ok(CallOutcome::Accepted)
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse::from_status(
            self.supervisor.status(),
            VersionInfo::new(self.config().protocol_version.clone()),
        )
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}

/// Put a per-request credential where the child's tool implementation finds it.
fn attach_credential(params: &mut Value, credential: &Secret) {
    let Some(object) = params.as_object_mut() else {
        tracing::debug!("tools/call params are not an object, credential not attached");
        return;
    };
    let meta = object
        .entry("_meta")
        .or_insert_with(|| Value::Object(Default::default()));
    if let Some(meta) = meta.as_object_mut() {
        meta.insert(
            "credential".to_string(),
            Value::String(credential.expose().to_string()),
        );
    }
}
