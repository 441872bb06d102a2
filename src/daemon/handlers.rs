//! Request routing - maps IPC methods onto the control plane.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::agents::{AgentFilter, SpecialKey};
use super::control::ControlPlane;
use crate::error::{LoopdError, Result};
use crate::ipc::messages::{DaemonError, DaemonRequest, DaemonResponse, Methods};
use crate::ipc::server::RequestHandler;

#[derive(Debug, Deserialize)]
struct SendInputParams {
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    special_keys: Vec<SpecialKey>,
}

#[derive(Debug, Deserialize)]
struct AgentParams {
    agent_id: String,
}

#[derive(Debug, Deserialize)]
struct LoopParams {
    loop_id: String,
}

fn params<T: DeserializeOwned>(value: &Value) -> Result<T> {
    let value = match value {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(value).map_err(|e| LoopdError::InvalidArgument(format!("invalid params: {e}")))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Routes daemon requests to [`ControlPlane`] operations.
pub struct DaemonHandler {
    control: ControlPlane,
}

impl DaemonHandler {
    pub fn new(control: ControlPlane) -> Self {
        Self { control }
    }

    async fn dispatch(&self, method: &str, raw: &Value) -> Option<Result<Value>> {
        let result = match method {
            Methods::PING => to_value(self.control.ping()),
            Methods::STATUS_GET => to_value(self.control.get_status().await),
            Methods::AGENT_SEND_INPUT => match params::<SendInputParams>(raw) {
                Ok(p) => match self.control.send_input(&p.agent_id, &p.text, &p.special_keys).await {
                    Ok(ack) => to_value(ack),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            },
            Methods::AGENT_LIST => match params::<AgentFilter>(raw) {
                Ok(filter) => to_value(self.control.list_agents(&filter).await),
                Err(e) => Err(e),
            },
            Methods::AGENT_GET => match params::<AgentParams>(raw) {
                Ok(p) => self.control.get_agent(&p.agent_id).await.and_then(to_value),
                Err(e) => Err(e),
            },
            Methods::RUNNER_START => match params::<LoopParams>(raw) {
                Ok(p) => self.control.start_loop_runner(&p.loop_id).await.and_then(to_value),
                Err(e) => Err(e),
            },
            Methods::RUNNER_STOP => match params::<LoopParams>(raw) {
                Ok(p) => to_value(self.control.stop_loop_runner(&p.loop_id).await),
                Err(e) => Err(e),
            },
            _ => return None,
        };
        Some(result)
    }
}

impl RequestHandler for DaemonHandler {
    fn handle(&self, request: DaemonRequest) -> impl std::future::Future<Output = DaemonResponse> + Send {
        async move {
            match self.dispatch(&request.method, &request.params).await {
                Some(result) => DaemonResponse::from_result(request.id, result),
                None => DaemonResponse::error(request.id, DaemonError::method_not_found(&request.method)),
            }
        }
    }
}
