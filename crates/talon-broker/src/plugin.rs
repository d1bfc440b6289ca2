use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use talon_core::types::{PluginCapability, ToolCall, ToolResult};
use talon_protocol::handshake::SocketNetwork;
use talon_protocol::plugin::{PluginRequest, PluginResponse};
use talon_protocol::{read_frame, write_frame};
use talon_tools::Executor;

use crate::error::{BrokerError, Result};
use crate::net::{self, BoxedStream};

/// RPC client for one plugin connection. Implements the [`Executor`]
/// contract: RPCs are fully serialized per connection (strict
/// request/response on the wire), and a cancelled caller observes a
/// synthetic error result rather than a torn frame.
pub struct PluginClient {
    conn: Mutex<BoxedStream>,
    caps: PluginCapability,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PluginClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginClient").field("caps", &self.caps).finish_non_exhaustive()
    }
}

impl PluginClient {
    /// Connect, fetch capabilities, and cache them. A response without
    /// `caps` is a protocol mismatch and fails the dial.
    pub async fn dial(
        network: SocketNetwork,
        address: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let mut stream = net::dial(network, address, timeout).await?;

        write_frame(&mut stream, &PluginRequest::capabilities()).await?;
        let resp: PluginResponse = read_frame(&mut stream).await?;
        let caps = resp.caps.ok_or(BrokerError::EmptyCapabilities)?;

        debug!(plugin = %caps.name, actions = caps.actions.len(), %network, address, "plugin dialed");

        Ok(Self {
            conn: Mutex::new(stream),
            caps,
            cancel: CancellationToken::new(),
        })
    }

    pub fn capability(&self) -> &PluginCapability {
        &self.caps
    }

    pub fn name(&self) -> &str {
        &self.caps.name
    }

    /// Cancel any in-flight call and close the connection.
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut conn = self.conn.lock().await;
        let _ = conn.shutdown().await;
    }

    async fn execute_rpc(&self, call: &ToolCall) -> ToolResult {
        // One lock for the whole round trip keeps the wire strictly
        // request/response.
        let mut conn = self.conn.lock().await;

        if let Err(e) = write_frame(&mut *conn, &PluginRequest::execute(call)).await {
            return ToolResult::failure(&call.id, e.to_string());
        }

        tokio::select! {
            resp = read_frame::<_, PluginResponse>(&mut *conn) => match resp {
                Ok(resp) => resp.into_tool_result(&call.id),
                Err(e) => {
                    warn!(plugin = %self.caps.name, error = %e, "plugin response read failed");
                    ToolResult::failure(&call.id, e.to_string())
                }
            },
            _ = self.cancel.cancelled() => {
                ToolResult::failure(&call.id, "operation cancelled")
            }
        }
    }
}

#[async_trait]
impl Executor for PluginClient {
    async fn execute(&self, call: &ToolCall) -> ToolResult {
        self.execute_rpc(call).await
    }
}
