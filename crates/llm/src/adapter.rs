//! The uniform streaming contract every provider adapter implements.

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::messages::NormalizedBody;

/// One increment of adapter output: zero-or-more text bytes plus an
/// optional ordered list of opaque provider image payloads.
#[derive(Debug, Clone, Default)]
pub struct AdapterDelta {
    /// Incremental text. May be empty when only images arrived.
    pub text: String,
    /// Ordered opaque image payloads, if any arrived alongside this delta.
    pub images: Vec<Value>,
}

/// Everything an adapter needs to drive one streaming call.
pub struct DriveInput {
    /// Credential to present to the upstream provider.
    pub api_key: SecretString,
    /// Normalized request body.
    pub body: NormalizedBody,
    /// Cooperative cancellation signal, wired to the transport layer.
    pub cancel: CancellationToken,
    /// Channel the adapter emits deltas into, in arrival order.
    pub on_delta: mpsc::UnboundedSender<AdapterDelta>,
}

impl DriveInput {
    /// Whether the adapter should keep reading. Adapters must poll this
    /// between network reads and abandon the stream promptly once it flips.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

/// A provider-specific streaming driver.
///
/// `drive` emits deltas via `input.on_delta` in arrival order and returns
/// `Ok(())` on a normal end of stream. Any failure is surfaced as `Err` with
/// a human-readable message; cancellation initiated by `input.cancel` must
/// not be reported as an error (the coordinator distinguishes the two by
/// its own phase, not by inspecting the error).
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Drive one streaming call to completion, to cancellation, or to failure.
    async fn drive(&self, input: DriveInput) -> anyhow::Result<()>;
}
