//! Per-request identity, deadline and cancellation.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Transport-level information about the connected client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInfo {
    pub remote_addr: String,
    pub username: String,
}

/// The identity on whose behalf the statement runs, as asserted by the
/// upstream router.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerId {
    pub username: String,
}

impl CallerId {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

/// Context carried by every call into the engine.
#[derive(Clone, Debug, Default)]
pub struct QueryContext {
    pub call_info: Option<CallInfo>,
    pub caller_id: Option<CallerId>,
    pub deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl QueryContext {
    /// A context with no identity, deadline or cancellation.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_call_info(mut self, remote_addr: impl Into<String>, username: impl Into<String>) -> Self {
        self.call_info = Some(CallInfo {
            remote_addr: remote_addr.into(),
            username: username.into(),
        });
        self
    }

    pub fn with_caller_id(mut self, username: impl Into<String>) -> Self {
        self.caller_id = Some(CallerId::new(username));
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Source address reported by the transport, empty when unknown.
    pub fn remote_addr(&self) -> &str {
        self.call_info
            .as_ref()
            .map(|c| c.remote_addr.as_str())
            .unwrap_or("")
    }

    /// Transport-authenticated user, empty when unknown.
    pub fn username(&self) -> &str {
        self.call_info
            .as_ref()
            .map(|c| c.username.as_str())
            .unwrap_or("")
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once the caller cancels.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
