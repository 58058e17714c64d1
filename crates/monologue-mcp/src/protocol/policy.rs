//! Capability gates consulted by the engine before traffic leaves or
//! handlers are installed.

use crate::types::McpResult;

/// Decides which methods a peer may use, based on declared capabilities.
///
/// Every check is synchronous and fails locally before anything reaches the
/// wire.
pub trait CapabilityPolicy: Send + Sync {
    /// Outbound request: does the remote side support `method`?
    fn assert_capability_for_method(&self, method: &str) -> McpResult<()>;

    /// Outbound notification: do our own capabilities allow emitting `method`?
    fn assert_notification_capability(&self, method: &str) -> McpResult<()>;

    /// Handler registration: do our own capabilities allow serving `method`?
    fn assert_request_handler_capability(&self, method: &str) -> McpResult<()>;
}

/// Allows everything. Used by bare engines that do not negotiate.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissivePolicy;

impl CapabilityPolicy for PermissivePolicy {
    fn assert_capability_for_method(&self, _method: &str) -> McpResult<()> {
        Ok(())
    }

    fn assert_notification_capability(&self, _method: &str) -> McpResult<()> {
        Ok(())
    }

    fn assert_request_handler_capability(&self, _method: &str) -> McpResult<()> {
        Ok(())
    }
}
