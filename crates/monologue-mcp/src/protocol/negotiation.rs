//! MCP protocol version negotiation during initialization.

use crate::types::{LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};

/// Pick the protocol version to answer an `initialize` request with.
///
/// The client's requested version is echoed when supported; otherwise the
/// latest supported version is offered.
pub fn negotiate_version(requested: &str) -> &'static str {
    match SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|supported| **supported == requested)
    {
        Some(version) => version,
        None => {
            tracing::warn!(
                "Client requested protocol version {requested}, which is not supported. \
                 Offering {LATEST_PROTOCOL_VERSION}."
            );
            LATEST_PROTOCOL_VERSION
        }
    }
}
