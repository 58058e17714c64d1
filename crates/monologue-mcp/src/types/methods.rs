//! Typed method descriptors binding a method name to its params and result.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::capabilities::{InitializeParams, InitializeResult};
use super::notification::{
    CancelledParams, EmptyParams, LoggingMessageParams, ProgressParams, ResourceUpdatedParams,
};
use super::request::{
    CallToolParams, CreateMessageParams, CreateMessageResult, ElicitParams, ElicitResult,
    EmptyResult, ListParams, ListRootsResult, SetLevelParams,
};
use super::response::{ToolCallResult, ToolListResult};

/// A request method with typed params and result.
pub trait McpRequest {
    const METHOD: &'static str;
    type Params: Serialize + DeserializeOwned + Send + 'static;
    type Result: Serialize + DeserializeOwned + Send + 'static;
}

/// A notification method with typed params.
pub trait McpNotification {
    const METHOD: &'static str;
    type Params: Serialize + DeserializeOwned + Send + 'static;
}

macro_rules! request_method {
    ($(#[$doc:meta])* $name:ident, $method:literal, $params:ty => $result:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl McpRequest for $name {
            const METHOD: &'static str = $method;
            type Params = $params;
            type Result = $result;
        }
    };
}

macro_rules! notification_method {
    ($(#[$doc:meta])* $name:ident, $method:literal, $params:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl McpNotification for $name {
            const METHOD: &'static str = $method;
            type Params = $params;
        }
    };
}

request_method!(
    /// `initialize` handshake.
    Initialize, "initialize", InitializeParams => InitializeResult
);
request_method!(
    /// Liveness check.
    Ping, "ping", EmptyParams => EmptyResult
);
request_method!(SetLevel, "logging/setLevel", SetLevelParams => EmptyResult);
request_method!(ListTools, "tools/list", ListParams => ToolListResult);
request_method!(CallTool, "tools/call", CallToolParams => ToolCallResult);
request_method!(
    /// Ask the client to sample from its LLM.
    CreateMessage, "sampling/createMessage", CreateMessageParams => CreateMessageResult
);
request_method!(Elicit, "elicitation/create", ElicitParams => ElicitResult);
request_method!(ListRoots, "roots/list", EmptyParams => ListRootsResult);

notification_method!(Initialized, "notifications/initialized", EmptyParams);
notification_method!(Cancelled, "notifications/cancelled", CancelledParams);
notification_method!(ProgressNotification, "notifications/progress", ProgressParams);
notification_method!(LoggingMessage, "notifications/message", LoggingMessageParams);
notification_method!(
    ResourceUpdated,
    "notifications/resources/updated",
    ResourceUpdatedParams
);
notification_method!(
    ResourceListChanged,
    "notifications/resources/list_changed",
    EmptyParams
);
notification_method!(ToolListChanged, "notifications/tools/list_changed", EmptyParams);
notification_method!(
    PromptListChanged,
    "notifications/prompts/list_changed",
    EmptyParams
);
notification_method!(
    RootsListChanged,
    "notifications/roots/list_changed",
    EmptyParams
);
