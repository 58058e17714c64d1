//! Progress notifications for long-running request handlers.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::{NotificationOptions, Protocol};
use crate::types::{McpResult, ProgressNotification, ProgressParams, ProgressToken, RequestId};

/// Sends `notifications/progress` for the token a caller attached to its
/// request.
///
/// Obtained from [`RequestHandlerExtra::progress_reporter`]; every update is
/// tied to the originating request.
///
/// [`RequestHandlerExtra::progress_reporter`]: crate::protocol::RequestHandlerExtra::progress_reporter
#[derive(Clone)]
pub struct ProgressReporter {
    protocol: Protocol,
    token: ProgressToken,
    request_id: RequestId,
    last: Arc<Mutex<Option<f64>>>,
}

impl ProgressReporter {
    pub fn new(protocol: Protocol, token: ProgressToken, request_id: RequestId) -> Self {
        Self {
            protocol,
            token,
            request_id,
            last: Arc::new(Mutex::new(None)),
        }
    }

    pub fn token(&self) -> &ProgressToken {
        &self.token
    }

    /// Report progress. Values should increase with every call.
    pub async fn report(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> McpResult<()> {
        {
            let mut last = self.last.lock();
            if last.is_some_and(|previous| progress <= previous) {
                tracing::debug!(
                    "Progress for request {} did not increase ({progress})",
                    self.request_id
                );
            }
            *last = Some(progress);
        }

        let params = ProgressParams {
            progress_token: self.token.clone(),
            progress,
            total,
            message,
        };
        self.protocol
            .notification::<ProgressNotification>(
                params,
                NotificationOptions {
                    related_request_id: Some(self.request_id.clone()),
                },
            )
            .await
    }

    /// The last value reported.
    pub fn last_progress(&self) -> Option<f64> {
        *self.last.lock()
    }
}
