//! The completion primitive the gateway is built on.
//!
//! A [`CompletionBackend`] answers one [`CompletionRequest`]. The HTTP
//! [`ChatClient`] is the production implementation;
//! [`ScriptedBackend`](super::scripted::ScriptedBackend) replays canned
//! responses for tests.

use std::future::Future;
use std::pin::Pin;

use crate::api::streaming::{StreamEvent, events_from_response};
use crate::error::GatewayError;
use crate::{ChatClient, CompletionRequest, CompletionResponse};

/// Boxed future returned by [`CompletionBackend::complete`].
pub type CompletionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CompletionResponse, GatewayError>> + Send + 'a>>;

/// Boxed future returned by [`CompletionBackend::complete_stream`].
pub type StreamFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<StreamEvent>, GatewayError>> + Send + 'a>>;

/// A language-completion service.
///
/// Implementations must classify failures: [`GatewayError::Transient`] is
/// retried by the gateway, everything else is not.
pub trait CompletionBackend: Send + Sync {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> CompletionFuture<'a>;

    /// Streamed variant. Backends without native streaming get a synthetic
    /// event sequence built from [`complete`](Self::complete).
    fn complete_stream<'a>(&'a self, request: &'a CompletionRequest) -> StreamFuture<'a> {
        Box::pin(async move {
            let response = self.complete(request).await?;
            Ok(events_from_response(&response))
        })
    }

    /// Short name for logs.
    fn name(&self) -> &str {
        "backend"
    }
}

/// Map a [`ChatClient`] error string onto the gateway taxonomy.
fn classify(message: String) -> GatewayError {
    if message.starts_with("failed to parse response") {
        GatewayError::Malformed(message)
    } else {
        GatewayError::from_message(message)
    }
}

impl CompletionBackend for ChatClient {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> CompletionFuture<'a> {
        Box::pin(async move { self.chat(request).await.map_err(classify) })
    }

    fn complete_stream<'a>(&'a self, request: &'a CompletionRequest) -> StreamFuture<'a> {
        Box::pin(async move { self.chat_stream(request).await.map_err(classify) })
    }

    fn name(&self) -> &str {
        &self.base_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UsageInfo;
    use crate::api::streaming::assemble;

    struct Fixed;

    impl CompletionBackend for Fixed {
        fn complete<'a>(&'a self, _request: &'a CompletionRequest) -> CompletionFuture<'a> {
            Box::pin(async { Ok(CompletionResponse::text("hello", UsageInfo::new(3, 1))) })
        }
    }

    #[tokio::test]
    async fn default_stream_replays_complete() {
        let events = Fixed
            .complete_stream(&CompletionRequest::default())
            .await
            .unwrap();
        assert_eq!(events.first(), Some(&StreamEvent::TextDelta("hello".into())));
        assert_eq!(events.last(), Some(&StreamEvent::Done));
        let response = assemble(&events).unwrap();
        assert_eq!(response.content.as_deref(), Some("hello"));
        assert_eq!(response.usage, Some(UsageInfo::new(3, 1)));
    }

    #[test]
    fn client_errors_are_classified() {
        assert!(matches!(
            classify("failed to parse response: eof".into()),
            GatewayError::Malformed(_)
        ));
        assert!(classify("API HTTP 502 Bad Gateway: x".into()).is_transient());
        assert!(matches!(
            classify("API HTTP 401 Unauthorized: x".into()),
            GatewayError::Permanent(_)
        ));
    }
}
