//! Everything between the runtime and the completion service.
//!
//! - [`backend`]: the [`CompletionBackend`] seam, implemented by
//!   [`ChatClient`](crate::ChatClient) for HTTP and by
//!   [`ScriptedBackend`](scripted::ScriptedBackend) for deterministic runs.
//! - [`gateway`]: plan, act, reflect and summarize on top of one retried
//!   completion call.
//! - [`prompts`]: prompt construction and lenient parsing of replies.
//! - [`retry`]: transient error detection with exponential backoff and
//!   jitter. Never retries 400/401 errors.
//! - [`streaming`]: SSE parsing and assembly of streamed responses.
//! - [`pricing`]: per-model pricing and the cumulative [`CostTracker`].

pub mod backend;
pub mod gateway;
pub mod pricing;
pub mod prompts;
pub mod retry;
pub mod scripted;
pub mod streaming;

pub use backend::CompletionBackend;
pub use gateway::{Completion, CompletionGateway, Reply};
pub use pricing::{CompletionUsage, CostTracker, ModelPricing, pricing_for_model};
pub use retry::RetryConfig;
pub use scripted::ScriptedBackend;
