pub mod base;
pub mod circuit_breaker;
pub mod http;

pub use base::{
    InferenceParams, InferenceRequest, InferenceResponse, LlmProvider, RetryConfig, TokenUsage,
    ToolDefinition,
};
pub use circuit_breaker::CircuitBreakerProvider;
pub use http::HttpProvider;
