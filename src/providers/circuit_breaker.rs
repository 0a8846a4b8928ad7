use crate::config::ProviderBreakerConfig;
use crate::providers::base::{InferenceRequest, InferenceResponse, LlmProvider};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    /// In-flight probe requests in `HalfOpen` state. Prevents concurrent
    /// requests from all passing through before any failure is recorded.
    active_probes: u32,
}

/// Per-endpoint circuit breaker wrapping any [`LlmProvider`].
/// Closed → Open after `failure_threshold` consecutive transient failures,
/// Open → HalfOpen after `recovery_timeout_secs`, HalfOpen → Closed after
/// `half_open_probes` successful probes.
pub struct CircuitBreakerProvider {
    inner: Arc<dyn LlmProvider>,
    breaker: Mutex<BreakerState>,
    config: ProviderBreakerConfig,
}

impl CircuitBreakerProvider {
    pub fn wrap(inner: Arc<dyn LlmProvider>, config: &ProviderBreakerConfig) -> Arc<dyn LlmProvider> {
        Arc::new(Self {
            inner,
            breaker: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                active_probes: 0,
            }),
            config: config.clone(),
        })
    }

    async fn should_allow(&self) -> anyhow::Result<()> {
        let mut breaker = self.breaker.lock().await;
        match &breaker.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen { successes } => {
                if breaker.active_probes + successes >= self.config.half_open_probes {
                    anyhow::bail!(
                        "circuit breaker is half-open with {} active probe(s), waiting for results",
                        breaker.active_probes
                    );
                }
                breaker.active_probes += 1;
                Ok(())
            }
            CircuitState::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed.as_secs() >= self.config.recovery_timeout_secs {
                    info!(
                        "provider breaker transitioning Open -> HalfOpen after {}s",
                        elapsed.as_secs()
                    );
                    breaker.state = CircuitState::HalfOpen { successes: 0 };
                    breaker.active_probes = 1;
                    Ok(())
                } else {
                    anyhow::bail!(
                        "circuit breaker is open ({}s remaining), provider appears to be down",
                        self.config.recovery_timeout_secs - elapsed.as_secs()
                    )
                }
            }
        }
    }

    async fn record_success(&self) {
        let mut breaker = self.breaker.lock().await;
        breaker.consecutive_failures = 0;
        if let CircuitState::HalfOpen { successes } = breaker.state {
            breaker.active_probes = breaker.active_probes.saturating_sub(1);
            let new_successes = successes + 1;
            if new_successes >= self.config.half_open_probes {
                info!(
                    "provider breaker transitioning HalfOpen -> Closed after {} successful probes",
                    new_successes
                );
                breaker.state = CircuitState::Closed;
                breaker.active_probes = 0;
            } else {
                breaker.state = CircuitState::HalfOpen {
                    successes: new_successes,
                };
            }
        }
    }

    async fn record_failure(&self, is_transient: bool) {
        if !is_transient {
            return;
        }
        let mut breaker = self.breaker.lock().await;
        breaker.consecutive_failures += 1;
        let failures = breaker.consecutive_failures;

        match &breaker.state {
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold {
                    warn!(
                        "provider breaker tripped after {} consecutive failures: Closed -> Open",
                        failures
                    );
                    breaker.state = CircuitState::Open {
                        since: Instant::now(),
                    };
                }
            }
            CircuitState::HalfOpen { .. } => {
                breaker.active_probes = breaker.active_probes.saturating_sub(1);
                warn!("provider breaker probe failed: HalfOpen -> Open");
                breaker.state = CircuitState::Open {
                    since: Instant::now(),
                };
                breaker.active_probes = 0;
            }
            CircuitState::Open { .. } => {}
        }
    }
}

#[async_trait]
impl LlmProvider for CircuitBreakerProvider {
    async fn infer(&self, request: InferenceRequest) -> anyhow::Result<InferenceResponse> {
        self.should_allow().await?;

        match self.inner.infer(request).await {
            Ok(response) => {
                self.record_success().await;
                Ok(response)
            }
            Err(e) => {
                let transient = e
                    .downcast_ref::<crate::errors::MxfError>()
                    .is_none_or(crate::errors::MxfError::is_retryable);
                self.record_failure(transient).await;
                Err(e)
            }
        }
    }

    fn default_model(&self) -> &str {
        self.inner.default_model()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
