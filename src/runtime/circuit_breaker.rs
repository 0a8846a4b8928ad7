use std::collections::{HashSet, VecDeque};
use tracing::warn;

/// Loop detection over recent tool invocations.
///
/// A sliding window of `(toolName, canonicalArgsHash)` pairs; when one pair
/// repeats more than `threshold` times within the window (and the tool is
/// not exempt), the breaker trips and further identical calls return
/// `CIRCUIT_OPEN` until non-repeating progress resets it.
pub struct LoopBreaker {
    window: VecDeque<(String, String)>,
    window_size: usize,
    threshold: usize,
    exempt: HashSet<String>,
    tripped: HashSet<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Proceed,
    /// This invocation tripped the breaker; it must not be dispatched and a
    /// reflection turn is forced.
    JustTripped,
    /// The breaker was already open for this pair.
    CircuitOpen,
}

impl LoopBreaker {
    pub fn new(threshold: usize, window_size: usize, exempt: impl IntoIterator<Item = String>) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            threshold: threshold.max(1),
            exempt: exempt.into_iter().collect(),
            tripped: HashSet::new(),
        }
    }

    /// Record an invocation attempt and decide whether it may proceed.
    pub fn check(&mut self, tool: &str, args_hash: &str) -> BreakerDecision {
        if self.exempt.contains(tool) {
            return BreakerDecision::Proceed;
        }
        let pair = (tool.to_string(), args_hash.to_string());

        if self.tripped.contains(&pair) {
            return BreakerDecision::CircuitOpen;
        }

        self.window.push_back(pair.clone());
        if self.window.len() > self.window_size {
            self.window.pop_front();
        }

        let repeats = self.window.iter().filter(|p| **p == pair).count();
        if repeats > self.threshold {
            warn!(
                "loop breaker tripped for '{}' after {} identical calls",
                tool, repeats
            );
            self.tripped.insert(pair);
            return BreakerDecision::JustTripped;
        }

        // Non-repeating progress: a different pair clears earlier trips.
        if repeats == 1 && !self.tripped.is_empty() {
            self.tripped.clear();
        }
        BreakerDecision::Proceed
    }

    pub fn is_open(&self, tool: &str, args_hash: &str) -> bool {
        self.tripped
            .contains(&(tool.to_string(), args_hash.to_string()))
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.tripped.clear();
    }
}
