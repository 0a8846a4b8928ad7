use crate::conversation::{ConversationHistory, ConversationMessage, Role};
use crate::providers::base::{InferenceParams, InferenceRequest, LlmProvider};
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, warn};

const COMPACTION_PROMPT: &str = "Summarize this conversation history concisely while preserving:\n1. Key decisions made and their reasoning\n2. Tool calls issued and what their results established\n3. Task state, assignments, and progress\n4. Facts, names, and values other agents referenced\n\nPrevious summary (if any):\n{previous_summary}\n\nMessages to summarize:\n{messages}\n\nWrite a concise summary (max 500 words) that captures the essential context. Do not include preamble - just the summary.";

const COMPACTION_MAX_TOKENS: u32 = 2000;
const COMPACTION_TEMPERATURE: f32 = 0.3;
const CHARS_PER_TOKEN_ESTIMATE: usize = 4;

/// Default number of uncompressed messages kept verbatim at the tail.
pub const DEFAULT_KEEP_LAST: usize = 5;

pub fn estimate_tokens(text: &str) -> usize {
    // Char count rather than byte count for better accuracy with non-ASCII text.
    text.chars().count() / CHARS_PER_TOKEN_ESTIMATE
}

pub fn estimate_history_tokens(history: &ConversationHistory) -> usize {
    history
        .messages()
        .iter()
        .map(|m| estimate_tokens(&m.content))
        .sum()
}

/// Compacts a conversation by replacing everything before the last
/// `keep_last` messages with a single summary block (`role=system`,
/// `contextSummary=true`).
///
/// Tool-call/tool-result pairs are compacted together or not at all: if the
/// cut would land inside a result run, it moves back to the issuing assistant
/// message so the whole group stays in the kept region.
pub struct Compactor {
    provider: Arc<dyn LlmProvider>,
    model: Option<String>,
    keep_last: usize,
}

impl Compactor {
    pub fn new(provider: Arc<dyn LlmProvider>, model: Option<String>, keep_last: usize) -> Self {
        Self {
            provider,
            model,
            keep_last,
        }
    }

    /// Index of the first kept message, adjusted for pair atomicity.
    fn cut_index(messages: &[ConversationMessage], keep_last: usize) -> usize {
        if messages.len() <= keep_last {
            return 0;
        }
        let mut cut = messages.len() - keep_last;
        // A tool result at the boundary drags its issuing assistant message
        // (and any sibling results) into the kept region.
        while cut > 0 && messages[cut].role == Role::Tool {
            cut -= 1;
        }
        cut
    }

    /// Returns `true` if the history was compacted.
    pub async fn compact(&self, history: &mut ConversationHistory) -> Result<bool> {
        let cut = Self::cut_index(history.messages(), self.keep_last);
        if cut == 0 {
            return Ok(false);
        }

        let (head, tail) = history.messages().split_at(cut);

        // Fold an existing summary block into the next one instead of
        // re-summarizing it as ordinary dialogue.
        let previous_summary = head
            .iter()
            .find(|m| m.context_summary)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let to_summarize: Vec<&ConversationMessage> =
            head.iter().filter(|m| !m.context_summary).collect();
        if to_summarize.is_empty() {
            return Ok(false);
        }

        debug!(
            "compaction: summarizing {} messages, keeping {}",
            to_summarize.len(),
            tail.len()
        );

        let formatted: Vec<String> = to_summarize
            .iter()
            .map(|m| {
                let speaker = m.agent_id.as_deref().unwrap_or(match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                });
                format!("[{}]: {}", speaker, m.content)
            })
            .collect();

        let effective_summary = if previous_summary.is_empty() {
            "(none)"
        } else {
            &previous_summary
        };
        let prompt = COMPACTION_PROMPT
            .replace("{previous_summary}", effective_summary)
            .replace("{messages}", &formatted.join("\n"));

        let model = self
            .model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string());
        let response = self
            .provider
            .infer(InferenceRequest {
                messages: vec![ConversationMessage::user(prompt)],
                tools: None,
                params: InferenceParams {
                    model,
                    temperature: COMPACTION_TEMPERATURE,
                    reasoning_tokens: 0,
                    max_output_tokens: COMPACTION_MAX_TOKENS,
                },
            })
            .await?;

        let summary = response.content.unwrap_or_default();
        if summary.trim().is_empty() {
            warn!("compaction: provider returned empty summary, keeping history as-is");
            return Ok(false);
        }

        let mut replacement = Vec::with_capacity(tail.len() + 1);
        replacement.push(ConversationMessage::summary(format!(
            "[Conversation summary]\n{}",
            summary.trim()
        )));
        replacement.extend(tail.iter().cloned());
        history.replace_messages(replacement);
        Ok(true)
    }
}
