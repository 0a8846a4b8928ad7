use crate::config::ParamsConfig;
use crate::errors::{MxfError, ValidationIssue};
use crate::providers::base::{InferenceParams, TokenUsage};
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Minimum accepted `max_output_tokens`; suggestions below are clamped up.
pub const MIN_OUTPUT_TOKENS: u32 = 100;
pub const MIN_TEMPERATURE: f32 = 0.0;

/// ORPAR cognitive phase. Each phase has its own default inference profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Observation,
    Reasoning,
    Planning,
    Action,
    Reflection,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Observation => "observation",
            Self::Reasoning => "reasoning",
            Self::Planning => "planning",
            Self::Action => "action",
            Self::Reflection => "reflection",
        }
    }

    pub const ALL: [Phase; 5] = [
        Phase::Observation,
        Phase::Reasoning,
        Phase::Planning,
        Phase::Action,
        Phase::Reflection,
    ];
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Override lifetime class, in precedence order (highest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideScope {
    NextCall,
    CurrentPhase,
    Task,
    Session,
}

impl OverrideScope {
    fn precedence(self) -> u8 {
        match self {
            Self::NextCall => 0,
            Self::CurrentPhase => 1,
            Self::Task => 2,
            Self::Session => 3,
        }
    }
}

/// Sparse parameter overlay. Unset fields fall through to the next layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(rename = "reasoningTokens", skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u32>,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl ParamPatch {
    fn is_empty(&self) -> bool {
        self.model.is_none()
            && self.temperature.is_none()
            && self.reasoning_tokens.is_none()
            && self.max_output_tokens.is_none()
    }

    fn apply(&self, base: &mut InferenceParams) {
        if let Some(model) = &self.model {
            base.model = model.clone();
        }
        if let Some(temperature) = self.temperature {
            base.temperature = temperature;
        }
        if let Some(reasoning) = self.reasoning_tokens {
            base.reasoning_tokens = reasoning;
        }
        if let Some(max_output) = self.max_output_tokens {
            base.max_output_tokens = max_output;
        }
    }
}

#[derive(Debug, Clone)]
pub struct InferenceOverride {
    pub id: String,
    pub agent_id: String,
    /// Restricts the override to one phase; `None` applies to all.
    pub phase: Option<Phase>,
    pub scope: OverrideScope,
    pub patch: ParamPatch,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideStatus {
    Approved,
    Modified,
    Denied,
}

/// Outcome of `request_inference_params`.
#[derive(Debug, Clone, Serialize)]
pub struct OverrideResponse {
    pub status: OverrideStatus,
    #[serde(rename = "activeParams")]
    pub active_params: InferenceParams,
    #[serde(rename = "previousParams", skip_serializing_if = "Option::is_none")]
    pub previous_params: Option<InferenceParams>,
    #[serde(rename = "overrideId", skip_serializing_if = "Option::is_none")]
    pub override_id: Option<String>,
    #[serde(rename = "expiresAt", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Signed token-budget delta versus the previous parameters.
    #[serde(rename = "costDelta")]
    pub cost_delta: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Which overrides a reset removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetScope {
    All,
    Session,
    Task,
    CurrentPhase,
    NextCall,
}

#[derive(Debug, Clone)]
struct UsageRecord {
    phase: Phase,
    model: String,
    input_tokens: u64,
    output_tokens: u64,
    at: DateTime<Utc>,
}

/// Phase-aware inference parameter service with agent-initiated overrides.
///
/// Resolution walks active overrides in precedence order (`next_call` >
/// `current_phase` > `task` > `session`); the first match overlays the
/// channel default, which overlays the system phase profile.
pub struct ParamService {
    config: ParamsConfig,
    default_model: String,
    system_profiles: HashMap<Phase, InferenceParams>,
    channel_defaults: Mutex<HashMap<String, ParamPatch>>,
    overrides: Mutex<Vec<InferenceOverride>>,
    usage: Mutex<Vec<UsageRecord>>,
}

impl ParamService {
    pub fn new(config: ParamsConfig, default_model: impl Into<String>) -> Self {
        let default_model = default_model.into();
        let mut system_profiles = HashMap::new();
        // Phase profile defaults: accuracy phases run cold with no reasoning
        // budget, exploratory phases run warm with one.
        for (phase, temperature, reasoning_tokens) in [
            (Phase::Observation, 0.2, 0),
            (Phase::Reasoning, 0.7, 2048),
            (Phase::Planning, 0.4, 1024),
            (Phase::Action, 0.1, 0),
            (Phase::Reflection, 0.5, 1024),
        ] {
            system_profiles.insert(
                phase,
                InferenceParams {
                    model: default_model.clone(),
                    temperature,
                    reasoning_tokens,
                    max_output_tokens: 8192,
                },
            );
        }
        Self {
            config,
            default_model,
            system_profiles,
            channel_defaults: Mutex::new(HashMap::new()),
            overrides: Mutex::new(Vec::new()),
            usage: Mutex::new(Vec::new()),
        }
    }

    pub fn set_channel_default(&self, channel_id: &str, patch: ParamPatch) {
        self.channel_defaults
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(channel_id.to_string(), patch);
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn known_models(&self) -> Vec<String> {
        let mut models = self.config.known_models.clone();
        if !models.contains(&self.default_model) {
            models.insert(0, self.default_model.clone());
        }
        models
    }

    fn base_profile(&self, phase: Phase) -> InferenceParams {
        self.system_profiles
            .get(&phase)
            .cloned()
            .unwrap_or_else(|| InferenceParams {
                model: self.default_model.clone(),
                temperature: 0.3,
                reasoning_tokens: 0,
                max_output_tokens: 8192,
            })
    }

    /// Resolve effective parameters for one inference call.
    pub fn resolve(&self, agent_id: &str, channel_id: &str, phase: Phase) -> InferenceParams {
        let mut params = self.base_profile(phase);

        if let Some(patch) = self
            .channel_defaults
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(channel_id)
        {
            patch.apply(&mut params);
        }

        let now = Utc::now();
        let overrides = self
            .overrides
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut active: Vec<&InferenceOverride> = overrides
            .iter()
            .filter(|o| o.agent_id == agent_id)
            .filter(|o| o.phase.is_none_or(|p| p == phase))
            .filter(|o| o.expires_at.is_none_or(|t| t > now))
            .collect();
        active.sort_by_key(|o| (o.scope.precedence(), std::cmp::Reverse(o.created_at)));
        if let Some(winner) = active.first() {
            winner.patch.apply(&mut params);
        }
        params
    }

    /// Consume `next_call` overrides after exactly one inference by the
    /// owning agent. Called by the runtime with the per-agent turn lock held.
    pub fn consume_next_call(&self, agent_id: &str) -> usize {
        let mut overrides = self
            .overrides
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = overrides.len();
        overrides.retain(|o| !(o.agent_id == agent_id && o.scope == OverrideScope::NextCall));
        before - overrides.len()
    }

    /// Drop `current_phase` overrides when the agent leaves a phase.
    pub fn end_phase(&self, agent_id: &str, phase: Phase) {
        let mut overrides = self
            .overrides
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        overrides.retain(|o| {
            !(o.agent_id == agent_id
                && o.scope == OverrideScope::CurrentPhase
                && o.phase.is_none_or(|p| p == phase))
        });
    }

    /// Drop `task` overrides on task completion or cancellation.
    pub fn end_task(&self, agent_id: &str) {
        let mut overrides = self
            .overrides
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        overrides.retain(|o| !(o.agent_id == agent_id && o.scope == OverrideScope::Task));
    }

    /// Drop `session` overrides on disconnect.
    pub fn end_session(&self, agent_id: &str) {
        let mut overrides = self
            .overrides
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        overrides.retain(|o| !(o.agent_id == agent_id && o.scope == OverrideScope::Session));
    }

    /// Agent-initiated override request with governance: mandatory reason,
    /// ceiling clamps (status `modified` when clamped), unknown-model
    /// substitution or denial, scope-derived expiry.
    pub fn request_override(
        &self,
        agent_id: &str,
        channel_id: &str,
        reason: &str,
        suggested: ParamPatch,
        scope: OverrideScope,
        phase: Option<Phase>,
    ) -> Result<OverrideResponse, MxfError> {
        if reason.trim().is_empty() {
            return Err(MxfError::validation(
                "override request requires a non-empty reason",
                vec![ValidationIssue::error("/reason", "must not be empty")],
            ));
        }

        let resolve_phase = phase.unwrap_or(Phase::Reasoning);
        let previous = self.resolve(agent_id, channel_id, resolve_phase);

        let mut patch = suggested;
        let mut modified = false;
        let mut message = None;

        if let Some(temperature) = patch.temperature {
            let clamped = temperature.clamp(MIN_TEMPERATURE, self.config.temperature_ceiling);
            if (clamped - temperature).abs() > f32::EPSILON {
                patch.temperature = Some(clamped);
                modified = true;
            }
        }
        if let Some(max_output) = patch.max_output_tokens {
            let clamped = max_output.clamp(MIN_OUTPUT_TOKENS, self.config.max_output_tokens_ceiling);
            if clamped != max_output {
                patch.max_output_tokens = Some(clamped);
                modified = true;
            }
        }
        if let Some(reasoning) = patch.reasoning_tokens {
            let clamped = reasoning.min(self.config.reasoning_tokens_ceiling);
            if clamped != reasoning {
                patch.reasoning_tokens = Some(clamped);
                modified = true;
            }
        }
        if let Some(model) = &patch.model {
            let known = self.known_models();
            if !known.contains(model) {
                match known.first() {
                    Some(substitute) => {
                        message = Some(format!(
                            "unknown model '{}' substituted with '{}'",
                            model, substitute
                        ));
                        patch.model = Some(substitute.clone());
                        modified = true;
                    }
                    None => {
                        return Ok(OverrideResponse {
                            status: OverrideStatus::Denied,
                            active_params: previous.clone(),
                            previous_params: None,
                            override_id: None,
                            expires_at: None,
                            cost_delta: 0,
                            message: Some(format!("unknown model '{}'", model)),
                        });
                    }
                }
            }
        }
        if patch.is_empty() {
            return Ok(OverrideResponse {
                status: OverrideStatus::Denied,
                active_params: previous.clone(),
                previous_params: None,
                override_id: None,
                expires_at: None,
                cost_delta: 0,
                message: Some("no parameters suggested".to_string()),
            });
        }

        let expires_at = match scope {
            // next_call / current_phase / task expire on their lifecycle
            // events, not wall-clock.
            OverrideScope::NextCall | OverrideScope::CurrentPhase | OverrideScope::Task => None,
            OverrideScope::Session => {
                Some(Utc::now() + Duration::hours(self.config.session_override_hours))
            }
        };

        let id = Uuid::new_v4().to_string();
        let entry = InferenceOverride {
            id: id.clone(),
            agent_id: agent_id.to_string(),
            phase,
            scope,
            patch,
            reason: reason.to_string(),
            created_at: Utc::now(),
            expires_at,
        };
        self.overrides
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(entry);
        info!(
            "params: override {} for agent {} ({:?}, reason: {})",
            id, agent_id, scope, reason
        );

        let active = self.resolve(agent_id, channel_id, resolve_phase);
        let cost_delta = i64::from(active.max_output_tokens) + i64::from(active.reasoning_tokens)
            - i64::from(previous.max_output_tokens)
            - i64::from(previous.reasoning_tokens);

        Ok(OverrideResponse {
            status: if modified {
                OverrideStatus::Modified
            } else {
                OverrideStatus::Approved
            },
            active_params: active,
            previous_params: Some(previous),
            override_id: Some(id),
            expires_at,
            cost_delta,
            message,
        })
    }

    /// Remove matching overrides. Returns `(scope, removed_count)`.
    pub fn reset(&self, agent_id: &str, scope: ResetScope) -> usize {
        let mut overrides = self
            .overrides
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = overrides.len();
        overrides.retain(|o| {
            if o.agent_id != agent_id {
                return true;
            }
            !matches!(
                (scope, o.scope),
                (ResetScope::All, _)
                    | (ResetScope::Session, OverrideScope::Session)
                    | (ResetScope::Task, OverrideScope::Task)
                    | (ResetScope::CurrentPhase, OverrideScope::CurrentPhase)
                    | (ResetScope::NextCall, OverrideScope::NextCall)
            )
        });
        let removed = before - overrides.len();
        debug!("params: reset {:?} removed {} overrides", scope, removed);
        removed
    }

    pub fn active_overrides(&self, agent_id: &str) -> Vec<InferenceOverride> {
        let now = Utc::now();
        self.overrides
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|o| o.agent_id == agent_id)
            .filter(|o| o.expires_at.is_none_or(|t| t > now))
            .cloned()
            .collect()
    }

    pub fn record_usage(&self, phase: Phase, model: &str, usage: TokenUsage) {
        self.usage
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(UsageRecord {
                phase,
                model: model.to_string(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                at: Utc::now(),
            });
    }

    /// Aggregate usage over `(now - hours, now]` per phase, model, and hour
    /// bucket, with coarse optimization tips.
    pub fn cost_analytics(&self, hours: i64) -> serde_json::Value {
        let since = Utc::now() - Duration::hours(hours.max(1));
        let usage = self
            .usage
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut total_input = 0u64;
        let mut total_output = 0u64;
        let mut by_phase: HashMap<&'static str, (u64, u64)> = HashMap::new();
        let mut by_model: HashMap<String, (u64, u64)> = HashMap::new();
        let mut by_hour: HashMap<String, (u64, u64)> = HashMap::new();

        for record in usage.iter().filter(|r| r.at > since) {
            total_input += record.input_tokens;
            total_output += record.output_tokens;
            let phase = by_phase.entry(record.phase.as_str()).or_default();
            phase.0 += record.input_tokens;
            phase.1 += record.output_tokens;
            let model = by_model.entry(record.model.clone()).or_default();
            model.0 += record.input_tokens;
            model.1 += record.output_tokens;
            let hour = record.at.with_minute(0).and_then(|t| t.with_second(0));
            let bucket = hour.unwrap_or(record.at).format("%Y-%m-%dT%H:00Z").to_string();
            let entry = by_hour.entry(bucket).or_default();
            entry.0 += record.input_tokens;
            entry.1 += record.output_tokens;
        }

        let mut tips: Vec<String> = Vec::new();
        if let Some((input, output)) = by_phase.get("reasoning") {
            if input + output > (total_input + total_output) / 2 && total_output > 0 {
                tips.push(
                    "reasoning phase dominates token spend; consider a lower reasoning budget"
                        .to_string(),
                );
            }
        }
        if self.active_overrides_count() > 10 {
            tips.push("many active overrides; consider reset_inference_params".to_string());
        }

        let map_section = |m: HashMap<String, (u64, u64)>| -> serde_json::Value {
            serde_json::Value::Object(
                m.into_iter()
                    .map(|(k, (input, output))| {
                        (
                            k,
                            serde_json::json!({ "inputTokens": input, "outputTokens": output }),
                        )
                    })
                    .collect(),
            )
        };

        serde_json::json!({
            "timeRangeHours": hours,
            "totals": { "inputTokens": total_input, "outputTokens": total_output },
            "byPhase": map_section(
                by_phase.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
            ),
            "byModel": map_section(by_model),
            "byHour": map_section(by_hour),
            "tips": tips,
        })
    }

    fn active_overrides_count(&self) -> usize {
        self.overrides
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests;
