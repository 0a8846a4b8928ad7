use chrono::Utc;
use std::sync::OnceLock;
use tracing::debug;

/// Values substituted into prompt templates. Rebuilt per request so temporal
/// tokens are always current; nothing here is cached.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub agent_id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub active_agents: Vec<String>,
    pub llm_provider: String,
    pub llm_model: String,
    pub system_llm_enabled: bool,
    pub orpar_phase: String,
}

fn token_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\{\{([A-Z_]+)\}\}").expect("token pattern must compile"))
}

/// Replace recognized `{{TOKEN}}`s. Unknown tokens are left intact and
/// logged; replacement is therefore idempotent on fully resolved strings.
pub fn replace_tokens(template: &str, ctx: &TemplateContext) -> String {
    let now = Utc::now();
    token_regex()
        .replace_all(template, |caps: &regex::Captures| {
            let token = &caps[1];
            match token {
                "DATE_TIME" => now.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                "DAY_OF_WEEK" => now.format("%A").to_string(),
                "CURRENT_YEAR" => now.format("%Y").to_string(),
                "CURRENT_MONTH" => now.format("%m").to_string(),
                "CURRENT_DAY" => now.format("%d").to_string(),
                "TIME_ZONE" => "UTC".to_string(),
                "ISO_TIMESTAMP" => now.to_rfc3339(),
                "OS_PLATFORM" => std::env::consts::OS.to_string(),
                "AGENT_ID" => ctx.agent_id.clone(),
                "CHANNEL_ID" => ctx.channel_id.clone(),
                "CHANNEL_NAME" => ctx.channel_name.clone(),
                "ACTIVE_AGENTS_COUNT" => ctx.active_agents.len().to_string(),
                "ACTIVE_AGENTS_LIST" => {
                    if ctx.active_agents.is_empty() {
                        "(none)".to_string()
                    } else {
                        ctx.active_agents.join(", ")
                    }
                }
                "LLM_PROVIDER" => ctx.llm_provider.clone(),
                "LLM_MODEL" => ctx.llm_model.clone(),
                "SYSTEM_LLM_STATUS" => {
                    if ctx.system_llm_enabled {
                        "enabled".to_string()
                    } else {
                        "disabled".to_string()
                    }
                }
                "CURRENT_ORPAR_PHASE" => ctx.orpar_phase.clone(),
                unknown => {
                    debug!("template: leaving unknown token {{{{{}}}}} intact", unknown);
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}
