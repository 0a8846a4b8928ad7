use super::*;

fn service() -> ParamService {
    ParamService::new(
        ParamsConfig {
            known_models: vec!["model-a".to_string(), "model-b".to_string()],
            ..ParamsConfig::default()
        },
        "model-a",
    )
}

fn patch_temperature(t: f32) -> ParamPatch {
    ParamPatch {
        temperature: Some(t),
        ..ParamPatch::default()
    }
}

#[test]
fn phase_profiles_follow_the_table() {
    let service = service();
    let observation = service.resolve("a1", "ch1", Phase::Observation);
    assert!(observation.temperature <= 0.3);
    assert_eq!(observation.reasoning_tokens, 0);

    let reasoning = service.resolve("a1", "ch1", Phase::Reasoning);
    assert!(reasoning.temperature > 0.3);
    assert!(reasoning.reasoning_tokens > 0);

    let action = service.resolve("a1", "ch1", Phase::Action);
    assert!(action.temperature <= 0.2);
    assert_eq!(action.reasoning_tokens, 0);

    let planning = service.resolve("a1", "ch1", Phase::Planning);
    assert!((0.2..=0.5).contains(&planning.temperature));

    let reflection = service.resolve("a1", "ch1", Phase::Reflection);
    assert!((0.3..=0.6).contains(&reflection.temperature));
}

#[test]
fn channel_default_overlays_system_profile() {
    let service = service();
    service.set_channel_default("ch1", patch_temperature(0.9));

    assert!((service.resolve("a1", "ch1", Phase::Reasoning).temperature - 0.9).abs() < 1e-6);
    // Other channels keep the system default.
    assert!((service.resolve("a1", "ch2", Phase::Reasoning).temperature - 0.7).abs() < 1e-6);
}

#[test]
fn next_call_beats_session_and_is_consumed() {
    let service = service();
    service
        .request_override(
            "a1",
            "ch1",
            "session tuning",
            patch_temperature(0.8),
            OverrideScope::Session,
            None,
        )
        .unwrap();
    service
        .request_override(
            "a1",
            "ch1",
            "one cold call",
            patch_temperature(0.6),
            OverrideScope::NextCall,
            None,
        )
        .unwrap();

    // next_call wins the first resolution.
    let first = service.resolve("a1", "ch1", Phase::Reasoning);
    assert!((first.temperature - 0.6).abs() < 1e-6);

    assert_eq!(service.consume_next_call("a1"), 1);

    // Subsequent inference falls back to the session override.
    let second = service.resolve("a1", "ch1", Phase::Reasoning);
    assert!((second.temperature - 0.8).abs() < 1e-6);

    // After a session reset, the phase default returns.
    assert_eq!(service.reset("a1", ResetScope::Session), 1);
    let third = service.resolve("a1", "ch1", Phase::Reasoning);
    assert!((third.temperature - 0.7).abs() < 1e-6);
}

#[test]
fn empty_reason_is_rejected() {
    let service = service();
    let err = service
        .request_override(
            "a1",
            "ch1",
            "   ",
            patch_temperature(0.5),
            OverrideScope::Session,
            None,
        )
        .unwrap_err();
    assert_eq!(err.code(), crate::errors::ErrorCode::ValidationError);
}

#[test]
fn out_of_range_suggestions_are_clamped_to_modified() {
    let service = service();
    let response = service
        .request_override(
            "a1",
            "ch1",
            "going wild",
            ParamPatch {
                temperature: Some(9.0),
                max_output_tokens: Some(1),
                ..ParamPatch::default()
            },
            OverrideScope::Session,
            None,
        )
        .unwrap();

    assert_eq!(response.status, OverrideStatus::Modified);
    assert!((response.active_params.temperature - 2.0).abs() < 1e-6);
    assert_eq!(response.active_params.max_output_tokens, MIN_OUTPUT_TOKENS);
}

#[test]
fn unknown_model_is_substituted() {
    let service = service();
    let response = service
        .request_override(
            "a1",
            "ch1",
            "try something new",
            ParamPatch {
                model: Some("model-nonexistent".to_string()),
                ..ParamPatch::default()
            },
            OverrideScope::Session,
            None,
        )
        .unwrap();
    assert_eq!(response.status, OverrideStatus::Modified);
    assert_eq!(response.active_params.model, "model-a");
    assert!(response.message.unwrap().contains("substituted"));
}

#[test]
fn phase_scoped_override_only_affects_that_phase() {
    let service = service();
    service
        .request_override(
            "a1",
            "ch1",
            "hot reflection",
            patch_temperature(0.6),
            OverrideScope::CurrentPhase,
            Some(Phase::Reflection),
        )
        .unwrap();

    assert!((service.resolve("a1", "ch1", Phase::Reflection).temperature - 0.6).abs() < 1e-6);
    assert!((service.resolve("a1", "ch1", Phase::Reasoning).temperature - 0.7).abs() < 1e-6);

    service.end_phase("a1", Phase::Reflection);
    assert!((service.resolve("a1", "ch1", Phase::Reflection).temperature - 0.5).abs() < 1e-6);
}

#[test]
fn task_overrides_end_with_the_task() {
    let service = service();
    service
        .request_override(
            "a1",
            "ch1",
            "task needs long outputs",
            ParamPatch {
                max_output_tokens: Some(12000),
                ..ParamPatch::default()
            },
            OverrideScope::Task,
            None,
        )
        .unwrap();
    assert_eq!(
        service.resolve("a1", "ch1", Phase::Action).max_output_tokens,
        12000
    );

    service.end_task("a1");
    assert_eq!(
        service.resolve("a1", "ch1", Phase::Action).max_output_tokens,
        8192
    );
}

#[test]
fn overrides_are_per_agent() {
    let service = service();
    service
        .request_override(
            "a1",
            "ch1",
            "mine",
            patch_temperature(1.5),
            OverrideScope::Session,
            None,
        )
        .unwrap();
    assert!((service.resolve("a2", "ch1", Phase::Reasoning).temperature - 0.7).abs() < 1e-6);
}

#[test]
fn reset_all_counts_everything() {
    let service = service();
    for scope in [OverrideScope::Session, OverrideScope::Task, OverrideScope::NextCall] {
        service
            .request_override("a1", "ch1", "r", patch_temperature(0.5), scope, None)
            .unwrap();
    }
    assert_eq!(service.reset("a1", ResetScope::All), 3);
    assert!(service.active_overrides("a1").is_empty());
}

#[test]
fn cost_analytics_aggregates_by_phase_and_model() {
    let service = service();
    service.record_usage(
        Phase::Reasoning,
        "model-a",
        TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
        },
    );
    service.record_usage(
        Phase::Action,
        "model-b",
        TokenUsage {
            input_tokens: 30,
            output_tokens: 10,
        },
    );

    let analytics = service.cost_analytics(24);
    assert_eq!(analytics["totals"]["inputTokens"], 130);
    assert_eq!(analytics["totals"]["outputTokens"], 60);
    assert_eq!(analytics["byPhase"]["reasoning"]["inputTokens"], 100);
    assert_eq!(analytics["byModel"]["model-b"]["outputTokens"], 10);
}

#[test]
fn cost_delta_reflects_token_budget_change() {
    let service = service();
    let response = service
        .request_override(
            "a1",
            "ch1",
            "bigger outputs",
            ParamPatch {
                max_output_tokens: Some(16000),
                ..ParamPatch::default()
            },
            OverrideScope::Session,
            None,
        )
        .unwrap();
    assert_eq!(response.cost_delta, i64::from(16000u32) - 8192);
}
