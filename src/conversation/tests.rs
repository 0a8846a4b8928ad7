use super::*;
use proptest::prelude::*;
use serde_json::json;

#[test]
fn append_drops_adjacent_duplicate_user_message() {
    let mut history = ConversationHistory::new();
    assert_eq!(
        history.append(ConversationMessage::user("hello world")),
        AppendOutcome::Appended
    );
    assert_eq!(
        history.append(ConversationMessage::user("  Hello   World ")),
        AppendOutcome::DroppedDuplicate
    );
    assert_eq!(history.len(), 1);
}

#[test]
fn different_roles_with_same_content_are_not_duplicates() {
    let mut history = ConversationHistory::new();
    history.append(ConversationMessage::user("status?"));
    assert_eq!(
        history.append(ConversationMessage::assistant("status?")),
        AppendOutcome::Appended
    );
}

#[test]
fn tool_results_are_never_deduplicated() {
    let mut history = ConversationHistory::new();
    history.append(ConversationMessage::assistant_with_calls(
        "",
        vec![
            ToolCall::new("tc1", "read_file", json!({"path": "/a"})),
            ToolCall::new("tc2", "read_file", json!({"path": "/b"})),
        ],
    ));
    assert_eq!(
        history.append(ConversationMessage::tool_result("tc1", "Success")),
        AppendOutcome::Appended
    );
    assert_eq!(
        history.append(ConversationMessage::tool_result("tc2", "Success")),
        AppendOutcome::Appended
    );
    assert_eq!(history.len(), 3);
}

#[test]
fn dedup_window_skips_interleaved_tool_messages() {
    let mut history = ConversationHistory::new();
    history.append(ConversationMessage::assistant_with_calls(
        "working on it",
        vec![ToolCall::new("tc1", "noop", json!({}))],
    ));
    history.append(ConversationMessage::tool_result("tc1", "done"));
    // The last non-tool message is the assistant one; a repeat of it is still
    // a duplicate even though a tool message sits in between.
    assert_eq!(
        history.append(ConversationMessage::assistant("working on it")),
        AppendOutcome::DroppedDuplicate
    );
}

#[test]
fn wider_dedup_window_catches_older_repeats() {
    let mut history = ConversationHistory::with_dedup_window(2);
    history.append(ConversationMessage::user("ping"));
    history.append(ConversationMessage::assistant("pong"));
    assert_eq!(
        history.append(ConversationMessage::user("ping")),
        AppendOutcome::DroppedDuplicate
    );

    let mut narrow = ConversationHistory::with_dedup_window(1);
    narrow.append(ConversationMessage::user("ping"));
    narrow.append(ConversationMessage::assistant("pong"));
    assert_eq!(
        narrow.append(ConversationMessage::user("ping")),
        AppendOutcome::Appended
    );
}

#[test]
fn unanswered_tool_calls_reported_in_issue_order() {
    let mut history = ConversationHistory::new();
    history.append(ConversationMessage::assistant_with_calls(
        "",
        vec![
            ToolCall::new("tc2", "b", json!({})),
            ToolCall::new("tc1", "a", json!({})),
        ],
    ));
    history.append(ConversationMessage::tool_result("tc1", "ok"));

    let missing = history.unanswered_tool_calls();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].tool_call_id, "tc2");
}

#[test]
fn enforce_pairing_synthesizes_no_result() {
    let mut history = ConversationHistory::new();
    history.append(ConversationMessage::assistant_with_calls(
        "",
        vec![ToolCall::new("tc1", "read_file", json!({"path": "/a"}))],
    ));

    let synthesized = history.enforce_pairing(PairingPolicy::Synthesize).unwrap();
    assert_eq!(synthesized, vec!["tc1".to_string()]);

    let last = history.messages().last().unwrap();
    assert_eq!(last.role, Role::Tool);
    assert_eq!(last.tool_call_id.as_deref(), Some("tc1"));
    let body: serde_json::Value = serde_json::from_str(&last.content).unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "no_result");

    // Enforcing again is a no-op.
    assert!(history.enforce_pairing(PairingPolicy::Synthesize).unwrap().is_empty());
}

#[test]
fn enforce_pairing_abort_policy_errors() {
    let mut history = ConversationHistory::new();
    history.append(ConversationMessage::assistant_with_calls(
        "",
        vec![ToolCall::new("tc1", "read_file", json!({}))],
    ));

    let err = history.enforce_pairing(PairingPolicy::Abort).unwrap_err();
    assert_eq!(err.code(), crate::errors::ErrorCode::ToolPairingViolation);
}

#[test]
fn fully_paired_history_passes_enforcement() {
    let mut history = ConversationHistory::new();
    history.append(ConversationMessage::assistant_with_calls(
        "",
        vec![
            ToolCall::new("tc1", "read_file", json!({"path": "/a"})),
            ToolCall::new("tc2", "read_file", json!({"path": "/b"})),
        ],
    ));
    history.append(ConversationMessage::tool_result("tc1", "Success"));
    history.append(ConversationMessage::tool_result("tc2", "Success"));

    assert!(history.unanswered_tool_calls().is_empty());
    assert!(history.enforce_pairing(PairingPolicy::Abort).is_ok());
}

proptest! {
    /// Invariant: identical adjacent tool results are always both retained.
    #[test]
    fn prop_tool_results_survive_any_content(content in ".{0,64}", count in 1..10usize) {
        let mut history = ConversationHistory::new();
        let calls: Vec<ToolCall> = (0..count)
            .map(|i| ToolCall::new(format!("tc{}", i), "t", json!({})))
            .collect();
        history.append(ConversationMessage::assistant_with_calls("", calls));
        for i in 0..count {
            history.append(ConversationMessage::tool_result(format!("tc{}", i), content.clone()));
        }
        prop_assert_eq!(history.len(), count + 1);
    }

    /// Invariant: after Synthesize enforcement no unanswered calls remain.
    #[test]
    fn prop_enforcement_closes_all_pairs(answered in prop::collection::vec(any::<bool>(), 1..8)) {
        let mut history = ConversationHistory::new();
        let calls: Vec<ToolCall> = (0..answered.len())
            .map(|i| ToolCall::new(format!("tc{}", i), "t", json!({})))
            .collect();
        history.append(ConversationMessage::assistant_with_calls("", calls));
        for (i, is_answered) in answered.iter().enumerate() {
            if *is_answered {
                history.append(ConversationMessage::tool_result(format!("tc{}", i), "ok"));
            }
        }
        history.enforce_pairing(PairingPolicy::Synthesize).unwrap();
        prop_assert!(history.unanswered_tool_calls().is_empty());
    }
}
