use super::*;

#[test]
fn message_and_task_prefixes_are_public() {
    assert!(is_public_event("message.received"));
    assert!(is_public_event("message.broadcast"));
    assert!(is_public_event("task.created"));
    assert!(is_public_event("task.progress_updated"));
}

#[test]
fn internal_task_events_are_private() {
    assert!(!is_public_event("task.internal.reschedule"));
    assert!(!is_public_event("task.internal.sweep"));
}

#[test]
fn memory_result_events_are_public_but_not_raw_ops() {
    assert!(is_public_event("memory.get_result"));
    assert!(is_public_event("memory.delete_result"));
    assert!(!is_public_event("memory.get"));
    assert!(!is_public_event("memory.sweep"));
}

#[test]
fn controlloop_phases_are_public() {
    for ev in [
        "controlloop.observation",
        "controlloop.reasoning",
        "controlloop.plan",
        "controlloop.action",
        "controlloop.reflection",
    ] {
        assert!(is_public_event(ev), "{ev} should be public");
    }
    assert!(!is_public_event("controlloop.debug"));
}

#[test]
fn unlisted_namespaces_are_private() {
    assert!(!is_public_event("session.created"));
    assert!(!is_public_event("params.override_created"));
    assert!(!is_public_event("sandbox.pool_exhausted"));
}

#[test]
fn overflow_policy_by_class() {
    assert_eq!(overflow_policy("message.received"), OverflowPolicy::Block);
    assert_eq!(overflow_policy("task.completed"), OverflowPolicy::Block);
    assert_eq!(
        overflow_policy("controlloop.reasoning"),
        OverflowPolicy::DropOldest
    );
    assert_eq!(
        overflow_policy("memory.get_result"),
        OverflowPolicy::DropOldest
    );
}
