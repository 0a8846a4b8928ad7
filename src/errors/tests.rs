use super::*;

#[test]
fn error_codes_render_wire_names() {
    assert_eq!(ErrorCode::AuthInvalidKey.as_str(), "AUTH_INVALID_KEY");
    assert_eq!(ErrorCode::ToolPairingViolation.as_str(), "TOOL_PAIRING_VIOLATION");
    assert_eq!(ErrorCode::CircuitOpen.as_str(), "CIRCUIT_OPEN");
}

#[test]
fn code_mapping_follows_variant() {
    let err = MxfError::ToolNotFound {
        name: "weather".into(),
    };
    assert_eq!(err.code(), ErrorCode::ToolNotFound);

    let err = MxfError::validation("bad args", vec![ValidationIssue::error("/name", "required")]);
    assert_eq!(err.code(), ErrorCode::ValidationError);
}

#[test]
fn retryability_classification() {
    assert!(
        MxfError::Provider {
            message: "503 upstream".into(),
            retryable: true
        }
        .is_retryable()
    );
    assert!(MxfError::Timeout("llm call".into()).is_retryable());
    assert!(
        !MxfError::Auth {
            code: ErrorCode::AuthInvalidKey,
            message: "bad key".into()
        }
        .is_retryable()
    );
    assert!(
        !MxfError::ToolForbidden {
            name: "filesystem_write".into(),
            agent_id: "a1".into()
        }
        .is_retryable()
    );
}
