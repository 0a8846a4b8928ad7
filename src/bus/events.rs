//! Event type names and the public-event whitelist.
//!
//! Event types are dotted strings (`message.received`, `task.completed`).
//! Only whitelisted types may cross the transport boundary to connected
//! clients and channel monitors; everything else stays inside the process.

pub const MESSAGE_RECEIVED: &str = "message.received";
pub const MESSAGE_SENT: &str = "message.sent";
pub const MESSAGE_BROADCAST: &str = "message.broadcast";

pub const TASK_CREATED: &str = "task.created";
pub const TASK_ASSIGNED: &str = "task.assigned";
pub const TASK_PROGRESS_UPDATED: &str = "task.progress_updated";
pub const TASK_COMPLETED: &str = "task.completed";
pub const TASK_FAILED: &str = "task.failed";
pub const TASK_CANCELLED: &str = "task.cancelled";

pub const MCP_TOOL_CALL: &str = "mcp.tool_call";
pub const MCP_TOOL_RESULT: &str = "mcp.tool_result";
pub const MCP_TOOL_ERROR: &str = "mcp.tool_error";
pub const MCP_TOOL_REGISTERED: &str = "mcp.tool_registered";

pub const CONTROLLOOP_OBSERVATION: &str = "controlloop.observation";
pub const CONTROLLOOP_REASONING: &str = "controlloop.reasoning";
pub const CONTROLLOOP_PLAN: &str = "controlloop.plan";
pub const CONTROLLOOP_ACTION: &str = "controlloop.action";
pub const CONTROLLOOP_REFLECTION: &str = "controlloop.reflection";

pub const AGENT_CONNECTED: &str = "agent.connected";
pub const AGENT_DISCONNECTED: &str = "agent.disconnected";
pub const AGENT_REGISTERED: &str = "agent.registered";
pub const AGENT_ERROR: &str = "agent.error";
pub const AGENT_JOIN_CHANNEL: &str = "agent.join_channel";
pub const AGENT_LEAVE_CHANNEL: &str = "agent.leave_channel";

pub const CHANNEL_AGENT_JOINED: &str = "channel.agent_joined";
pub const CHANNEL_AGENT_LEFT: &str = "channel.agent_left";
pub const CHANNEL_CREATED: &str = "channel.created";
pub const CHANNEL_UPDATED: &str = "channel.updated";

const MEMORY_RESULT_EVENTS: [&str; 4] = [
    "memory.create_result",
    "memory.update_result",
    "memory.get_result",
    "memory.delete_result",
];

const CONTROLLOOP_EVENTS: [&str; 5] = [
    CONTROLLOOP_OBSERVATION,
    CONTROLLOOP_REASONING,
    CONTROLLOOP_PLAN,
    CONTROLLOOP_ACTION,
    CONTROLLOOP_REFLECTION,
];

const AGENT_EVENTS: [&str; 6] = [
    AGENT_CONNECTED,
    AGENT_DISCONNECTED,
    AGENT_REGISTERED,
    AGENT_ERROR,
    AGENT_JOIN_CHANNEL,
    AGENT_LEAVE_CHANNEL,
];

const CHANNEL_EVENTS: [&str; 4] = [
    CHANNEL_AGENT_JOINED,
    CHANNEL_AGENT_LEFT,
    CHANNEL_CREATED,
    CHANNEL_UPDATED,
];

/// Whether an event type may be delivered across the transport boundary.
///
/// The whitelist is static: `message.*`, `task.*` (excluding
/// `task.internal.*`), the four memory result events, `mcp.tool_*`,
/// `controlloop.*` phases, and the enumerated `agent.*` / `channel.*` types.
pub fn is_public_event(event_type: &str) -> bool {
    if event_type.starts_with("message.") {
        return true;
    }
    if event_type.starts_with("task.") {
        return !event_type.starts_with("task.internal.");
    }
    if MEMORY_RESULT_EVENTS.contains(&event_type) {
        return true;
    }
    matches!(
        event_type,
        MCP_TOOL_CALL | MCP_TOOL_RESULT | MCP_TOOL_ERROR | MCP_TOOL_REGISTERED
    ) || CONTROLLOOP_EVENTS.contains(&event_type)
        || AGENT_EVENTS.contains(&event_type)
        || CHANNEL_EVENTS.contains(&event_type)
}

/// Overflow behavior when a subscriber inbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Discard the oldest queued event to make room.
    DropOldest,
    /// Block the emitter until space frees up or a timeout elapses.
    Block,
}

/// Per-class overflow policy: `task.*` and `message.*` must not be silently
/// lost, everything else trades completeness for liveness.
pub fn overflow_policy(event_type: &str) -> OverflowPolicy {
    if event_type.starts_with("task.") || event_type.starts_with("message.") {
        OverflowPolicy::Block
    } else {
        OverflowPolicy::DropOldest
    }
}

#[cfg(test)]
mod tests;
