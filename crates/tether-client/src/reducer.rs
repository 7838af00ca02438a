//! Folds a session's decrypted event log into a UI message list.
//!
//! The fold is synchronous and idempotent: applying an event id twice is a
//! no-op, and tool calls are keyed by their correlation id so a result
//! updates the existing message in place instead of appending.

use crate::encryption::DecryptedMessage;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tether_protocol::domain::{
    AgentContent, AgentEvent, AgentState, ContentBlock, PermissionOutcome, RawRecord, TodoItem,
    UserContent,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    UserText(UserTextMessage),
    AgentText(AgentTextMessage),
    ToolCall(ToolCallMessage),
    Event(EventMessage),
}

impl Message {
    pub fn id(&self) -> &str {
        match self {
            Message::UserText(m) => &m.id,
            Message::AgentText(m) => &m.id,
            Message::ToolCall(m) => &m.id,
            Message::Event(m) => &m.id,
        }
    }

    pub fn created_at(&self) -> u64 {
        match self {
            Message::UserText(m) => m.created_at,
            Message::AgentText(m) => m.created_at,
            Message::ToolCall(m) => m.tool.started_at,
            Message::Event(m) => m.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserTextMessage {
    pub id: String,
    pub local_id: Option<String>,
    /// Set once the server has stored the message.
    pub server_id: Option<String>,
    pub seq: Option<u64>,
    pub text: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentTextMessage {
    pub id: String,
    pub text: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallMessage {
    pub id: String,
    pub tool: ToolCall,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub description: Option<String>,
    pub state: ToolState,
    pub result: Option<Value>,
    pub permission: Option<ToolPermission>,
    pub started_at: u64,
    pub completed_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolState {
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPermission {
    pub status: PermissionStatus,
    pub reason: Option<String>,
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Pending,
    Approved,
    Denied,
    Canceled,
}

impl From<PermissionOutcome> for PermissionStatus {
    fn from(outcome: PermissionOutcome) -> Self {
        match outcome {
            PermissionOutcome::Approved => PermissionStatus::Approved,
            PermissionOutcome::Denied => PermissionStatus::Denied,
            PermissionOutcome::Canceled => PermissionStatus::Canceled,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    pub id: String,
    pub event: AgentEvent,
    pub created_at: u64,
}

#[derive(Debug, Clone)]
struct PendingResult {
    content: Value,
    is_error: bool,
    at: u64,
}

/// Accumulated fold state for one session.
#[derive(Debug, Default, Clone)]
pub struct ReducerState {
    messages: Vec<Message>,
    positions: HashMap<String, usize>,
    processed: HashSet<String>,
    /// Tool correlation id → message id.
    tools: HashMap<String, String>,
    /// Results whose tool-use has not been folded yet.
    early_results: HashMap<String, PendingResult>,
    /// Permission decisions for tools not seen yet.
    early_permissions: HashMap<String, ToolPermission>,
    /// Client local id → message id.
    local_ids: HashMap<String, String>,
    todos: Vec<TodoItem>,
    old_todos: Option<Vec<TodoItem>>,
}

impl ReducerState {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.positions.get(id).map(|&i| &self.messages[i])
    }

    pub fn todos(&self) -> &[TodoItem] {
        &self.todos
    }

    pub fn old_todos(&self) -> Option<&[TodoItem]> {
        self.old_todos.as_deref()
    }

    pub fn is_processed(&self, event_id: &str) -> bool {
        self.processed.contains(event_id)
    }

    fn push(&mut self, message: Message) -> Message {
        self.positions
            .insert(message.id().to_string(), self.messages.len());
        self.messages.push(message.clone());
        message
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        let index = *self.positions.get(id)?;
        self.messages.get_mut(index)
    }

    /// Append a user message before the server has acknowledged it.
    pub fn push_optimistic(&mut self, local_id: &str, text: &str, created_at: u64) -> Message {
        self.local_ids
            .insert(local_id.to_string(), local_id.to_string());
        self.push(Message::UserText(UserTextMessage {
            id: local_id.to_string(),
            local_id: Some(local_id.to_string()),
            server_id: None,
            seq: None,
            text: text.to_string(),
            created_at,
        }))
    }

    /// Fold a user-authored record. User messages skip the agent fold: a
    /// server echo of an optimistic message is matched by local id and
    /// patched with the server id and seq; anything else is appended.
    pub fn reconcile_user(
        &mut self,
        server_id: &str,
        seq: Option<u64>,
        local_id: Option<&str>,
        text: &str,
        created_at: u64,
    ) -> Option<Message> {
        if let Some(local_id) = local_id
            && let Some(message_id) = self.local_ids.get(local_id).cloned()
            && let Some(Message::UserText(existing)) = self.get_mut(&message_id)
        {
            if existing.server_id.as_deref() == Some(server_id) {
                return None;
            }
            existing.server_id = Some(server_id.to_string());
            existing.seq = seq;
            return Some(Message::UserText(existing.clone()));
        }

        if self.positions.contains_key(server_id) {
            return None;
        }
        if let Some(local_id) = local_id {
            self.local_ids
                .insert(local_id.to_string(), server_id.to_string());
        }
        Some(self.push(Message::UserText(UserTextMessage {
            id: server_id.to_string(),
            local_id: local_id.map(str::to_string),
            server_id: Some(server_id.to_string()),
            seq,
            text: text.to_string(),
            created_at,
        })))
    }
}

/// The fold itself. Stateless; all state lives in [`ReducerState`].
pub struct Reducer;

impl Reducer {
    /// Fold one decrypted event. Returns the messages it created or changed.
    pub fn apply(state: &mut ReducerState, message: &DecryptedMessage) -> Vec<Message> {
        if !state.processed.insert(message.id.clone()) {
            return Vec::new();
        }
        let Some(record) = &message.content else {
            return Vec::new();
        };

        match record {
            RawRecord::User(user) => {
                let UserContent::Text { text } = &user.content;
                let local_id = message.local_id.as_deref().or(user.local_key.as_deref());
                state
                    .reconcile_user(&message.id, message.seq, local_id, text, message.created_at)
                    .into_iter()
                    .collect()
            }
            RawRecord::Agent(agent) => match &agent.content {
                AgentContent::Output { blocks } => {
                    Self::apply_blocks(state, &message.id, message.created_at, blocks)
                }
                AgentContent::Todos { todos } => {
                    let previous = std::mem::replace(&mut state.todos, todos.clone());
                    state.old_todos = Some(previous);
                    Vec::new()
                }
                AgentContent::Event { event } => {
                    if matches!(event, AgentEvent::Ready) {
                        return Vec::new();
                    }
                    vec![state.push(Message::Event(EventMessage {
                        id: message.id.clone(),
                        event: event.clone(),
                        created_at: message.created_at,
                    }))]
                }
            },
        }
    }

    /// Fold a batch in order, returning every change.
    pub fn apply_all(state: &mut ReducerState, messages: &[DecryptedMessage]) -> Vec<Message> {
        messages
            .iter()
            .flat_map(|m| Self::apply(state, m))
            .collect()
    }

    fn apply_blocks(
        state: &mut ReducerState,
        event_id: &str,
        at: u64,
        blocks: &[ContentBlock],
    ) -> Vec<Message> {
        let mut changed = Vec::new();
        for (index, block) in blocks.iter().enumerate() {
            match block {
                ContentBlock::Text { text } => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    changed.push(state.push(Message::AgentText(AgentTextMessage {
                        id: format!("{event_id}:{index}"),
                        text: text.clone(),
                        created_at: at,
                    })));
                }
                ContentBlock::ToolUse {
                    id,
                    name,
                    input,
                    description,
                } => {
                    if state.tools.contains_key(id) {
                        continue;
                    }
                    let mut tool = ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                        description: description.clone(),
                        state: ToolState::Running,
                        result: None,
                        permission: state.early_permissions.remove(id),
                        started_at: at,
                        completed_at: None,
                    };
                    if let Some(result) = state.early_results.remove(id) {
                        finish(&mut tool, result);
                    }
                    state.tools.insert(id.clone(), id.clone());
                    changed.push(state.push(Message::ToolCall(ToolCallMessage {
                        id: id.clone(),
                        tool,
                    })));
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    let result = PendingResult {
                        content: content.clone(),
                        is_error: *is_error,
                        at,
                    };
                    let Some(message_id) = state.tools.get(tool_use_id).cloned() else {
                        state.early_results.insert(tool_use_id.clone(), result);
                        continue;
                    };
                    if let Some(Message::ToolCall(call)) = state.get_mut(&message_id)
                        && call.tool.state == ToolState::Running
                    {
                        finish(&mut call.tool, result);
                        changed.push(Message::ToolCall(call.clone()));
                    }
                }
            }
        }
        changed
    }

    /// Attach permission status from the session's agent state to tool calls.
    /// Decisions for tools not folded yet are held until the tool appears.
    /// A completed decision wins over a pending request with the same id.
    pub fn apply_agent_state(state: &mut ReducerState, agent_state: &AgentState) -> Vec<Message> {
        let mut decisions: Vec<(String, ToolPermission)> = agent_state
            .requests
            .keys()
            .filter(|id| !agent_state.completed_requests.contains_key(*id))
            .map(|id| {
                (
                    id.clone(),
                    ToolPermission {
                        status: PermissionStatus::Pending,
                        reason: None,
                        mode: None,
                    },
                )
            })
            .collect();
        decisions.extend(agent_state.completed_requests.iter().map(|(id, done)| {
            (
                id.clone(),
                ToolPermission {
                    status: done.status.into(),
                    reason: done.reason.clone(),
                    mode: done.mode.clone(),
                },
            )
        }));

        let mut changed = Vec::new();
        for (tool_id, permission) in decisions {
            let Some(message_id) = state.tools.get(&tool_id).cloned() else {
                state.early_permissions.insert(tool_id, permission);
                continue;
            };
            if let Some(Message::ToolCall(call)) = state.get_mut(&message_id)
                && call.tool.permission.as_ref() != Some(&permission)
            {
                call.tool.permission = Some(permission);
                changed.push(Message::ToolCall(call.clone()));
            }
        }
        changed
    }
}

fn finish(tool: &mut ToolCall, result: PendingResult) {
    tool.state = if result.is_error {
        ToolState::Error
    } else {
        ToolState::Completed
    };
    tool.result = Some(result.content);
    tool.completed_at = Some(result.at);
}

// ---------------------------------------------------------------------------
// View grouping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ViewItem<'a> {
    Message(&'a Message),
    /// A run of two or more consecutive tool calls.
    ToolCallGroup {
        id: String,
        children: Vec<&'a Message>,
    },
}

/// Collapse consecutive tool-call runs for display. The canonical list is
/// never modified.
pub fn group_tool_calls(messages: &[Message]) -> Vec<ViewItem<'_>> {
    let mut items = Vec::new();
    let mut run: Vec<&Message> = Vec::new();

    fn close<'a>(run: &mut Vec<&'a Message>, items: &mut Vec<ViewItem<'a>>) {
        match run.len() {
            0 => {}
            1 => items.push(ViewItem::Message(run[0])),
            _ => items.push(ViewItem::ToolCallGroup {
                id: format!("group:{}", run[0].id()),
                children: std::mem::take(run),
            }),
        }
        run.clear();
    }

    for message in messages {
        if matches!(message, Message::ToolCall(_)) {
            run.push(message);
        } else {
            close(&mut run, &mut items);
            items.push(ViewItem::Message(message));
        }
    }
    close(&mut run, &mut items);
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tether_protocol::domain::{
        CompletedRequest, PermissionRequest, TodoStatus, UserRecord,
    };

    fn event(id: &str, seq: u64, record: RawRecord) -> DecryptedMessage {
        DecryptedMessage {
            id: id.to_string(),
            seq: Some(seq),
            local_id: None,
            content: Some(record),
            created_at: seq * 100,
        }
    }

    fn output(blocks: Vec<ContentBlock>) -> RawRecord {
        RawRecord::agent(AgentContent::Output { blocks })
    }

    fn tool_use(id: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: "Bash".to_string(),
            input: json!({"command": "cargo fmt"}),
            description: None,
        }
    }

    fn tool_result(id: &str, is_error: bool) -> ContentBlock {
        ContentBlock::ToolResult {
            tool_use_id: id.to_string(),
            content: json!("done"),
            is_error,
        }
    }

    fn tool(state: &ReducerState, id: &str) -> ToolCall {
        match state.message(id) {
            Some(Message::ToolCall(call)) => call.tool.clone(),
            other => panic!("expected tool call {id}, got {other:?}"),
        }
    }

    fn log() -> Vec<DecryptedMessage> {
        vec![
            event("e1", 1, RawRecord::user_text("fix the build", None)),
            event(
                "e2",
                2,
                output(vec![
                    ContentBlock::Text {
                        text: "Looking.".into(),
                    },
                    tool_use("t1"),
                ]),
            ),
            event("e3", 3, output(vec![tool_result("t1", false), tool_use("t2")])),
            event("e4", 4, output(vec![tool_result("t2", true)])),
        ]
    }

    #[test]
    fn tool_result_updates_call_in_place() {
        let mut state = ReducerState::default();
        Reducer::apply_all(&mut state, &log()[..2]);
        assert_eq!(tool(&state, "t1").state, ToolState::Running);
        let count = state.messages().len();

        let changed = Reducer::apply(&mut state, &log()[2]);
        assert_eq!(tool(&state, "t1").state, ToolState::Completed);
        assert_eq!(tool(&state, "t1").completed_at, Some(300));
        assert_eq!(state.messages().len(), count + 1);
        assert_eq!(changed.len(), 2);

        Reducer::apply(&mut state, &log()[3]);
        assert_eq!(tool(&state, "t2").state, ToolState::Error);
    }

    #[test]
    fn applying_twice_is_a_no_op() {
        let mut once = ReducerState::default();
        Reducer::apply_all(&mut once, &log());

        let mut twice = ReducerState::default();
        Reducer::apply_all(&mut twice, &log());
        let changed = Reducer::apply_all(&mut twice, &log());

        assert!(changed.is_empty());
        assert_eq!(once.messages(), twice.messages());
    }

    #[test]
    fn replaying_any_prefix_converges() {
        let events = log();
        let mut expected = ReducerState::default();
        Reducer::apply_all(&mut expected, &events);

        for cut in 0..=events.len() {
            let mut state = ReducerState::default();
            Reducer::apply_all(&mut state, &events[..cut]);
            Reducer::apply_all(&mut state, &events);
            assert_eq!(state.messages(), expected.messages(), "prefix {cut}");
        }
    }

    #[test]
    fn early_result_is_attached_when_tool_starts() {
        let mut state = ReducerState::default();
        Reducer::apply(&mut state, &event("e1", 1, output(vec![tool_result("t9", false)])));
        assert!(state.messages().is_empty());

        Reducer::apply(&mut state, &event("e2", 2, output(vec![tool_use("t9")])));
        let call = tool(&state, "t9");
        assert_eq!(call.state, ToolState::Completed);
        assert_eq!(call.result, Some(json!("done")));
    }

    #[test]
    fn undecryptable_event_is_recorded_but_emits_nothing() {
        let mut state = ReducerState::default();
        let broken = DecryptedMessage {
            content: None,
            ..event("e1", 1, RawRecord::user_text("x", None))
        };
        assert!(Reducer::apply(&mut state, &broken).is_empty());
        assert!(state.is_processed("e1"));
        assert!(state.messages().is_empty());
    }

    #[test]
    fn optimistic_message_is_patched_by_echo() {
        let mut state = ReducerState::default();
        state.push_optimistic("local-1", "hello", 50);

        let echo = DecryptedMessage {
            id: "srv-1".into(),
            seq: Some(12),
            local_id: None,
            content: Some(RawRecord::User(UserRecord {
                content: UserContent::Text {
                    text: "hello".into(),
                },
                local_key: Some("local-1".into()),
                meta: None,
            })),
            created_at: 60,
        };
        let changed = Reducer::apply(&mut state, &echo);

        assert_eq!(state.messages().len(), 1);
        assert_eq!(changed.len(), 1);
        let Message::UserText(user) = &state.messages()[0] else {
            panic!("expected user text");
        };
        assert_eq!(user.id, "local-1");
        assert_eq!(user.server_id.as_deref(), Some("srv-1"));
        assert_eq!(user.seq, Some(12));
    }

    #[test]
    fn todos_keep_previous_snapshot() {
        let mut state = ReducerState::default();
        let todo = |id: &str, status| TodoItem {
            id: id.into(),
            content: format!("task {id}"),
            status,
            priority: None,
        };
        let first = vec![todo("1", TodoStatus::Pending)];
        let second = vec![todo("1", TodoStatus::Completed), todo("2", TodoStatus::InProgress)];

        Reducer::apply(
            &mut state,
            &event("e1", 1, RawRecord::agent(AgentContent::Todos { todos: first.clone() })),
        );
        Reducer::apply(
            &mut state,
            &event("e2", 2, RawRecord::agent(AgentContent::Todos { todos: second.clone() })),
        );
        assert_eq!(state.todos(), second.as_slice());
        assert_eq!(state.old_todos(), Some(first.as_slice()));
        assert!(state.messages().is_empty());
    }

    #[test]
    fn ready_event_is_silent_other_events_are_messages() {
        let mut state = ReducerState::default();
        let ready = RawRecord::agent(AgentContent::Event {
            event: AgentEvent::Ready,
        });
        let switch = RawRecord::agent(AgentContent::Event {
            event: AgentEvent::SwitchMode {
                mode: "plan".into(),
            },
        });
        assert!(Reducer::apply(&mut state, &event("e1", 1, ready)).is_empty());
        assert_eq!(Reducer::apply(&mut state, &event("e2", 2, switch)).len(), 1);
        assert!(matches!(state.messages()[0], Message::Event(_)));
    }

    #[test]
    fn permissions_attach_now_or_later() {
        let mut state = ReducerState::default();
        Reducer::apply(&mut state, &event("e1", 1, output(vec![tool_use("t1")])));

        let mut requests = BTreeMap::new();
        requests.insert(
            "t1".to_string(),
            PermissionRequest {
                tool: "Bash".into(),
                arguments: json!({}),
                created_at: None,
            },
        );
        let mut completed_requests = BTreeMap::new();
        completed_requests.insert(
            "t2".to_string(),
            CompletedRequest {
                tool: "Edit".into(),
                arguments: json!({}),
                status: PermissionOutcome::Denied,
                reason: Some("no".into()),
                mode: None,
                completed_at: None,
            },
        );
        let agent_state = AgentState {
            controlled_by_user: None,
            requests,
            completed_requests,
        };

        let changed = Reducer::apply_agent_state(&mut state, &agent_state);
        assert_eq!(changed.len(), 1);
        assert_eq!(
            tool(&state, "t1").permission.map(|p| p.status),
            Some(PermissionStatus::Pending)
        );
        assert!(Reducer::apply_agent_state(&mut state, &agent_state).is_empty());

        Reducer::apply(&mut state, &event("e2", 2, output(vec![tool_use("t2")])));
        assert_eq!(
            tool(&state, "t2").permission.map(|p| p.status),
            Some(PermissionStatus::Denied)
        );
    }

    #[test]
    fn completed_decision_supersedes_pending_request() {
        let mut state = ReducerState::default();
        Reducer::apply(&mut state, &event("e1", 1, output(vec![tool_use("t1")])));

        let mut requests = BTreeMap::new();
        requests.insert(
            "t1".to_string(),
            PermissionRequest {
                tool: "Bash".into(),
                arguments: json!({}),
                created_at: None,
            },
        );
        let mut completed_requests = BTreeMap::new();
        completed_requests.insert(
            "t1".to_string(),
            CompletedRequest {
                tool: "Bash".into(),
                arguments: json!({}),
                status: PermissionOutcome::Approved,
                reason: None,
                mode: None,
                completed_at: None,
            },
        );
        let agent_state = AgentState {
            controlled_by_user: None,
            requests,
            completed_requests,
        };

        let changed = Reducer::apply_agent_state(&mut state, &agent_state);
        assert_eq!(changed.len(), 1);
        assert_eq!(
            tool(&state, "t1").permission.map(|p| p.status),
            Some(PermissionStatus::Approved)
        );
    }

    #[test]
    fn consecutive_tool_calls_are_grouped_for_display() {
        let mut state = ReducerState::default();
        Reducer::apply_all(
            &mut state,
            &[
                event("e1", 1, output(vec![tool_use("a"), tool_use("b")])),
                event("e2", 2, RawRecord::user_text("next", None)),
                event("e3", 3, output(vec![tool_use("c")])),
            ],
        );
        let view = group_tool_calls(state.messages());
        assert_eq!(view.len(), 3);
        match &view[0] {
            ViewItem::ToolCallGroup { id, children } => {
                assert_eq!(id, "group:a");
                assert_eq!(children.len(), 2);
            }
            other => panic!("expected group, got {other:?}"),
        }
        assert!(matches!(view[2], ViewItem::Message(Message::ToolCall(_))));
        assert_eq!(state.messages().len(), 4);
    }
}
