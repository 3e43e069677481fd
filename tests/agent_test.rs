//! Tests for the Agent struct (stateful wrapper).

use agentrt::agent::Agent;
use agentrt::error::StorageError;
use agentrt::provider::mock::*;
use agentrt::provider::MockProvider;
use agentrt::{StorageClient, *};
use std::sync::Arc;
use tokio::sync::Mutex;

#[tokio::test]
async fn test_agent_simple_prompt() {
    let provider = MockProvider::text("Hello!");
    let mut agent = Agent::new(provider)
        .with_system_prompt("You are helpful.")
        .with_model("mock")
        .with_api_key("test");

    let rx = agent.prompt("Hi there").await;

    // Drain events
    let mut events = Vec::new();
    let mut rx = rx;
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }

    assert!(!events.is_empty());
    assert_eq!(agent.messages().len(), 2); // user + assistant
}

#[tokio::test]
async fn test_agent_reset() {
    let provider = MockProvider::text("Hello!");
    let mut agent = Agent::new(provider)
        .with_system_prompt("test")
        .with_model("mock")
        .with_api_key("test");

    let _ = agent.prompt("Hi").await;
    assert!(!agent.messages().is_empty());

    agent.reset();
    assert!(agent.messages().is_empty());
    assert!(!agent.is_streaming());
}

#[tokio::test]
async fn test_agent_with_tools() {
    struct EchoTool;

    #[async_trait::async_trait]
    impl AgentTool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn label(&self) -> &str {
            "Echo"
        }
        fn description(&self) -> &str {
            "Echoes input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(
            &self,
            _id: &str,
            params: serde_json::Value,
            _cancel: tokio_util::sync::CancellationToken,
            _on_update: Option<ToolUpdateFn>,
        ) -> Result<ToolResult, ToolError> {
            let text = params["text"].as_str().unwrap_or("").to_string();
            Ok(ToolResult {
                content: vec![Content::Text { text }],
                details: serde_json::Value::Null,
            })
        }
    }

    let provider = MockProvider::new(vec![
        MockResponse::ToolCalls(vec![MockToolCall {
            name: "echo".into(),
            arguments: serde_json::json!({"text": "hello"}),
        }]),
        MockResponse::Text("Echoed: hello".into()),
    ]);

    let mut agent = Agent::new(provider)
        .with_system_prompt("test")
        .with_model("mock")
        .with_api_key("test")
        .with_tools(vec![Box::new(EchoTool)]);

    let _ = agent.prompt("Echo hello").await;

    // user + assistant(tool_call) + toolResult + assistant(text)
    assert_eq!(agent.messages().len(), 4);
}

#[tokio::test]
async fn test_agent_builder_pattern() {
    let provider = MockProvider::text("ok");
    let agent = Agent::new(provider)
        .with_system_prompt("sys")
        .with_model("test-model")
        .with_api_key("key123")
        .with_thinking(ThinkingLevel::Medium)
        .with_max_tokens(4096);

    assert_eq!(agent.system_prompt, "sys");
    assert_eq!(agent.model, "test-model");
    assert_eq!(agent.api_key, "key123");
    assert_eq!(agent.thinking_level, ThinkingLevel::Medium);
    assert_eq!(agent.max_tokens, Some(4096));
}

struct MemoryStorage {
    stored: Mutex<Vec<AgentMessage>>,
}

#[async_trait::async_trait]
impl StorageClient for MemoryStorage {
    async fn load_recent(
        &self,
        _agent_id: &str,
        limit: usize,
    ) -> Result<Vec<AgentMessage>, StorageError> {
        let stored = self.stored.lock().await;
        Ok(stored.iter().rev().take(limit).rev().cloned().collect())
    }

    async fn persist(&self, msg: &AgentMessage) -> Result<String, StorageError> {
        self.stored.lock().await.push(msg.clone());
        Ok("msg-1".into())
    }
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let provider = MockProvider::text("ok");
    let mut agent = Agent::new(provider).with_system_prompt("sys");

    assert!(!agent.state().has_initialized);
    agent.initialize("agent-1").await;
    assert!(agent.state().has_initialized);

    agent.append_message(AgentMessage::Llm(Message::user("should survive")));
    agent.initialize("agent-1").await;
    // Second call is a no-op: the message appended after the first
    // initialize is untouched.
    assert_eq!(agent.messages().len(), 1);
}

#[tokio::test]
async fn test_initialize_loads_prior_messages_from_storage() {
    let provider = MockProvider::text("ok");
    let storage = Arc::new(MemoryStorage {
        stored: Mutex::new(vec![AgentMessage::Llm(Message::user("earlier turn"))]),
    });
    let mut agent = Agent::new(provider).with_storage(storage);

    agent.initialize("agent-1").await;

    assert_eq!(agent.messages().len(), 1);
    assert!(agent.state().has_initialized);
}

#[tokio::test]
async fn test_add_messages_updates_counters() {
    let provider = MockProvider::text("ok");
    let mut agent = Agent::new(provider);

    agent
        .add_messages(vec![
            AgentMessage::Llm(Message::user("hi")),
            AgentMessage::Llm(Message::ToolResult {
                tool_call_id: "t1".into(),
                tool_name: "bash".into(),
                content: vec![Content::Text { text: "done".into() }],
                is_error: true,
                timestamp: 0,
            }),
        ])
        .await;

    let state = agent.state();
    assert_eq!(state.counters.messages, 2);
    assert_eq!(state.counters.tool_calls, 1);
    assert_eq!(state.counters.errors, 1);
    assert!(state.last_error.is_some());
    assert!(state.token_stats.tool > 0);
}

#[tokio::test]
async fn test_reset_state_clears_stats_and_can_swap_model() {
    let provider = MockProvider::text("ok");
    let mut agent = Agent::new(provider).with_model("mock-a");

    agent
        .add_messages(vec![AgentMessage::Llm(Message::user("hi"))])
        .await;
    assert_eq!(agent.state().counters.messages, 1);

    agent.reset_state(Some("mock-b".into()));
    assert_eq!(agent.state().counters.messages, 0);
    assert_eq!(agent.model, "mock-b");
}

#[tokio::test]
async fn test_snapshot_reflects_current_buffer_and_state() {
    let provider = MockProvider::text("ok");
    let mut agent = Agent::new(provider);
    agent
        .add_messages(vec![AgentMessage::Llm(Message::user("hi"))])
        .await;

    let snapshot = agent.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.state.counters.messages, 1);
}
