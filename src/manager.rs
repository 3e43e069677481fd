//! Agent Manager — orchestrates a fleet of agents: registration, the state
//! machine governing a process-wide run, transfer handoffs, and metrics.
//!
//! Grounded in `original_source/src/cue/_agent_manager.py` and
//! `_agent_state_manager.py`. The teacher crate is single-agent; this is the
//! chief expansion over it.

use crate::agent::Agent;
use crate::error::{ErrorReport, ErrorType, ManagerError, MonitoringClient, Severity};
use crate::types::*;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// Manager state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Initializing,
    Ready,
    Running,
    Stopped,
    Error(String),
    Cleaning,
}

impl ManagerState {
    fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Initializing => "INITIALIZING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Error(_) => "ERROR",
            Self::Cleaning => "CLEANING",
        }
    }
}

/// Per-agent runtime state (IDLE/RUNNING/PAUSED/ERROR/STOPPED), distinct
/// from the manager's own process state machine above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerAgentState {
    Idle,
    Running,
    Paused,
    Error,
    Stopped,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub from_agent_id: String,
    pub to_agent_id: String,
    pub succeeded: bool,
    pub timestamp_ms: u64,
}

#[derive(Debug, Default)]
pub struct ManagerMetrics {
    pub total_transfers: u64,
    pub successful_transfers: u64,
    pub failed_transfers: u64,
    pub total_runs: u64,
    pub errors_by_type: HashMap<String, u64>,
    pub recent_transfers: VecDeque<TransferRecord>,
    start_ms: u64,
}

impl ManagerMetrics {
    const MAX_RECENT_TRANSFERS: usize = 10;

    fn new() -> Self {
        Self {
            start_ms: now_ms(),
            ..Default::default()
        }
    }

    fn record_transfer(&mut self, record: TransferRecord) {
        self.total_transfers += 1;
        if record.succeeded {
            self.successful_transfers += 1;
        } else {
            self.failed_transfers += 1;
        }
        self.recent_transfers.push_back(record);
        if self.recent_transfers.len() > Self::MAX_RECENT_TRANSFERS {
            self.recent_transfers.pop_front();
        }
    }

    fn record_error(&mut self, type_name: &str) {
        *self.errors_by_type.entry(type_name.to_string()).or_insert(0) += 1;
    }

    pub fn uptime_seconds(&self) -> u64 {
        now_ms().saturating_sub(self.start_ms) / 1000
    }
}

// ---------------------------------------------------------------------------
// Registry entry
// ---------------------------------------------------------------------------

struct AgentEntry {
    agent: Mutex<Agent>,
    is_primary: bool,
    per_agent_state: Mutex<PerAgentState>,
    last_sequence_ms: AtomicI64,
}

/// Per-agent run metadata passed to `start_run`: turn/token budget for this
/// invocation and an optional run-mode switch (detached "runner" vs. awaited).
#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub max_turns: usize,
    pub detached: bool,
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self {
            max_turns: 50,
            detached: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent Manager
// ---------------------------------------------------------------------------

/// Orchestrates a fleet of agents through one coherent process state
/// machine. Per-agent mutation is guarded by a lock per registry entry
/// (mirrors `_agent_state_manager.py`'s per-agent lock map); registry
/// mutation (`register_agent`/`clean_up`) is guarded by the manager's own
/// state, which forbids registration once `Running`.
pub struct AgentManager {
    state: Mutex<ManagerState>,
    agents: Mutex<HashMap<String, Arc<AgentEntry>>>,
    primary_id: Mutex<Option<String>>,
    active_id: Mutex<Option<String>>,
    metrics: Mutex<ManagerMetrics>,
    monitoring: Mutex<Option<Arc<dyn MonitoringClient>>>,
}

impl Default for AgentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManagerState::Uninitialized),
            agents: Mutex::new(HashMap::new()),
            primary_id: Mutex::new(None),
            active_id: Mutex::new(None),
            metrics: Mutex::new(ManagerMetrics::new()),
            monitoring: Mutex::new(None),
        }
    }

    /// Attach a monitoring collaborator. `_handle_transfer` reports an
    /// unknown-target failure through it (SPEC §4.G/§7 "report to
    /// monitoring"); without one, the failure is still recorded in
    /// `ManagerMetrics` but not shipped anywhere.
    pub async fn set_monitoring(&self, monitoring: Arc<dyn MonitoringClient>) {
        *self.monitoring.lock().await = Some(monitoring);
    }

    pub async fn state(&self) -> ManagerState {
        self.state.lock().await.clone()
    }

    /// Guarded transition; invalid pairs are a programmer error (fail fast),
    /// per spec.md's state-machine violation policy.
    async fn transition(&self, to: ManagerState) -> Result<(), ManagerError> {
        let mut state = self.state.lock().await;
        let valid = matches!(
            (&*state, &to),
            (ManagerState::Uninitialized, ManagerState::Initializing)
                | (ManagerState::Initializing, ManagerState::Ready)
                | (ManagerState::Ready, ManagerState::Running)
                | (ManagerState::Running, ManagerState::Stopped)
                | (ManagerState::Running, ManagerState::Error(_))
                | (ManagerState::Stopped, ManagerState::Ready)
                | (ManagerState::Error(_), ManagerState::Ready)
                | (_, ManagerState::Cleaning)
                | (ManagerState::Cleaning, ManagerState::Uninitialized)
        );
        if !valid {
            return Err(ManagerError::InvalidTransition {
                from: state.name().to_string(),
                to: to.name().to_string(),
            });
        }
        *state = to;
        Ok(())
    }

    /// Register an agent. Returns `Ok(())` whether or not `id` was already
    /// present — re-registering the same id is a no-op, matching
    /// `register_agent`'s "returns existing agent if id already present".
    /// At most one primary ever wins: the first registration flagged
    /// `is_primary=true`.
    pub async fn register_agent(&self, id: impl Into<String>, agent: Agent, is_primary: bool) -> Result<(), ManagerError> {
        let id = id.into();
        let mut agents = self.agents.lock().await;
        if agents.contains_key(&id) {
            return Ok(());
        }

        let mut primary_id = self.primary_id.lock().await;
        let actually_primary = is_primary && primary_id.is_none();
        if actually_primary {
            *primary_id = Some(id.clone());
        }

        agents.insert(
            id.clone(),
            Arc::new(AgentEntry {
                agent: Mutex::new(agent),
                is_primary: actually_primary,
                per_agent_state: Mutex::new(PerAgentState::Idle),
                last_sequence_ms: AtomicI64::new(0),
            }),
        );

        // First registration ever becomes primary if none was flagged,
        // satisfying "find_primary_agent_id marks the first agent primary
        // if none existed".
        if primary_id.is_none() && agents.len() == 1 {
            *primary_id = Some(id);
        }

        Ok(())
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.lock().await.len()
    }

    pub async fn primary_agent_id(&self) -> Option<String> {
        self.primary_id.lock().await.clone()
    }

    /// Construct shared collaborators and set every registered agent to
    /// IDLE. Idempotent: calling twice after `Ready` is a no-op.
    pub async fn initialize(&self) -> Result<(), ManagerError> {
        if *self.state.lock().await == ManagerState::Ready {
            return Ok(());
        }
        self.transition(ManagerState::Initializing).await?;

        let agents = self.agents.lock().await;
        for entry in agents.values() {
            *entry.per_agent_state.lock().await = PerAgentState::Idle;
        }
        drop(agents);

        self.transition(ManagerState::Ready).await
    }

    fn next_sequence(entry: &AgentEntry) -> i64 {
        let now = now_ms() as i64;
        let last = entry.last_sequence_ms.load(Ordering::SeqCst);
        let next = now.max(last + 1);
        entry.last_sequence_ms.store(next, Ordering::SeqCst);
        next
    }

    /// Start a run on `active_agent_id` with the given prompt text.
    /// Dispatches to the agent's own `agent_loop` via `Agent::prompt`, then
    /// handles any `AgentTransfer` the loop surfaces by looping onto the
    /// target agent (`_execute_run`/`_handle_transfer`).
    pub async fn start_run(
        &self,
        active_agent_id: &str,
        message: impl Into<String>,
        run_metadata: RunMetadata,
    ) -> Result<Vec<AgentMessage>, ManagerError> {
        self.transition(ManagerState::Running).await?;
        *self.active_id.lock().await = Some(active_agent_id.to_string());

        self.metrics.lock().await.total_runs += 1;

        let mut current_agent_id = active_agent_id.to_string();
        let mut current_message = message.into();
        let mut all_messages = Vec::new();

        loop {
            let entry = self.entry(&current_agent_id).await?;
            *entry.per_agent_state.lock().await = PerAgentState::Running;
            Self::next_sequence(&entry);

            let mut agent = entry.agent.lock().await;
            agent.execution_limits = Some(crate::context::ExecutionLimits {
                max_turns: run_metadata.max_turns,
                ..crate::context::ExecutionLimits::default()
            });
            let mut rx = agent.prompt(current_message.clone()).await;
            drop(agent);

            let mut turn_messages = Vec::new();
            let mut transfer: Option<AgentTransfer> = None;
            while let Some(event) = rx.recv().await {
                match event {
                    AgentEvent::AgentEnd { messages } => turn_messages = messages,
                    AgentEvent::Transfer { transfer: t } => transfer = Some(t),
                    _ => {}
                }
            }

            *entry.per_agent_state.lock().await = PerAgentState::Idle;
            all_messages.extend(turn_messages);

            match transfer {
                Some(transfer) => {
                    let (target_id, handoff_message) = self.handle_transfer(&current_agent_id, transfer).await?;
                    current_agent_id = target_id;
                    current_message = handoff_message;
                }
                None => break,
            }
        }

        self.transition(ManagerState::Stopped).await.ok();
        self.transition(ManagerState::Ready).await.ok();
        Ok(all_messages)
    }

    async fn entry(&self, id: &str) -> Result<Arc<AgentEntry>, ManagerError> {
        self.agents
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::AgentNotFound(id.to_string()))
    }

    /// Resolve `transfer`'s target, build the carried context, and switch
    /// the active agent. Returns `(target_agent_id, opening_message)` for
    /// the next `_execute_run` iteration. An unknown target does not change
    /// the active agent and is reported rather than propagated.
    async fn handle_transfer(
        &self,
        from_agent_id: &str,
        mut transfer: AgentTransfer,
    ) -> Result<(String, String), ManagerError> {
        if transfer.transfer_to_primary {
            transfer.to_agent_id = self.primary_agent_id().await;
        }

        let target_id = match &transfer.to_agent_id {
            Some(id) if self.agents.lock().await.contains_key(id) => id.clone(),
            _ => {
                self.metrics.lock().await.record_transfer(TransferRecord {
                    from_agent_id: from_agent_id.to_string(),
                    to_agent_id: transfer.to_agent_id.clone().unwrap_or_default(),
                    succeeded: false,
                    timestamp_ms: now_ms(),
                });
                self.metrics.lock().await.record_error("TransferTargetNotFound");

                let report = ErrorReport::new(
                    ErrorType::Transfer,
                    format!(
                        "transfer target '{}' not found",
                        transfer.to_agent_id.as_deref().unwrap_or("<none>")
                    ),
                )
                .with_severity(Severity::Warning)
                .with_assistant(from_agent_id);
                if let Some(monitoring) = self.monitoring.lock().await.as_ref() {
                    monitoring.report_error(&report).await;
                }

                // Remain on the source agent: surface the failure as its
                // next prompt instead of crashing the run.
                return Ok((
                    from_agent_id.to_string(),
                    format!(
                        "[Transfer failed: target agent '{}' not found]",
                        transfer.to_agent_id.as_deref().unwrap_or("<none>")
                    ),
                ));
            }
        };

        *self.active_id.lock().await = Some(target_id.clone());
        self.metrics.lock().await.record_transfer(TransferRecord {
            from_agent_id: from_agent_id.to_string(),
            to_agent_id: target_id.clone(),
            succeeded: true,
            timestamp_ms: now_ms(),
        });

        let background = self.build_context_for_agent(from_agent_id, transfer.clamped_max_messages()).await;
        let opening = if background.is_empty() {
            transfer.message
        } else {
            format!(
                "Here is context from {} <background>{}</background>\n\n{}",
                from_agent_id, background, transfer.message
            )
        };

        Ok((target_id, opening))
    }

    /// Concatenate the last `max_messages` text-bearing messages from
    /// `agent_id`'s buffer into one string, empty if `max_messages == 0`.
    async fn build_context_for_agent(&self, agent_id: &str, max_messages: usize) -> String {
        if max_messages == 0 {
            return String::new();
        }
        let Ok(entry) = self.entry(agent_id).await else {
            return String::new();
        };
        let agent = entry.agent.lock().await;
        agent
            .messages()
            .iter()
            .rev()
            .take(max_messages)
            .filter_map(|m| m.as_llm())
            .filter_map(|m| match m {
                Message::User { content, .. } | Message::Assistant { content, .. } => Some(content),
                _ => None,
            })
            .flat_map(|content| content.iter())
            .filter_map(|c| match c {
                Content::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Append a stop notice and abort the agent's in-flight loop. Grace
    /// period mirrors `stop_run`: `Agent::abort()` cancels the loop's
    /// `CancellationToken`, which `run_loop` observes at its next check —
    /// we give it 2s to unwind before moving on regardless.
    pub async fn stop_run(&self, agent_id: &str) -> Result<(), ManagerError> {
        let entry = self.entry(agent_id).await?;
        *entry.per_agent_state.lock().await = PerAgentState::Stopped;

        let mut agent = entry.agent.lock().await;
        agent.append_message(AgentMessage::Extension {
            role: "system".into(),
            data: serde_json::json!({ "text": "Run stopped by user request." }),
        });
        agent.abort();
        drop(agent);

        tokio::time::sleep(std::time::Duration::from_secs(2)).await;

        self.transition(ManagerState::Stopped).await
    }

    /// Abort every agent's in-flight run, then empty the registry.
    pub async fn clean_up(&self) -> Result<(), ManagerError> {
        self.transition(ManagerState::Cleaning).await?;

        let agents = self.agents.lock().await;
        for entry in agents.values() {
            if let Ok(agent) = entry.agent.try_lock() {
                agent.abort();
            }
        }
        drop(agents);

        self.agents.lock().await.clear();
        *self.primary_id.lock().await = None;
        *self.active_id.lock().await = None;

        self.transition(ManagerState::Uninitialized).await
    }

    pub async fn metrics_snapshot(&self) -> ManagerMetricsSnapshot {
        let metrics = self.metrics.lock().await;
        ManagerMetricsSnapshot {
            total_transfers: metrics.total_transfers,
            successful_transfers: metrics.successful_transfers,
            failed_transfers: metrics.failed_transfers,
            total_runs: metrics.total_runs,
            errors_by_type: metrics.errors_by_type.clone(),
            recent_transfers: metrics.recent_transfers.iter().cloned().collect(),
            uptime_seconds: metrics.uptime_seconds(),
        }
    }
}

/// Cloneable, read-only view of `ManagerMetrics` for reporting over the
/// event bus or a status endpoint.
#[derive(Debug, Clone)]
pub struct ManagerMetricsSnapshot {
    pub total_transfers: u64,
    pub successful_transfers: u64,
    pub failed_transfers: u64,
    pub total_runs: u64,
    pub errors_by_type: HashMap<String, u64>,
    pub recent_transfers: Vec<TransferRecord>,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderError, StreamConfig, StreamEvent, StreamProvider};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct EchoProvider;

    #[async_trait]
    impl StreamProvider for EchoProvider {
        async fn stream(
            &self,
            _config: StreamConfig,
            _tx: mpsc::UnboundedSender<StreamEvent>,
            _cancel: tokio_util::sync::CancellationToken,
        ) -> Result<Message, ProviderError> {
            Ok(Message::Assistant {
                content: vec![Content::Text {
                    text: "hello".into(),
                }],
                stop_reason: StopReason::Stop,
                model: "mock".into(),
                provider: "mock".into(),
                usage: Usage::default(),
                timestamp: now_ms(),
                error_message: None,
            })
        }
    }

    #[tokio::test]
    async fn test_register_agent_sets_primary_once() {
        let manager = AgentManager::new();
        manager
            .register_agent("main", Agent::new(EchoProvider), true)
            .await
            .unwrap();
        manager
            .register_agent("helper", Agent::new(EchoProvider), true)
            .await
            .unwrap();

        assert_eq!(manager.primary_agent_id().await, Some("main".to_string()));
        assert_eq!(manager.agent_count().await, 2);
    }

    #[tokio::test]
    async fn test_register_agent_twice_is_noop() {
        let manager = AgentManager::new();
        manager
            .register_agent("main", Agent::new(EchoProvider), true)
            .await
            .unwrap();
        manager
            .register_agent("main", Agent::new(EchoProvider), false)
            .await
            .unwrap();
        assert_eq!(manager.agent_count().await, 1);
    }

    #[tokio::test]
    async fn test_initialize_then_run() {
        let manager = AgentManager::new();
        manager
            .register_agent("main", Agent::new(EchoProvider).with_model("mock"), true)
            .await
            .unwrap();
        manager.initialize().await.unwrap();
        assert_eq!(manager.state().await, ManagerState::Ready);

        let messages = manager
            .start_run("main", "hi", RunMetadata::default())
            .await
            .unwrap();
        assert!(!messages.is_empty());
        assert_eq!(manager.state().await, ManagerState::Ready);
    }

    #[tokio::test]
    async fn test_transfer_to_unknown_agent_stays_on_source() {
        let manager = AgentManager::new();
        manager
            .register_agent("main", Agent::new(EchoProvider).with_model("mock"), true)
            .await
            .unwrap();
        manager.initialize().await.unwrap();

        let (target, msg) = manager
            .handle_transfer(
                "main",
                AgentTransfer {
                    to_agent_id: Some("ghost".into()),
                    message: "take over".into(),
                    max_messages: 2,
                    transfer_to_primary: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(target, "main");
        assert!(msg.contains("not found"));
        let snapshot = manager.metrics_snapshot().await;
        assert_eq!(snapshot.failed_transfers, 1);
    }
}
