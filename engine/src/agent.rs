//! The orchestration loop.
//!
//! One turn: compact the window if needed, call the provider with retry,
//! extract tool directives from the reply, run each directive through the
//! approval gate and the registry in order, feed the results back, repeat.
//! A reply with no directives is the final answer.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use ember_context::{CompactionResult, ConversationCompactor};
use ember_providers::retry::{execute_with_retry, RetryConfig};
use ember_providers::{AiRequest, AiResponse};
use ember_tools::{AgentContext, ToolRegistry};
use ember_types::{
    AiError, Message, NonEmptyString, Provider, ProviderConfig, ToolCall, ToolOutcome, ToolResult,
};

use crate::approval::{
    ApprovalDecision, ApprovalGate, ApprovalRequest, REJECTION_MESSAGE,
};
use crate::directive::{parse_directives, ToolDirective};

/// Outcome text when the user redirects a call instead of approving it.
const MODIFIED_MESSAGE: &str = "Tool execution skipped; the user provided new instructions";

/// Outcome text recorded for a call aborted mid-wait by an interrupt.
const INTERRUPTED_MESSAGE: &str = "Tool execution interrupted by user";

/// Errors that end a turn without an answer.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Provider(#[from] AiError),

    #[error("turn exceeded {limit} iterations without a final answer")]
    MaxIterations { limit: usize },

    #[error("turn interrupted by user")]
    Interrupted,
}

pub type ProviderFut<'a> = Pin<Box<dyn Future<Output = Result<AiResponse, AiError>> + Send + 'a>>;

/// Model backend seam. The production impl speaks HTTP; tests script replies.
pub trait ProviderClient: Send + Sync {
    fn send<'a>(&'a self, request: AiRequest<'a>) -> ProviderFut<'a>;
    fn provider(&self) -> Provider;
}

/// HTTP-backed provider client.
pub struct HttpProvider {
    config: ProviderConfig,
}

impl HttpProvider {
    #[must_use]
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

impl ProviderClient for HttpProvider {
    fn send<'a>(&'a self, request: AiRequest<'a>) -> ProviderFut<'a> {
        Box::pin(async move { ember_providers::send(&self.config, &request).await })
    }

    fn provider(&self) -> Provider {
        self.config.provider
    }
}

/// Progress notifications for a front end. Best-effort; a missing or closed
/// listener never stalls the turn.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Compacted {
        tokens_before: usize,
        tokens_after: usize,
    },
    AssistantReply {
        content: String,
        reasoning: Option<String>,
    },
    ToolStarted {
        call_id: String,
        tool_name: String,
    },
    ToolFinished {
        call_id: String,
        tool_name: String,
        success: bool,
    },
}

/// Tunables for [`Agent`].
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub retry: RetryConfig,
    pub max_iterations: usize,
    pub tool_timeout: Option<Duration>,
    pub max_output_tokens: u32,
    pub reasoning_enabled: bool,
    /// Start the session with the approval bypass already latched.
    pub auto_approve: bool,
    /// Tools gated even when their implementation does not ask for it.
    pub require_approval: Vec<String>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            max_iterations: 25,
            tool_timeout: Some(Duration::from_secs(120)),
            max_output_tokens: 8_192,
            reasoning_enabled: false,
            auto_approve: false,
            require_approval: Vec::new(),
        }
    }
}

/// A conversation session driving provider calls and tool execution.
pub struct Agent {
    provider: Arc<dyn ProviderClient>,
    registry: ToolRegistry,
    ctx: AgentContext,
    compactor: ConversationCompactor,
    approval: ApprovalGate,
    options: AgentOptions,
    messages: Vec<Message>,
    /// Set once the user answers "approve all"; holds for the session.
    approve_all: bool,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
    interrupt: Option<watch::Receiver<bool>>,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        registry: ToolRegistry,
        ctx: AgentContext,
        compactor: ConversationCompactor,
        approval: ApprovalGate,
        options: AgentOptions,
    ) -> Self {
        let approve_all = options.auto_approve;
        Self {
            provider,
            registry,
            ctx,
            compactor,
            approval,
            options,
            messages: Vec::new(),
            approve_all,
            events: None,
            interrupt: None,
        }
    }

    /// Install the event channel the front end listens on.
    pub fn set_event_sink(&mut self, events: mpsc::UnboundedSender<AgentEvent>) {
        self.events = Some(events);
    }

    /// Install an interrupt signal. Flipping it to `true` aborts the turn at
    /// the next await point between steps.
    pub fn set_interrupt(&mut self, interrupt: watch::Receiver<bool>) {
        self.interrupt = Some(interrupt);
    }

    pub fn set_system_prompt(&mut self, prompt: NonEmptyString) {
        self.messages.insert(0, Message::system(prompt));
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Run one full turn and return the model's final answer.
    pub async fn run_turn(&mut self, user_input: NonEmptyString) -> Result<String, EngineError> {
        self.messages.push(Message::user(user_input));

        for iteration in 0..self.options.max_iterations {
            self.compact_window();

            let response = self.call_provider().await?;
            self.emit(AgentEvent::AssistantReply {
                content: response.content.clone(),
                reasoning: response.reasoning.clone(),
            });

            let directives = parse_directives(&response.content);
            if let Ok(assistant) = Message::try_assistant(response.content) {
                self.messages.push(assistant);
            }

            if directives.is_empty() {
                let Some(Message::Assistant(reply)) = self.messages.last() else {
                    // Reply was all whitespace; treat it as an empty answer.
                    return Ok(String::new());
                };
                return Ok(reply.content().to_string());
            }

            tracing::debug!(iteration, count = directives.len(), "executing directives");
            for directive in directives {
                if self.interrupted() {
                    return Err(EngineError::Interrupted);
                }
                self.run_directive(directive).await?;
            }
        }

        Err(EngineError::MaxIterations {
            limit: self.options.max_iterations,
        })
    }

    fn compact_window(&mut self) {
        if !self.compactor.should_compact(&self.messages) {
            return;
        }
        let CompactionResult {
            messages,
            tier,
            tokens_before,
            tokens_after,
        } = self.compactor.compact(std::mem::take(&mut self.messages));
        self.messages = messages;
        if tier.is_some() {
            self.emit(AgentEvent::Compacted {
                tokens_before,
                tokens_after,
            });
        }
    }

    async fn call_provider(&mut self) -> Result<AiResponse, EngineError> {
        let provider = self.provider.clone();
        let label = provider.provider();
        let messages = &self.messages;
        let reasoning_enabled = self.options.reasoning_enabled;
        let max_output_tokens = self.options.max_output_tokens;

        let call = execute_with_retry(label, &self.options.retry, || {
            provider.send(AiRequest {
                messages,
                reasoning_enabled,
                max_output_tokens,
            })
        });

        match &mut self.interrupt {
            Some(interrupt) => {
                tokio::select! {
                    result = call => Ok(result?),
                    () = wait_for_interrupt(interrupt) => Err(EngineError::Interrupted),
                }
            }
            None => Ok(call.await?),
        }
    }

    /// Gate and execute one directive, recording the call and its result.
    /// An interrupt caught mid-wait still records a paired result before
    /// aborting the turn.
    async fn run_directive(&mut self, directive: ToolDirective) -> Result<(), EngineError> {
        let call = ToolCall::new(
            Uuid::new_v4().to_string(),
            directive.tool.clone(),
            directive.arguments(),
        );
        self.messages.push(Message::tool_use(call.clone()));

        let mut guidance = None;
        let (outcome, aborted) = match self.gate_and_execute(&call, &mut guidance).await {
            Ok(outcome) => (outcome, None),
            Err(err) => (ToolOutcome::err(INTERRUPTED_MESSAGE), Some(err)),
        };
        self.messages.push(Message::tool_result(ToolResult::new(
            call.id,
            call.name,
            outcome,
        )));
        // Guidance from a Modify follows the result so use/result stay
        // adjacent in history.
        if let Some(text) = guidance {
            if let Ok(message) = Message::try_user(text) {
                self.messages.push(message);
            }
        }

        match aborted {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn gate_and_execute(
        &mut self,
        call: &ToolCall,
        guidance: &mut Option<String>,
    ) -> Result<ToolOutcome, EngineError> {
        match self.decide(call).await? {
            ApprovalDecision::Approved => self.execute(call).await,
            ApprovalDecision::ApproveAll => {
                self.approve_all = true;
                self.execute(call).await
            }
            ApprovalDecision::Rejected => {
                tracing::info!(tool = %call.name, "tool call rejected");
                Ok(ToolOutcome::err(REJECTION_MESSAGE))
            }
            ApprovalDecision::Modify(instructions) => {
                tracing::info!(tool = %call.name, "tool call redirected");
                *guidance = Some(instructions);
                Ok(ToolOutcome::ok(serde_json::Value::String(
                    MODIFIED_MESSAGE.to_string(),
                )))
            }
        }
    }

    async fn decide(&mut self, call: &ToolCall) -> Result<ApprovalDecision, EngineError> {
        let needs_approval = self
            .registry
            .get(&call.name)
            .is_some_and(|tool| tool.requires_approval())
            || self.options.require_approval.contains(&call.name);
        // A standing "approve all" outranks per-tool gating.
        if self.approve_all || !needs_approval {
            return Ok(ApprovalDecision::Approved);
        }

        let preview = self
            .registry
            .get(&call.name)
            .map_or_else(|| call.name.clone(), |tool| {
                tool.preview(&call.arguments, &self.ctx)
            });
        let request = self.approval.request(ApprovalRequest {
            tool_name: call.name.clone(),
            preview,
        });

        match &mut self.interrupt {
            Some(interrupt) => {
                tokio::select! {
                    decision = request => Ok(decision),
                    () = wait_for_interrupt(interrupt) => Err(EngineError::Interrupted),
                }
            }
            None => Ok(request.await),
        }
    }

    async fn execute(&mut self, call: &ToolCall) -> Result<ToolOutcome, EngineError> {
        self.emit(AgentEvent::ToolStarted {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
        });
        let run = self.registry.execute(
            &call.name,
            call.arguments.clone(),
            &mut self.ctx,
            self.options.tool_timeout,
        );
        let outcome = match &mut self.interrupt {
            Some(interrupt) => {
                tokio::select! {
                    outcome = run => outcome,
                    () = wait_for_interrupt(interrupt) => return Err(EngineError::Interrupted),
                }
            }
            None => run.await,
        };
        self.emit(AgentEvent::ToolFinished {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: outcome.success,
        });
        Ok(outcome)
    }

    fn interrupted(&self) -> bool {
        self.interrupt.as_ref().is_some_and(|rx| *rx.borrow())
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Resolve once the interrupt flag reads `true`. Pends forever if the sender
/// is gone with the flag still clear.
async fn wait_for_interrupt(interrupt: &mut watch::Receiver<bool>) {
    loop {
        if *interrupt.borrow() {
            return;
        }
        if interrupt.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_providers::AiResponse;
    use ember_tools::builtins::register_builtins;
    use ember_tools::{ParamKind, ParamSpec, PathSandbox, Tool, ToolFut};
    use ember_types::AiErrorKind;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Provider that pops scripted results in order.
    struct ScriptedProvider {
        replies: Mutex<Vec<Result<AiResponse, AiError>>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Result<AiResponse, AiError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
            })
        }
    }

    impl ProviderClient for ScriptedProvider {
        fn send<'a>(&'a self, _request: AiRequest<'a>) -> ProviderFut<'a> {
            let next = self.replies.lock().unwrap().remove(0);
            Box::pin(async move { next })
        }

        fn provider(&self) -> Provider {
            Provider::Claude
        }
    }

    fn text_reply(content: &str) -> Result<AiResponse, AiError> {
        Ok(AiResponse {
            content: content.to_string(),
            reasoning: None,
            usage: None,
        })
    }

    struct MarkerTool {
        gated: bool,
    }

    impl Tool for MarkerTool {
        fn name(&self) -> &'static str {
            "leave_marker"
        }

        fn description(&self) -> &'static str {
            "Writes a marker value into session metadata"
        }

        fn schema(&self) -> &[ParamSpec] {
            const SCHEMA: &[ParamSpec] =
                &[ParamSpec::required("value", ParamKind::String, "Marker value")];
            SCHEMA
        }

        fn requires_approval(&self) -> bool {
            self.gated
        }

        fn execute<'a>(&'a self, args: Value, ctx: &'a mut AgentContext) -> ToolFut<'a> {
            Box::pin(async move {
                ctx.metadata.insert("marker".to_string(), args["value"].clone());
                Ok(ToolOutcome::ok(json!("marker placed")))
            })
        }
    }

    /// Tool that stays in flight long enough to be interrupted.
    struct StallTool;

    impl Tool for StallTool {
        fn name(&self) -> &'static str {
            "stall"
        }

        fn description(&self) -> &'static str {
            "Sleeps before returning"
        }

        fn schema(&self) -> &[ParamSpec] {
            &[]
        }

        fn execute<'a>(&'a self, _args: Value, _ctx: &'a mut AgentContext) -> ToolFut<'a> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ToolOutcome::ok(json!("done")))
            })
        }
    }

    fn agent_with(
        replies: Vec<Result<AiResponse, AiError>>,
        gated: bool,
    ) -> (tempfile::TempDir, Agent, mpsc::Receiver<crate::approval::PendingApproval>) {
        let dir = tempdir().unwrap();
        let sandbox = PathSandbox::new(dir.path()).unwrap();
        let ctx = AgentContext::new(sandbox);

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MarkerTool { gated })).unwrap();

        let (gate, rx) = ApprovalGate::channel();
        let options = AgentOptions {
            retry: RetryConfig {
                max_retries: 0,
                attempt_timeout: None,
                ..RetryConfig::default()
            },
            ..AgentOptions::default()
        };
        let agent = Agent::new(
            ScriptedProvider::new(replies),
            registry,
            ctx,
            ConversationCompactor::default(),
            gate,
            options,
        );
        (dir, agent, rx)
    }

    fn directive_reply() -> Result<AiResponse, AiError> {
        text_reply(r#"{"tool": "leave_marker", "parameters": {"value": "v1"}}"#)
    }

    #[tokio::test]
    async fn plain_reply_is_the_final_answer() {
        let (_dir, mut agent, _rx) = agent_with(vec![text_reply("All done.")], false);
        let answer = agent
            .run_turn(NonEmptyString::new("hi").unwrap())
            .await
            .unwrap();
        assert_eq!(answer, "All done.");
        assert_eq!(agent.messages().len(), 2);
    }

    #[tokio::test]
    async fn directive_executes_and_feeds_result_back() {
        let (_dir, mut agent, _rx) = agent_with(
            vec![directive_reply(), text_reply("Marker placed.")],
            false,
        );
        let answer = agent
            .run_turn(NonEmptyString::new("place a marker").unwrap())
            .await
            .unwrap();
        assert_eq!(answer, "Marker placed.");

        let roles: Vec<&str> = agent
            .messages()
            .iter()
            .map(|m| match m {
                Message::User(_) => "user",
                Message::Assistant(_) => "assistant",
                Message::ToolUse(_) => "tool_use",
                Message::ToolResult(_) => "tool_result",
                _ => "other",
            })
            .collect();
        assert_eq!(
            roles,
            vec!["user", "assistant", "tool_use", "tool_result", "assistant"]
        );

        let Some(Message::ToolResult(result)) = agent
            .messages()
            .iter()
            .find(|m| matches!(m, Message::ToolResult(_)))
        else {
            panic!("missing tool result");
        };
        assert!(result.outcome.success);
    }

    #[tokio::test]
    async fn gated_tool_waits_for_approval() {
        let (_dir, mut agent, mut rx) = agent_with(
            vec![directive_reply(), text_reply("Done.")],
            true,
        );
        let responder = tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            assert_eq!(pending.request.tool_name, "leave_marker");
            assert!(pending.request.preview.contains("leave_marker"));
            pending.respond(ApprovalDecision::Approved);
        });

        let answer = agent
            .run_turn(NonEmptyString::new("go").unwrap())
            .await
            .unwrap();
        assert_eq!(answer, "Done.");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn rejection_records_the_exact_message() {
        let (_dir, mut agent, mut rx) = agent_with(
            vec![directive_reply(), text_reply("Understood.")],
            true,
        );
        tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            pending.respond(ApprovalDecision::Rejected);
        });

        agent
            .run_turn(NonEmptyString::new("go").unwrap())
            .await
            .unwrap();

        let Some(Message::ToolResult(result)) = agent
            .messages()
            .iter()
            .find(|m| matches!(m, Message::ToolResult(_)))
        else {
            panic!("missing tool result");
        };
        assert!(!result.outcome.success);
        assert_eq!(
            result.outcome.error.as_deref(),
            Some("Tool execution rejected by user")
        );
    }

    #[tokio::test]
    async fn approve_all_silences_later_prompts() {
        let two_directives = text_reply(concat!(
            r#"{"tool": "leave_marker", "parameters": {"value": "a"}}"#,
            "\n",
            r#"{"tool": "leave_marker", "parameters": {"value": "b"}}"#,
        ));
        let (_dir, mut agent, mut rx) =
            agent_with(vec![two_directives, text_reply("Done.")], true);

        let responder = tokio::spawn(async move {
            // Only the first call should prompt.
            let pending = rx.recv().await.unwrap();
            pending.respond(ApprovalDecision::ApproveAll);
            assert!(rx.recv().await.is_none());
        });

        agent
            .run_turn(NonEmptyString::new("go").unwrap())
            .await
            .unwrap();
        drop(agent);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn modify_skips_execution_and_injects_guidance() {
        let (_dir, mut agent, mut rx) = agent_with(
            vec![directive_reply(), text_reply("Adjusted.")],
            true,
        );
        tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            pending.respond(ApprovalDecision::Modify("use value v2 instead".to_string()));
        });

        agent
            .run_turn(NonEmptyString::new("go").unwrap())
            .await
            .unwrap();

        // The tool never ran.
        assert!(!agent.ctx.metadata.contains_key("marker"));
        // The guidance landed in the history as a user turn, after the
        // result so the use/result pair stays adjacent.
        let roles: Vec<&str> = agent
            .messages()
            .iter()
            .map(|m| match m {
                Message::User(_) => "user",
                Message::Assistant(_) => "assistant",
                Message::ToolUse(_) => "tool_use",
                Message::ToolResult(_) => "tool_result",
                _ => "other",
            })
            .collect();
        assert_eq!(
            roles,
            vec![
                "user",
                "assistant",
                "tool_use",
                "tool_result",
                "user",
                "assistant"
            ]
        );
        assert!(agent.messages().iter().any(|m| {
            m.is_user() && m.content().contains("use value v2 instead")
        }));
        let Some(Message::ToolResult(result)) = agent
            .messages()
            .iter()
            .find(|m| matches!(m, Message::ToolResult(_)))
        else {
            panic!("missing tool result");
        };
        assert!(result.outcome.success);
    }

    #[tokio::test]
    async fn config_listed_tool_is_gated_even_when_it_does_not_ask() {
        let (_dir, mut agent, mut rx) = agent_with(
            vec![directive_reply(), text_reply("Done.")],
            false,
        );
        agent.options.require_approval = vec!["leave_marker".to_string()];
        let responder = tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            pending.respond(ApprovalDecision::Approved);
        });

        agent
            .run_turn(NonEmptyString::new("go").unwrap())
            .await
            .unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn auto_approve_never_prompts() {
        let (_dir, mut agent, mut rx) = agent_with(
            vec![directive_reply(), text_reply("Done.")],
            true,
        );
        agent.approve_all = true;
        let watcher = tokio::spawn(async move { rx.recv().await.map(|p| p.request.tool_name) });

        agent
            .run_turn(NonEmptyString::new("go").unwrap())
            .await
            .unwrap();
        assert!(agent.ctx.metadata.contains_key("marker"));
        drop(agent);
        assert_eq!(watcher.await.unwrap(), None);
    }

    #[tokio::test]
    async fn provider_error_ends_the_turn() {
        let err = AiError::new(AiErrorKind::Auth, Provider::Claude, "bad key");
        let (_dir, mut agent, _rx) = agent_with(vec![Err(err)], false);
        let result = agent.run_turn(NonEmptyString::new("hi").unwrap()).await;
        assert!(matches!(result, Err(EngineError::Provider(_))));
    }

    #[tokio::test]
    async fn endless_directives_hit_the_iteration_guard() {
        let replies: Vec<_> = (0..30).map(|_| directive_reply()).collect();
        let (_dir, mut agent, _rx) = agent_with(replies, false);
        agent.options.max_iterations = 3;
        let result = agent.run_turn(NonEmptyString::new("loop").unwrap()).await;
        assert!(matches!(
            result,
            Err(EngineError::MaxIterations { limit: 3 })
        ));
    }

    #[tokio::test]
    async fn interrupt_aborts_between_steps() {
        let (_dir, mut agent, _rx) = agent_with(vec![directive_reply()], false);
        let (tx, rx) = watch::channel(true);
        agent.set_interrupt(rx);
        let result = agent.run_turn(NonEmptyString::new("go").unwrap()).await;
        assert!(matches!(result, Err(EngineError::Interrupted)));
        drop(tx);
    }

    #[tokio::test]
    async fn interrupt_aborts_an_in_flight_tool_wait() {
        let dir = tempdir().unwrap();
        let sandbox = PathSandbox::new(dir.path()).unwrap();
        let ctx = AgentContext::new(sandbox);
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StallTool)).unwrap();
        let (gate, _rx) = ApprovalGate::channel();
        let mut agent = Agent::new(
            ScriptedProvider::new(vec![text_reply(r#"{"tool": "stall", "parameters": {}}"#)]),
            registry,
            ctx,
            ConversationCompactor::default(),
            gate,
            AgentOptions {
                retry: RetryConfig {
                    max_retries: 0,
                    attempt_timeout: None,
                    ..RetryConfig::default()
                },
                ..AgentOptions::default()
            },
        );
        let (tx, rx) = watch::channel(false);
        agent.set_interrupt(rx);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });

        let started = std::time::Instant::now();
        let result = agent.run_turn(NonEmptyString::new("go").unwrap()).await;
        assert!(matches!(result, Err(EngineError::Interrupted)));
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "turn waited out the tool instead of aborting"
        );

        // The aborted call still got a paired result.
        let Some(Message::ToolResult(result)) = agent
            .messages()
            .iter()
            .find(|m| matches!(m, Message::ToolResult(_)))
        else {
            panic!("missing tool result");
        };
        assert!(!result.outcome.success);
        assert_eq!(
            result.outcome.error.as_deref(),
            Some("Tool execution interrupted by user")
        );
    }

    #[tokio::test]
    async fn interrupt_aborts_a_pending_approval_wait() {
        // Nobody answers the prompt; only the interrupt can end the turn.
        let (_dir, mut agent, _rx) = agent_with(vec![directive_reply()], true);
        let (tx, rx) = watch::channel(false);
        agent.set_interrupt(rx);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });

        let result = agent.run_turn(NonEmptyString::new("go").unwrap()).await;
        assert!(matches!(result, Err(EngineError::Interrupted)));
    }

    fn builtin_agent(
        replies: Vec<Result<AiResponse, AiError>>,
    ) -> (tempfile::TempDir, Agent, mpsc::Receiver<crate::approval::PendingApproval>) {
        let dir = tempdir().unwrap();
        let sandbox = PathSandbox::new(dir.path()).unwrap();
        let ctx = AgentContext::new(sandbox);
        let mut registry = ToolRegistry::new();
        register_builtins(&mut registry).unwrap();

        let (gate, rx) = ApprovalGate::channel();
        let options = AgentOptions {
            retry: RetryConfig {
                max_retries: 0,
                attempt_timeout: None,
                ..RetryConfig::default()
            },
            ..AgentOptions::default()
        };
        let agent = Agent::new(
            ScriptedProvider::new(replies),
            registry,
            ctx,
            ConversationCompactor::default(),
            gate,
            options,
        );
        (dir, agent, rx)
    }

    #[tokio::test]
    async fn gated_write_blocks_the_batch_and_results_land_in_order() {
        let batch = text_reply(concat!(
            r#"[{"tool": "write_file", "parameters": {"path": "notes.txt", "content": "alpha"}},"#,
            r#" {"tool": "read_file", "parameters": {"path": "notes.txt"}}]"#,
        ));
        let (dir, mut agent, mut rx) = builtin_agent(vec![batch, text_reply("Saved.")]);

        let root = dir.path().to_path_buf();
        let responder = tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            assert_eq!(pending.request.tool_name, "write_file");
            // The read has not started while the write is pending.
            assert!(!root.join("notes.txt").exists());
            pending.respond(ApprovalDecision::Approved);
        });

        let answer = agent
            .run_turn(NonEmptyString::new("save my notes").unwrap())
            .await
            .unwrap();
        assert_eq!(answer, "Saved.");
        responder.await.unwrap();

        let uses: Vec<&str> = agent
            .messages()
            .iter()
            .filter_map(|m| match m {
                Message::ToolUse(call) => Some(call.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(uses, ["write_file", "read_file"]);

        let results: Vec<&ToolResult> = agent
            .messages()
            .iter()
            .filter_map(|m| match m {
                Message::ToolResult(result) => Some(result),
                _ => None,
            })
            .collect();
        assert_eq!(results[0].tool_name, "write_file");
        assert_eq!(results[1].tool_name, "read_file");
        assert!(results.iter().all(|r| r.outcome.success));
        assert_eq!(
            results[1].outcome.data.as_ref().and_then(Value::as_str),
            Some("alpha")
        );
    }

    #[tokio::test]
    async fn rejected_delete_leaves_the_file_on_disk() {
        let reply = text_reply(r#"{"tool": "delete_file", "parameters": {"path": "keep.txt"}}"#);
        let (dir, mut agent, mut rx) = builtin_agent(vec![reply, text_reply("Left it alone.")]);
        std::fs::write(dir.path().join("keep.txt"), "precious").unwrap();

        tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            assert_eq!(pending.request.tool_name, "delete_file");
            pending.respond(ApprovalDecision::Rejected);
        });

        agent
            .run_turn(NonEmptyString::new("clean up").unwrap())
            .await
            .unwrap();

        assert!(dir.path().join("keep.txt").exists());
        let Some(Message::ToolResult(result)) = agent
            .messages()
            .iter()
            .find(|m| matches!(m, Message::ToolResult(_)))
        else {
            panic!("missing tool result");
        };
        assert_eq!(
            result.outcome.error.as_deref(),
            Some("Tool execution rejected by user")
        );
    }
}
