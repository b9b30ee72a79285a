//! The worker action loop: the bounded LLM ↔ router feedback cycle.
//!
//! One call to [`Worker::execute_task_with_loop`] drives a claimed bead
//! until a terminal condition: the model declares `done` / closes the bead,
//! escalates, exhausts the iteration budget, stops producing parseable
//! envelopes, or stops making progress. The loop owns token-budget
//! trimming, the context-length retry ladder, auto-checkpointing, and
//! lesson recording. It never panics the host: every failure folds into a
//! terminal reason.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use loom_core::beads::BeadManager;
use loom_core::git::GitGateway;
use loom_core::persist::Persistence;
use loom_core::shutdown::ShutdownSignal;
use loom_core::types::{
    Agent, ChatTurn, ConversationSession, Lesson, Role, Task, LESSON_CATEGORY_BUILD,
    LESSON_CATEGORY_LOOP_PATTERN,
};
use loom_providers::protocol::{ChatRequest, ChatResponse, WireMessage};
use loom_providers::registry::{ProviderError, ProviderRegistry, RegisteredProvider};

use crate::actions::{is_conversational_slip, parse_envelope, Action, ActionEnvelope, ParseFailure};
use crate::progress::{hash_actions, ProgressTracker, INNER_LOOP_THRESHOLD};
use crate::router::{ActionContext, ActionResult, ActionRouter};

// ---------------------------------------------------------------------------
// Terminal reasons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    Completed,
    MaxIterations,
    Escalated,
    Error,
    NoActions,
    ParseFailures,
    ValidationFailures,
    InnerLoop,
    ProgressStagnant,
    ContextCanceled,
}

impl TerminalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalReason::Completed => "completed",
            TerminalReason::MaxIterations => "max_iterations",
            TerminalReason::Escalated => "escalated",
            TerminalReason::Error => "error",
            TerminalReason::NoActions => "no_actions",
            TerminalReason::ParseFailures => "parse_failures",
            TerminalReason::ValidationFailures => "validation_failures",
            TerminalReason::InnerLoop => "inner_loop",
            TerminalReason::ProgressStagnant => "progress_stagnant",
            TerminalReason::ContextCanceled => "context_canceled",
        }
    }
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Loop result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub iteration: usize,
    pub results: Vec<ActionResult>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LoopResult {
    pub terminal_reason: TerminalReason,
    pub iterations: usize,
    pub success: bool,
    /// Human-readable detail: the stagnation reason, the provider error, …
    pub detail: String,
    pub action_log: Vec<ActionLogEntry>,
}

impl LoopResult {
    fn terminal(reason: TerminalReason, iterations: usize, detail: impl Into<String>, log: Vec<ActionLogEntry>) -> Self {
        Self {
            terminal_reason: reason,
            iterations,
            success: reason == TerminalReason::Completed,
            detail: detail.into(),
            action_log: log,
        }
    }
}

// ---------------------------------------------------------------------------
// Loop configuration
// ---------------------------------------------------------------------------

pub type ProgressCallback = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Clone)]
pub struct LoopConfig {
    pub max_iterations: usize,
    /// Simple single-action envelopes for non-frontier models.
    pub text_mode: bool,
    /// Called after every executed iteration with the iteration number.
    pub on_progress: Option<ProgressCallback>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            text_mode: false,
            on_progress: None,
        }
    }
}

const PARSE_FAIL_LIMIT: u32 = 5;
const VALIDATION_FAIL_LIMIT: u32 = 8;
const PERSIST_EVERY: usize = 5;
const TOKEN_BUDGET_RATIO: f64 = 0.8;
const USER_TRUNCATE_THRESHOLD: usize = 2000;
const RESULT_MESSAGE_CAP: usize = 2000;

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

const FULL_MODE_INSTRUCTIONS: &str = r#"You are an autonomous software agent. You work alone; no human reads your output mid-task.

Respond with EXACTLY ONE JSON object and nothing else:
{"actions": [{"type": "<action>", ...fields...}, ...]}

File actions: read_file{path}, read_code{path}, write_file{path,content}, edit_code{path,old_string,new_string}, apply_patch{path,patch}, delete_file{path}, read_tree{path}.
Search: search_text{query,path?}.
Shell: run_command{command}, build{command?}, test{command?}.
Git: commit{message}, push{branch?}, create_branch{name}, checkout{ref}, git_log{limit?}, diff_branches{base,head}, create_pr{branch?}.
Beads: create_bead{title,description,priority?}, close_bead{bead_id?}, update_bead{bead_id?,status?,description?}, add_dependency{child,parent,kind}, list_beads{}.
Control: scope{notes}, done{reason}, escalate_ceo{reason}.

Workflow: inspect, change, build, test, commit, push. Emit done{} or close_bead{} when the task is complete. Use escalate_ceo{} only for decisions you cannot make alone."#;

const SIMPLE_MODE_INSTRUCTIONS: &str = r#"You are an autonomous software agent. Respond with EXACTLY ONE JSON object and nothing else:
{"action": "<name>", ...fields...}

Supported actions: scope{notes}, read{path}, search{query}, edit{path,old_string,new_string}, write{path,content}, build{}, test{}, bash{command}, git_commit{message}, git_push{}, done{}.

One action per response. Emit {"action":"done"} when the task is complete."#;

const AUTONOMOUS_REMINDER: &str = "AUTONOMOUS MODE REMINDER: nobody reads prose here. Respond with only the JSON action envelope, no commentary.";

const JSON_RETRY_TEMPLATE: &str = r#"Your last response contained no parseable JSON. Reply with exactly one JSON object, for example:
{"actions": [{"type": "read_tree", "path": "."}]}"#;

const SCHEMA_FEEDBACK: &str = r#"Your last envelope did not match the schema. Valid examples:
{"actions": [{"type": "read_file", "path": "src/main.rs"}]}
{"actions": [{"type": "write_file", "path": "notes.md", "content": "..."}]}
{"actions": [{"type": "done", "reason": "all tests pass"}]}"#;

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// A runtime binding of one agent to one provider, executing action loops.
pub struct Worker {
    pub agent: Agent,
    provider: Arc<RegisteredProvider>,
    registry: Arc<ProviderRegistry>,
    router: ActionRouter,
    git: Arc<GitGateway>,
    store: Arc<dyn Persistence>,
    /// Process-wide shutdown.
    shutdown: ShutdownSignal,
    /// Per-worker cancellation (pool `stop`).
    cancel: ShutdownSignal,
    default_context_window: usize,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: Agent,
        provider: Arc<RegisteredProvider>,
        registry: Arc<ProviderRegistry>,
        beads: Arc<BeadManager>,
        git: Arc<GitGateway>,
        store: Arc<dyn Persistence>,
        shutdown: ShutdownSignal,
        default_context_window: usize,
    ) -> Self {
        let router = ActionRouter::new(beads, Arc::clone(&git));
        Self {
            agent,
            provider,
            registry,
            router,
            git,
            store,
            shutdown,
            cancel: ShutdownSignal::new(),
            default_context_window,
        }
    }

    /// Cancel this worker's in-flight loop (pool stop path).
    pub fn cancel(&self) {
        self.cancel.trigger();
    }

    pub fn is_canceled(&self) -> bool {
        self.shutdown.is_shutting_down() || self.cancel.is_shutting_down()
    }

    pub fn provider_handle(&self) -> &Arc<RegisteredProvider> {
        &self.provider
    }

    // -----------------------------------------------------------------------
    // The loop
    // -----------------------------------------------------------------------

    pub async fn execute_task_with_loop(&self, task: &Task, config: &LoopConfig) -> LoopResult {
        let mut session = self.load_or_create_session(task).await;
        self.seed_session(&mut session, task, config.text_mode);

        let ctx = ActionContext {
            project_id: task.project_id.clone(),
            bead_id: task.bead_id.clone(),
            agent_id: self.agent.id.clone(),
            workdir: self.git.project_dir(&task.project_id),
        };

        let mut tracker = ProgressTracker::new();
        let mut action_type_count: HashMap<String, u32> = HashMap::new();
        let mut action_hashes: HashMap<String, u32> = HashMap::new();
        let mut tree_paths: HashMap<String, u32> = HashMap::new();
        let mut consecutive_parse_fail = 0u32;
        let mut consecutive_validation_fail = 0u32;
        let mut action_log: Vec<ActionLogEntry> = Vec::new();

        info!(
            bead_id = %task.bead_id,
            agent_id = %self.agent.id,
            max_iterations = config.max_iterations,
            text_mode = config.text_mode,
            "action loop starting"
        );

        for iteration in 1..=config.max_iterations {
            if self.is_canceled() {
                self.persist_session(&session).await;
                return LoopResult::terminal(
                    TerminalReason::ContextCanceled,
                    iteration - 1,
                    "canceled before iteration",
                    action_log,
                );
            }

            let wire = self.trim_for_budget(&session.messages);
            let response = match self.call_with_context_retry(wire).await {
                Ok(resp) => resp,
                Err(ProviderError::Llm(e)) if matches!(e, loom_providers::protocol::LlmError::Canceled) => {
                    self.persist_session(&session).await;
                    return LoopResult::terminal(
                        TerminalReason::ContextCanceled,
                        iteration,
                        "canceled mid-request",
                        action_log,
                    );
                }
                Err(e) => {
                    warn!(bead_id = %task.bead_id, error = %e, "provider call failed");
                    self.persist_session(&session).await;
                    return LoopResult::terminal(
                        TerminalReason::Error,
                        iteration,
                        e.to_string(),
                        action_log,
                    );
                }
            };

            let Some(content) = response.content().map(str::to_string) else {
                self.persist_session(&session).await;
                return LoopResult::terminal(
                    TerminalReason::Error,
                    iteration,
                    "provider returned no choices",
                    action_log,
                );
            };
            session.push(ChatTurn::assistant(&content));

            let envelope = match parse_envelope(&content, config.text_mode) {
                Ok(env) => env,
                Err(ParseFailure::Validation(detail)) => {
                    consecutive_validation_fail += 1;
                    debug!(bead_id = %task.bead_id, %detail, "validation failure");
                    if consecutive_validation_fail >= VALIDATION_FAIL_LIMIT {
                        self.persist_session(&session).await;
                        return LoopResult::terminal(
                            TerminalReason::ValidationFailures,
                            iteration,
                            detail,
                            action_log,
                        );
                    }
                    session.push(ChatTurn::user(format!("{SCHEMA_FEEDBACK}\n({detail})")));
                    continue;
                }
                Err(ParseFailure::Parse(detail)) => {
                    if is_conversational_slip(&content) {
                        session.push(ChatTurn::user(AUTONOMOUS_REMINDER));
                        continue;
                    }
                    consecutive_parse_fail += 1;
                    debug!(bead_id = %task.bead_id, %detail, "parse failure");
                    if consecutive_parse_fail >= PARSE_FAIL_LIMIT {
                        self.persist_session(&session).await;
                        return LoopResult::terminal(
                            TerminalReason::ParseFailures,
                            iteration,
                            detail,
                            action_log,
                        );
                    }
                    session.push(ChatTurn::user(JSON_RETRY_TEMPLATE));
                    continue;
                }
            };
            consecutive_parse_fail = 0;
            consecutive_validation_fail = 0;

            if envelope.actions.is_empty() {
                self.persist_session(&session).await;
                return LoopResult::terminal(
                    TerminalReason::NoActions,
                    iteration,
                    "empty action envelope",
                    action_log,
                );
            }

            let results = self.router.execute(&envelope, &ctx).await;
            tracker.update(&results);
            self.auto_checkpoint(&envelope, &results, &ctx).await;

            for action in &envelope.actions {
                *action_type_count
                    .entry(action.type_name().to_string())
                    .or_insert(0) += 1;
                if let Action::ReadTree { path } = action {
                    *tree_paths.entry(path.clone()).or_insert(0) += 1;
                }
            }

            action_log.push(ActionLogEntry {
                iteration,
                results: results.clone(),
                timestamp: Utc::now(),
            });

            if let Some(cb) = &config.on_progress {
                cb(iteration);
            }

            if let Some((reason, detail)) = terminal_from(&envelope, &results) {
                if reason == TerminalReason::Completed {
                    self.auto_push(&ctx).await;
                }
                self.record_build_lessons(task, &results).await;
                self.persist_session(&session).await;
                info!(
                    bead_id = %task.bead_id,
                    iteration,
                    reason = %reason,
                    "action loop terminal"
                );
                return LoopResult::terminal(reason, iteration, detail, action_log);
            }

            self.record_build_lessons(task, &results).await;

            let hash = hash_actions(&envelope.actions);
            let hash_count = {
                let count = action_hashes.entry(hash).or_insert(0);
                *count += 1;
                *count
            };
            if hash_count >= INNER_LOOP_THRESHOLD {
                let detail = format!(
                    "identical action set repeated {hash_count} times: {}",
                    envelope
                        .actions
                        .iter()
                        .map(Action::type_name)
                        .collect::<Vec<_>>()
                        .join(",")
                );
                self.record_lesson(task, LESSON_CATEGORY_LOOP_PATTERN, &detail).await;
                self.persist_session(&session).await;
                return LoopResult::terminal(
                    TerminalReason::InnerLoop,
                    iteration,
                    detail,
                    action_log,
                );
            }

            // When the exact set is already repeating the inner-loop counter
            // owns the diagnosis; the stagnation heuristics watch everything
            // else.
            if hash_count < 2 {
                if let Some(reason) =
                    tracker.stagnation_reason(iteration, &action_type_count, &tree_paths)
                {
                    self.persist_session(&session).await;
                    return LoopResult::terminal(
                        TerminalReason::ProgressStagnant,
                        iteration,
                        reason,
                        action_log,
                    );
                }
            }

            let mut feedback = tracker.summary(iteration);
            if let Some(warning) = ProgressTracker::tree_warning(&tree_paths) {
                feedback.push('\n');
                feedback.push_str(&warning);
            }
            feedback.push('\n');
            feedback.push_str(&format_results(&results));
            session.push(ChatTurn::user(feedback));

            if iteration % PERSIST_EVERY == 0 {
                self.persist_session(&session).await;
            }
        }

        self.persist_session(&session).await;
        LoopResult::terminal(
            TerminalReason::MaxIterations,
            config.max_iterations,
            "iteration budget exhausted",
            action_log,
        )
    }

    // -----------------------------------------------------------------------
    // Conversation handling
    // -----------------------------------------------------------------------

    async fn load_or_create_session(&self, task: &Task) -> ConversationSession {
        match self.store.load_conversation(&task.bead_id).await {
            Ok(Some(session)) if !session.is_expired() => {
                debug!(bead_id = %task.bead_id, session_id = %session.session_id, "resuming session");
                session
            }
            Ok(Some(_)) => {
                debug!(bead_id = %task.bead_id, "session expired, starting fresh");
                ConversationSession::new(&task.bead_id, &task.project_id)
            }
            Ok(None) => ConversationSession::new(&task.bead_id, &task.project_id),
            Err(e) => {
                warn!(bead_id = %task.bead_id, error = %e, "conversation load failed, starting fresh");
                ConversationSession::new(&task.bead_id, &task.project_id)
            }
        }
    }

    fn seed_session(&self, session: &mut ConversationSession, task: &Task, text_mode: bool) {
        if session.messages.is_empty() {
            session.push(ChatTurn::system(self.system_prompt(text_mode)));
            session.push(ChatTurn::user(format!(
                "{}\n\n{}",
                task.description, task.context
            )));
        } else {
            session.push(ChatTurn::user(format!(
                "Resuming task: {}",
                task.description
            )));
        }
    }

    fn system_prompt(&self, text_mode: bool) -> String {
        let instructions = if text_mode {
            SIMPLE_MODE_INSTRUCTIONS
        } else {
            FULL_MODE_INSTRUCTIONS
        };
        format!(
            "{instructions}\n\nPersona: {} ({}).",
            self.agent.persona_name,
            self.agent.role.display_name()
        )
    }

    async fn persist_session(&self, session: &ConversationSession) {
        if let Err(e) = self.store.save_conversation(session).await {
            warn!(session_id = %session.session_id, error = %e, "conversation save failed");
        }
    }

    // -----------------------------------------------------------------------
    // Token-budget management
    // -----------------------------------------------------------------------

    /// Keep `messages[0]` and the latest message, drop as much of the middle
    /// as needed to fit 80 % of the context window, inserting a truncation
    /// notice at position 1 when anything was dropped.
    fn trim_for_budget(&self, turns: &[ChatTurn]) -> Vec<WireMessage> {
        let window = self.provider.context_window(self.default_context_window);
        let budget = (window as f64 * TOKEN_BUDGET_RATIO) as usize;
        trim_messages(turns, budget)
    }

    // -----------------------------------------------------------------------
    // Provider call with context-length retry
    // -----------------------------------------------------------------------

    async fn call_with_context_retry(
        &self,
        wire: Vec<WireMessage>,
    ) -> Result<ChatResponse, ProviderError> {
        let first = self.call_provider(wire.clone()).await;
        let err = match first {
            Ok(resp) => return Ok(resp),
            Err(ProviderError::Llm(e)) if e.is_context_length() => e,
            Err(e) => return Err(e),
        };

        warn!(agent_id = %self.agent.id, "context length rejected, shrinking history");
        let mut last_err = ProviderError::Llm(err);
        for fraction in [0.5, 0.25, 0.0] {
            let reduced = reduce_middle(&wire, fraction);
            match self.call_provider(reduced).await {
                Ok(resp) => return Ok(resp),
                Err(ProviderError::Llm(e)) if e.is_context_length() => {
                    last_err = ProviderError::Llm(e);
                }
                Err(e) => return Err(e),
            }
        }

        // Last resort: the newest user message itself may be enormous.
        if let Some(last) = wire.last() {
            if last.content.len() > USER_TRUNCATE_THRESHOLD {
                let mut reduced = reduce_middle(&wire, 0.0);
                if let Some(tail) = reduced.last_mut() {
                    let half = last.content.len() / 2;
                    let mut cut = half;
                    while !last.content.is_char_boundary(cut) {
                        cut += 1;
                    }
                    tail.content = format!("{}\n[truncated]", &last.content[..cut]);
                }
                return self.call_provider(reduced).await;
            }
        }
        Err(last_err)
    }

    async fn call_provider(&self, wire: Vec<WireMessage>) -> Result<ChatResponse, ProviderError> {
        // Model is re-read from the registration per call so in-place
        // provider updates take effect immediately.
        let model = self.provider.config().model;
        let req = ChatRequest::new(model, wire);

        tokio::select! {
            _ = self.shutdown.wait() => Err(ProviderError::Llm(
                loom_providers::protocol::LlmError::Canceled,
            )),
            _ = self.cancel.wait() => Err(ProviderError::Llm(
                loom_providers::protocol::LlmError::Canceled,
            )),
            result = self.registry.send_via(&self.provider, &req) => result,
        }
    }

    // -----------------------------------------------------------------------
    // Auto-checkpoint / auto-push / lessons
    // -----------------------------------------------------------------------

    /// After successful file mutations, land a WIP commit so a crash cannot
    /// lose the work. Best-effort.
    async fn auto_checkpoint(
        &self,
        envelope: &ActionEnvelope,
        results: &[ActionResult],
        ctx: &ActionContext,
    ) {
        let mutated = envelope
            .actions
            .iter()
            .zip(results)
            .any(|(action, result)| action.is_file_mutation() && result.succeeded());
        if !mutated {
            return;
        }
        if let Err(e) = self
            .git
            .commit(
                &ctx.project_id,
                &ctx.bead_id,
                &ctx.agent_id,
                "[WIP] Auto-checkpoint after file changes",
            )
            .await
        {
            debug!(bead_id = %ctx.bead_id, error = %e, "auto-checkpoint skipped");
        }
    }

    /// On completion, push the current branch. Best-effort; a failed push
    /// never changes the terminal reason.
    async fn auto_push(&self, ctx: &ActionContext) {
        let branch = match self.git.current_branch(&ctx.project_id).await {
            Ok(b) => b,
            Err(e) => {
                debug!(bead_id = %ctx.bead_id, error = %e, "auto-push skipped, no branch");
                return;
            }
        };
        if self.git.is_protected(&branch) {
            debug!(bead_id = %ctx.bead_id, branch = %branch, "auto-push skipped, protected branch");
            return;
        }
        if let Err(e) = self.git.push(&ctx.project_id, &ctx.bead_id, &branch, false).await {
            warn!(bead_id = %ctx.bead_id, error = %e, "auto-push failed");
        }
    }

    async fn record_build_lessons(&self, task: &Task, results: &[ActionResult]) {
        for result in results {
            if matches!(result.action_type.as_str(), "build" | "test") && !result.succeeded() {
                let summary = format!(
                    "{} failed: {}",
                    result.action_type,
                    result.message.lines().last().unwrap_or("").trim()
                );
                self.record_lesson(task, LESSON_CATEGORY_BUILD, &summary).await;
            }
        }
    }

    async fn record_lesson(&self, task: &Task, category: &str, summary: &str) {
        let lesson = Lesson::new(
            category,
            &task.bead_id,
            &self.agent.id,
            &task.project_id,
            summary,
        );
        if let Err(e) = self.store.record_lesson(&lesson).await {
            warn!(bead_id = %task.bead_id, error = %e, "lesson record failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Terminal detection
// ---------------------------------------------------------------------------

/// `done` and a *successful* `close_bead` complete the task; a failed
/// `close_bead` is ignored. `escalate_ceo` escalates.
fn terminal_from(
    envelope: &ActionEnvelope,
    results: &[ActionResult],
) -> Option<(TerminalReason, String)> {
    for (action, result) in envelope.actions.iter().zip(results) {
        match action {
            Action::Done { reason } => {
                return Some((TerminalReason::Completed, reason.clone()));
            }
            Action::CloseBead { .. } if result.succeeded() => {
                return Some((TerminalReason::Completed, result.message.clone()));
            }
            Action::EscalateCeo { reason } => {
                return Some((TerminalReason::Escalated, reason.clone()));
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Message shaping
// ---------------------------------------------------------------------------

fn to_wire(turn: &ChatTurn) -> WireMessage {
    let role = match turn.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    WireMessage::new(role, &turn.content)
}

fn truncation_notice(dropped: usize) -> WireMessage {
    WireMessage::new(
        "user",
        format!("[Note: {dropped} older messages truncated to fit the context window]"),
    )
}

/// Budget-trim a conversation: always keep the first (system) and last
/// (latest user) messages, then walk backwards from the tail keeping middle
/// messages while they fit.
fn trim_messages(turns: &[ChatTurn], budget_tokens: usize) -> Vec<WireMessage> {
    if turns.len() <= 2 {
        return turns.iter().map(to_wire).collect();
    }
    let total: usize = turns.iter().map(|t| t.approx_tokens).sum();
    if total <= budget_tokens {
        return turns.iter().map(to_wire).collect();
    }

    let first = &turns[0];
    let last = &turns[turns.len() - 1];
    let mut remaining = budget_tokens.saturating_sub(first.approx_tokens + last.approx_tokens);

    let mut kept_middle: Vec<&ChatTurn> = Vec::new();
    for turn in turns[1..turns.len() - 1].iter().rev() {
        if turn.approx_tokens > remaining {
            break;
        }
        remaining -= turn.approx_tokens;
        kept_middle.push(turn);
    }
    kept_middle.reverse();

    let dropped = turns.len() - 2 - kept_middle.len();
    let mut out = Vec::with_capacity(kept_middle.len() + 3);
    out.push(to_wire(first));
    if dropped > 0 {
        out.push(truncation_notice(dropped));
    }
    out.extend(kept_middle.iter().map(|t| to_wire(t)));
    out.push(to_wire(last));
    out
}

/// Keep first and last, retain the newest `fraction` of the middle, and
/// insert a truncation notice at position 1.
fn reduce_middle(wire: &[WireMessage], fraction: f64) -> Vec<WireMessage> {
    if wire.len() <= 2 {
        return wire.to_vec();
    }
    let middle = &wire[1..wire.len() - 1];
    let keep = (middle.len() as f64 * fraction).ceil() as usize;
    let keep = keep.min(middle.len());
    let dropped = middle.len() - keep;

    let mut out = Vec::with_capacity(keep + 3);
    out.push(wire[0].clone());
    if dropped > 0 {
        out.push(WireMessage::new(
            "user",
            format!("[Note: {dropped} older messages truncated to fit the context window]"),
        ));
    }
    out.extend_from_slice(&middle[middle.len() - keep..]);
    out.push(wire[wire.len() - 1].clone());
    out
}

fn format_results(results: &[ActionResult]) -> String {
    let mut out = String::from("Results:");
    for (i, result) in results.iter().enumerate() {
        let status = match result.status {
            crate::router::ActionStatus::Executed => "executed",
            crate::router::ActionStatus::Error => "error",
        };
        let mut message = result.message.clone();
        if message.len() > RESULT_MESSAGE_CAP {
            let mut cut = RESULT_MESSAGE_CAP;
            while !message.is_char_boundary(cut) {
                cut += 1;
            }
            message.truncate(cut);
            message.push_str("… [truncated]");
        }
        out.push_str(&format!(
            "\n{}. [{}] {}: {}",
            i + 1,
            status,
            result.action_type,
            message
        ));
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::beads::{context_keys, BeadManager};
    use loom_core::config::GitConfig;
    use loom_core::persist::MemoryStore;
    use loom_core::types::{BeadType, Priority};
    use loom_providers::protocol::{LlmError, MockProtocol, Protocol};
    use loom_providers::registry::{ProviderConfig, ProviderRegistry, ProviderType};
    use std::time::Duration;

    struct Fixture {
        worker: Worker,
        mock: Arc<MockProtocol>,
        beads: Arc<BeadManager>,
        store: Arc<MemoryStore>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("create temp dir");
        std::fs::create_dir_all(dir.path().join("proj")).unwrap();

        let beads = Arc::new(BeadManager::new(dir.path()));
        let git = Arc::new(
            GitGateway::new(dir.path(), GitConfig::default())
                .with_state_base(dir.path().join("state")),
        );
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ProviderRegistry::new(Duration::from_secs(1)));
        let mock = Arc::new(MockProtocol::new());
        let provider = registry
            .register_with_client(
                ProviderConfig::new("p1", ProviderType::Mock, "http://localhost:0", "mock-model"),
                Arc::clone(&mock) as Arc<dyn Protocol>,
            )
            .await
            .expect("register");

        let agent = Agent::new("exec-proj-1", "engineering-manager", "proj");
        let worker = Worker::new(
            agent,
            provider,
            registry,
            Arc::clone(&beads),
            git,
            Arc::clone(&store) as Arc<dyn Persistence>,
            ShutdownSignal::new(),
            32768,
        );
        Fixture {
            worker,
            mock,
            beads,
            store,
            _dir: dir,
        }
    }

    fn task_for(beads: &BeadManager) -> Task {
        let bead = beads.create("Fix the bug", "desc", Priority::P1, BeadType::Bug, "proj");
        beads.claim(&bead.id, "exec-proj-1").expect("claim");
        Task::new(&bead.id, "proj", "Fix the bug", "project context here")
    }

    #[tokio::test]
    async fn happy_path_done_completes_in_one_iteration() {
        let f = fixture().await;
        let task = task_for(&f.beads);
        f.mock
            .push_text(r#"{"actions":[{"type":"done","reason":"done"}]}"#);

        let result = f
            .worker
            .execute_task_with_loop(&task, &LoopConfig::default())
            .await;

        assert_eq!(result.terminal_reason, TerminalReason::Completed);
        assert_eq!(result.iterations, 1);
        assert!(result.success);
        assert_eq!(result.action_log.len(), 1);

        // Exactly one assistant message in the saved session.
        let session = f
            .store
            .load_conversation(&task.bead_id)
            .await
            .unwrap()
            .unwrap();
        let assistants = session
            .messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count();
        assert_eq!(assistants, 1);
    }

    #[tokio::test]
    async fn parse_failure_budget_is_five() {
        let f = fixture().await;
        let task = task_for(&f.beads);
        for _ in 0..5 {
            f.mock.push_text("ERROR: no json in sight");
        }

        let result = f
            .worker
            .execute_task_with_loop(&task, &LoopConfig::default())
            .await;

        assert_eq!(result.terminal_reason, TerminalReason::ParseFailures);
        assert_eq!(result.iterations, 5);
        assert!(!result.success);
        assert!(result.action_log.is_empty());
    }

    #[tokio::test]
    async fn conversational_slip_gets_reminder_not_counted() {
        let f = fixture().await;
        let task = task_for(&f.beads);
        f.mock.push_text("I'll start by reading the code base.");
        f.mock
            .push_text(r#"{"actions":[{"type":"done","reason":"ok"}]}"#);

        let result = f
            .worker
            .execute_task_with_loop(&task, &LoopConfig::default())
            .await;

        assert_eq!(result.terminal_reason, TerminalReason::Completed);
        assert_eq!(result.iterations, 2);

        let session = f
            .store
            .load_conversation(&task.bead_id)
            .await
            .unwrap()
            .unwrap();
        assert!(session
            .messages
            .iter()
            .any(|m| m.content.contains("AUTONOMOUS MODE REMINDER")));
    }

    #[tokio::test]
    async fn validation_failure_budget_is_eight() {
        let f = fixture().await;
        let task = task_for(&f.beads);
        for _ in 0..8 {
            f.mock.push_text(r#"{"actions":[{"type":"warp_drive"}]}"#);
        }

        let result = f
            .worker
            .execute_task_with_loop(&task, &LoopConfig::default())
            .await;

        assert_eq!(result.terminal_reason, TerminalReason::ValidationFailures);
        assert_eq!(result.iterations, 8);
    }

    #[tokio::test]
    async fn empty_envelope_terminates_no_actions() {
        let f = fixture().await;
        let task = task_for(&f.beads);
        f.mock.push_text(r#"{"actions":[]}"#);

        let result = f
            .worker
            .execute_task_with_loop(&task, &LoopConfig::default())
            .await;
        assert_eq!(result.terminal_reason, TerminalReason::NoActions);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn inner_loop_detected_with_lesson() {
        let f = fixture().await;
        let task = task_for(&f.beads);
        for _ in 0..12 {
            f.mock
                .push_text(r#"{"actions":[{"type":"read_tree","path":"."}]}"#);
        }

        let result = f
            .worker
            .execute_task_with_loop(&task, &LoopConfig::default())
            .await;

        assert_eq!(result.terminal_reason, TerminalReason::InnerLoop);
        assert!(result.iterations <= 11);
        assert!(!result.success);

        let lessons = f.store.lessons_for_bead(&task.bead_id).await.unwrap();
        assert!(lessons
            .iter()
            .any(|l| l.category == LESSON_CATEGORY_LOOP_PATTERN));
    }

    #[tokio::test]
    async fn stagnation_on_varied_tree_listings() {
        let f = fixture().await;
        let task = task_for(&f.beads);
        // Alternate a second action so the envelopes are not byte-identical
        // and the stagnation heuristics stay in charge.
        for i in 0..12 {
            f.mock.push_text(format!(
                r#"{{"actions":[{{"type":"read_tree","path":"."}},{{"type":"read_file","path":"f{i}.rs"}}]}}"#
            ));
        }

        let result = f
            .worker
            .execute_task_with_loop(&task, &LoopConfig::default())
            .await;

        assert_eq!(result.terminal_reason, TerminalReason::ProgressStagnant);
        assert!(result.detail.contains("read_tree"));
    }

    #[tokio::test]
    async fn context_length_retry_trims_history() {
        let f = fixture().await;
        let task = task_for(&f.beads);

        // Pre-seed a conversation with history so there is a middle to drop.
        let mut session = ConversationSession::new(&task.bead_id, "proj");
        session.push(ChatTurn::system("system prompt"));
        session.push(ChatTurn::user("original task"));
        session.push(ChatTurn::assistant("{\"actions\":[]}"));
        session.push(ChatTurn::user("feedback one"));
        session.push(ChatTurn::assistant("{\"actions\":[]}"));
        f.store.save_conversation(&session).await.unwrap();

        f.mock.push_error(LlmError::ApiError {
            status: 400,
            message: "this model's maximum context length is 8192 tokens".into(),
        });
        f.mock
            .push_text(r#"{"actions":[{"type":"done","reason":"ok"}]}"#);

        let result = f
            .worker
            .execute_task_with_loop(&task, &LoopConfig::default())
            .await;
        assert_eq!(result.terminal_reason, TerminalReason::Completed);
        assert!(result.success);

        let captured = f.mock.captured_requests();
        assert_eq!(captured.len(), 2);
        let retry = &captured[1];
        // System head and latest tail are preserved; the notice sits at
        // position 1.
        assert_eq!(retry.messages.first().unwrap().role, "system");
        assert!(retry.messages[1].content.contains("[Note:"));
        assert_eq!(
            retry.messages.last().unwrap().content,
            captured[0].messages.last().unwrap().content
        );
        assert!(retry.messages.len() < captured[0].messages.len());
    }

    #[tokio::test]
    async fn provider_error_terminates_with_error() {
        let f = fixture().await;
        let task = task_for(&f.beads);
        f.mock.push_error(LlmError::ApiError {
            status: 503,
            message: "overloaded".into(),
        });

        let result = f
            .worker
            .execute_task_with_loop(&task, &LoopConfig::default())
            .await;
        assert_eq!(result.terminal_reason, TerminalReason::Error);
        assert!(result.detail.contains("overloaded"));
    }

    #[tokio::test]
    async fn cancellation_yields_context_canceled() {
        let f = fixture().await;
        let task = task_for(&f.beads);
        f.worker.cancel();

        let result = f
            .worker
            .execute_task_with_loop(&task, &LoopConfig::default())
            .await;
        assert_eq!(result.terminal_reason, TerminalReason::ContextCanceled);
        assert_eq!(result.iterations, 0);
    }

    #[tokio::test]
    async fn close_bead_completes_and_closes() {
        let f = fixture().await;
        let task = task_for(&f.beads);
        f.mock
            .push_text(r#"{"actions":[{"type":"close_bead"}]}"#);

        let result = f
            .worker
            .execute_task_with_loop(&task, &LoopConfig::default())
            .await;
        assert_eq!(result.terminal_reason, TerminalReason::Completed);
        let bead = f.beads.get(&task.bead_id).unwrap();
        assert_eq!(bead.status, loom_core::types::BeadStatus::Closed);
    }

    #[tokio::test]
    async fn escalation_records_reason_on_bead() {
        let f = fixture().await;
        let task = task_for(&f.beads);
        f.mock.push_text(
            r#"{"actions":[{"type":"escalate_ceo","reason":"conflicting requirements"}]}"#,
        );

        let result = f
            .worker
            .execute_task_with_loop(&task, &LoopConfig::default())
            .await;
        assert_eq!(result.terminal_reason, TerminalReason::Escalated);
        assert!(!result.success);

        let bead = f.beads.get(&task.bead_id).unwrap();
        assert_eq!(
            bead.context.get(context_keys::ESCALATION_REASON).unwrap(),
            "conflicting requirements"
        );
    }

    #[tokio::test]
    async fn on_progress_callback_fires_per_iteration() {
        let f = fixture().await;
        let task = task_for(&f.beads);
        f.mock
            .push_text(r#"{"actions":[{"type":"read_tree","path":"."}]}"#);
        f.mock
            .push_text(r#"{"actions":[{"type":"done","reason":"ok"}]}"#);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let config = LoopConfig {
            on_progress: Some(Arc::new(move |i| {
                seen_clone.lock().unwrap().push(i);
            })),
            ..Default::default()
        };

        let _ = f.worker.execute_task_with_loop(&task, &config).await;
        assert_eq!(seen.lock().unwrap().as_slice(), &[1, 2]);
    }

    #[tokio::test]
    async fn max_iterations_bounds_the_loop() {
        let f = fixture().await;
        let task = task_for(&f.beads);
        for i in 0..3 {
            f.mock.push_text(format!(
                r#"{{"actions":[{{"type":"read_file","path":"f{i}.rs"}}]}}"#
            ));
        }

        let config = LoopConfig {
            max_iterations: 3,
            ..Default::default()
        };
        let result = f.worker.execute_task_with_loop(&task, &config).await;
        assert_eq!(result.terminal_reason, TerminalReason::MaxIterations);
        assert_eq!(result.iterations, 3);
        assert!(result.action_log.len() <= 3);
    }

    #[test]
    fn trim_keeps_system_and_latest() {
        let mut turns = vec![ChatTurn::system("sys")];
        for i in 0..20 {
            turns.push(ChatTurn::user("x".repeat(400 * (i + 1))));
        }
        turns.push(ChatTurn::user("latest question"));

        let trimmed = trim_messages(&turns, 500);
        assert_eq!(trimmed.first().unwrap().role, "system");
        assert_eq!(trimmed.last().unwrap().content, "latest question");
        assert!(trimmed[1].content.contains("[Note:"));
        assert!(trimmed.len() < turns.len());
    }

    #[test]
    fn trim_noop_under_budget() {
        let turns = vec![
            ChatTurn::system("sys"),
            ChatTurn::user("hello"),
        ];
        let trimmed = trim_messages(&turns, 10_000);
        assert_eq!(trimmed.len(), 2);
        assert!(!trimmed.iter().any(|m| m.content.contains("[Note:")));
    }

    #[test]
    fn reduce_middle_fractions() {
        let wire: Vec<WireMessage> = (0..10)
            .map(|i| WireMessage::new("user", format!("m{i}")))
            .collect();
        let half = reduce_middle(&wire, 0.5);
        // 8 middle messages -> keep 4 newest, plus first, last, notice.
        assert_eq!(half.len(), 7);
        assert_eq!(half[0].content, "m0");
        assert!(half[1].content.contains("4 older"));
        assert_eq!(half.last().unwrap().content, "m9");
        assert_eq!(half[2].content, "m5");

        let none = reduce_middle(&wire, 0.0);
        assert_eq!(none.len(), 3);
        assert!(none[1].content.contains("8 older"));
    }
}
