use std::collections::HashSet;
use std::sync::Arc;

use chatloom_common::{Error, Result, new_id};
use chatloom_config::RuntimeConfig;
use chatloom_db::{
    AgentDirectory, AgentProfile, Attachment, AttachmentStore, MessageBody, MessageRole,
    MessageStore, NewConversation, NewMessage, StoredMessage, TokenUsage,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::accumulator::ToolCallAssembler;
use crate::attachments::{ManifestEntry, manifest_json, prompt_with_manifest};
use crate::catalog::{ToolCatalog, ToolSelection};
use crate::context::RequestContext;
use crate::events::{ChatEvent, EventKind, EventSink};
use crate::invoker::ToolInvoker;
use crate::locks::ConversationLocks;
use crate::providers::{
    ChatMessage, LlmProvider, LlmRequest, ProviderRegistry, ProviderSettings, ToolCall,
    ToolChoice, ToolDefinition, Usage,
};
use crate::tools::ToolContext;

const MAX_TITLE_CHARS: usize = 64;
const DEFAULT_TITLE: &str = "New conversation";
/// Leading model directives that never belong in a title.
const TITLE_DIRECTIVES: [&str; 2] = ["/no_think", "/think"];
const ROUND_SEPARATOR: &str = "\n\n";

/// Caller-facing end of a turn's event pipe.
pub type EventStream = ReceiverStream<ChatEvent>;

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub max_tool_rounds: usize,
    pub history_window: usize,
    pub event_buffer: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        (&RuntimeConfig::default()).into()
    }
}

impl From<&RuntimeConfig> for RuntimeSettings {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            max_tool_rounds: config.max_tool_rounds.max(1),
            history_window: config.history_window.max(1),
            event_buffer: config.event_buffer.max(1),
        }
    }
}

/// One user turn as received from the API.
#[derive(Debug, Clone, Default)]
pub struct SendMessageRequest {
    pub service_user_id: String,
    /// Replaces the agent's system prompt for this turn.
    pub system_prompt: Option<String>,
    pub message: String,
    pub conversation_id: Option<String>,
    pub tools: ToolSelection,
    pub attachments: Vec<String>,
    /// Falls back to the agent's default when absent.
    pub streamable: Option<bool>,
    /// Literal answer replayed without calling the model.
    pub predefined_answer: Option<String>,
}

/// Conversation title from a first user message.
pub fn derive_title(message: &str) -> String {
    let mut text = message.trim_start();
    while let Some(rest) = TITLE_DIRECTIVES.iter().find_map(|directive| {
        text.strip_prefix(directive)
            .filter(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
    }) {
        text = rest.trim_start();
    }
    let title: String = text.trim().chars().take(MAX_TITLE_CHARS).collect();
    if title.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title
    }
}

/// Why a turn stopped early.
enum Interrupt {
    Disconnected,
    Failed(Error),
}

impl From<Error> for Interrupt {
    fn from(e: Error) -> Self {
        Interrupt::Failed(e)
    }
}

type Flow<T> = std::result::Result<T, Interrupt>;

/// Result of one model call.
struct Round {
    content: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
}

/// Identity and event sink of the turn being processed.
struct Turn {
    ctx: RequestContext,
    conversation_id: String,
    request_id: String,
    sink: EventSink,
    streaming: bool,
}

impl Turn {
    fn new_message(&self, body: MessageBody) -> NewMessage {
        NewMessage {
            conversation_id: self.conversation_id.clone(),
            agent_id: self.ctx.agent_id().to_string(),
            application_id: self.ctx.application_id.clone(),
            request_id: self.request_id.clone(),
            body,
        }
    }

    fn tool_context(&self) -> ToolContext {
        ToolContext {
            conversation_id: self.conversation_id.clone(),
            request_id: self.request_id.clone(),
            agent_id: self.ctx.agent_id().to_string(),
            application_id: self.ctx.application_id.clone(),
        }
    }

    async fn emit(&self, kind: EventKind, content: impl Into<String>) -> Flow<()> {
        if self.sink.emit(kind, content).await {
            Ok(())
        } else {
            Err(Interrupt::Disconnected)
        }
    }
}

/// Drives turns: history, model rounds, tool dispatch and the durable trace.
#[derive(Clone)]
pub struct ConversationRuntime {
    messages: Arc<dyn MessageStore>,
    attachments: Arc<dyn AttachmentStore>,
    directory: Arc<dyn AgentDirectory>,
    providers: ProviderRegistry,
    catalog: Arc<ToolCatalog>,
    invoker: Arc<ToolInvoker>,
    settings: RuntimeSettings,
    locks: ConversationLocks,
}

impl ConversationRuntime {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        attachments: Arc<dyn AttachmentStore>,
        directory: Arc<dyn AgentDirectory>,
        providers: ProviderRegistry,
        catalog: Arc<ToolCatalog>,
        invoker: Arc<ToolInvoker>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            messages,
            attachments,
            directory,
            providers,
            catalog,
            invoker,
            settings,
            locks: ConversationLocks::new(),
        }
    }

    /// Locks shared with anything else that mutates a conversation.
    pub fn locks(&self) -> &ConversationLocks {
        &self.locks
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Start a turn and return its event stream.
    ///
    /// Only request validation and conversation resolution fail here; every
    /// later failure arrives as an `error` event.
    #[instrument(skip(self, ctx, request), fields(agent_id = %ctx.agent_id()))]
    pub async fn send_message(
        &self,
        ctx: RequestContext,
        request: SendMessageRequest,
    ) -> Result<EventStream> {
        let service_user_id = request.service_user_id.trim();
        if service_user_id.is_empty() {
            return Err(Error::Validation("service_user_id is required".into()));
        }
        if request.message.trim().is_empty() {
            return Err(Error::Validation("message must not be empty".into()));
        }

        let conversation_id = self.resolve_conversation(&ctx, &request).await?;
        let request_id = new_id();
        let (tx, rx) = mpsc::channel(self.settings.event_buffer);
        let turn = Turn {
            streaming: request.streamable.unwrap_or(ctx.agent.default_streamable),
            sink: EventSink::new(tx, conversation_id.clone(), request_id.clone()),
            ctx,
            conversation_id,
            request_id,
        };

        let span = info_span!(
            "turn",
            conversation_id = %turn.conversation_id,
            request_id = %turn.request_id
        );
        let runtime = self.clone();
        tokio::spawn(async move { runtime.run_serialized(turn, request).await }.instrument(span));

        Ok(ReceiverStream::new(rx))
    }

    /// Reuse the caller's conversation when it exists and belongs to them,
    /// otherwise start a new one.
    async fn resolve_conversation(
        &self,
        ctx: &RequestContext,
        request: &SendMessageRequest,
    ) -> Result<String> {
        let service_user_id = request.service_user_id.trim();
        if let Some(id) = request
            .conversation_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            match self.messages.get_conversation(id).await? {
                Some(conv)
                    if conv.agent_id == ctx.agent_id() && conv.service_user_id == service_user_id =>
                {
                    return Ok(conv.id);
                }
                Some(_) => warn!(conversation_id = %id, "conversation owned by another user, starting a new one"),
                None => debug!(conversation_id = %id, "unknown conversation, starting a new one"),
            }
        }

        let conv = self
            .messages
            .create_conversation(NewConversation {
                agent_id: ctx.agent_id().to_string(),
                application_id: ctx.application_id.clone(),
                service_user_id: service_user_id.to_string(),
                title: derive_title(&request.message),
            })
            .await?;
        info!(conversation_id = %conv.id, "created conversation");
        Ok(conv.id)
    }

    /// Run a turn while holding its conversation's lock.
    async fn run_serialized(&self, turn: Turn, request: SendMessageRequest) {
        let key = turn.conversation_id.clone();
        self.locks
            .run_locked(&key, self.run_turn(&turn, request))
            .await;
    }

    async fn run_turn(&self, turn: &Turn, request: SendMessageRequest) {
        match self.process(turn, request).await {
            Ok(()) => debug!("turn complete"),
            Err(Interrupt::Disconnected) => info!("client disconnected, turn abandoned"),
            Err(Interrupt::Failed(e)) => {
                warn!("turn failed: {e}");
                let _ = turn.sink.emit(EventKind::Error, e.public_message()).await;
            }
        }
    }

    async fn process(&self, turn: &Turn, request: SendMessageRequest) -> Flow<()> {
        let ctx = &turn.ctx;
        let bound = self.lookup_attachments(ctx, &request.attachments).await;
        let manifest = if bound.is_empty() {
            None
        } else {
            let entries: Vec<ManifestEntry> = bound.iter().map(ManifestEntry::from).collect();
            Some(manifest_json(&entries)?)
        };

        // History is read before the new message lands so it is not replayed twice.
        let history = self.load_history(turn).await?;

        let user_row = self
            .messages
            .append_message(turn.new_message(MessageBody::Message {
                role: MessageRole::User,
                content: request.message.clone(),
                attachments: manifest.clone(),
                usage: None,
            }))
            .await?;
        for attachment in &bound {
            if let Err(e) = self
                .attachments
                .bind_attachment(&attachment.id, &user_row.id, &turn.conversation_id)
                .await
            {
                warn!(attachment_id = %attachment.id, "failed to bind attachment: {e}");
            }
        }

        if let Some(answer) = request.predefined_answer {
            return self.replay_answer(turn, answer).await;
        }

        let (provider, model) = self.resolve_provider(&ctx.agent).await?;
        let tools = self.catalog.resolve_enabled_tools(ctx, &request.tools).await;

        let mut messages = Vec::with_capacity(history.len() + 2);
        let system_prompt = request
            .system_prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| ctx.agent.system_prompt.clone());
        if !system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(system_prompt));
        }
        messages.extend(history.iter().filter_map(history_message));
        messages.push(ChatMessage::user(match &manifest {
            Some(manifest) => prompt_with_manifest(manifest, &request.message),
            None => request.message,
        }));

        self.tool_loop(turn, provider.as_ref(), model, messages, tools)
            .await
    }

    /// Attachments owned by the agent; unknown ids are skipped.
    async fn lookup_attachments(&self, ctx: &RequestContext, ids: &[String]) -> Vec<Attachment> {
        let mut found = Vec::new();
        for id in ids.iter().map(|id| id.trim()).filter(|id| !id.is_empty()) {
            match self.attachments.get_attachment(id).await {
                Ok(Some(attachment)) if attachment.agent_id == ctx.agent_id() => {
                    found.push(attachment)
                }
                Ok(_) => warn!(attachment_id = %id, "skipping unknown attachment"),
                Err(e) => warn!(attachment_id = %id, "failed to load attachment: {e}"),
            }
        }
        found
    }

    async fn load_history(&self, turn: &Turn) -> Result<Vec<StoredMessage>> {
        let limit = turn
            .ctx
            .agent
            .context_length_limit
            .map(|n| n as usize)
            .filter(|n| *n > 0)
            .unwrap_or(self.settings.history_window);
        self.messages
            .recent_history(&turn.conversation_id, turn.ctx.agent_id(), limit)
            .await
    }

    async fn resolve_provider(&self, agent: &AgentProfile) -> Result<(Arc<dyn LlmProvider>, String)> {
        let model_id = agent
            .chat_model_id
            .as_deref()
            .ok_or_else(|| Error::Config(format!("agent '{}' has no chat model", agent.name)))?;
        let model = self
            .directory
            .chat_model(model_id)
            .await?
            .ok_or_else(|| Error::Config(format!("chat model '{model_id}' not found")))?;
        let provider = self
            .directory
            .llm_provider(&model.provider_id)
            .await?
            .ok_or_else(|| {
                Error::Config(format!("LLM provider for model '{}' not found", model.name))
            })?;
        let client = self
            .providers
            .build(&provider.kind, &ProviderSettings::from(&provider))?;
        Ok((client, model.name))
    }

    /// Persist a literal answer and replay it, one character per delta when
    /// streaming.
    async fn replay_answer(&self, turn: &Turn, answer: String) -> Flow<()> {
        self.record(
            turn,
            MessageBody::Message {
                role: MessageRole::Assistant,
                content: answer.clone(),
                attachments: None,
                usage: None,
            },
        )
        .await;
        if turn.streaming {
            for ch in answer.chars() {
                turn.emit(EventKind::AnswerDelta, ch.to_string()).await?;
            }
        }
        turn.emit(EventKind::Answer, answer).await
    }

    async fn tool_loop(
        &self,
        turn: &Turn,
        provider: &dyn LlmProvider,
        model: String,
        mut messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> Flow<()> {
        let agent = &turn.ctx.agent;
        let mut answer = String::new();
        let mut usage: Option<TokenUsage> = None;
        let mut tool_rounds = 0usize;
        let offered: HashSet<String> = tools.iter().map(|t| t.name.clone()).collect();

        loop {
            let request = LlmRequest {
                model: model.clone(),
                messages: messages.clone(),
                tools: tools.clone(),
                temperature: agent.temperature,
                top_p: agent.top_p,
                max_tokens: agent.max_output_tokens,
                tool_choice: ToolChoice::Auto,
            };

            let round = if turn.streaming {
                self.stream_round(turn, provider, &request, &mut answer).await?
            } else {
                let round = self.blocking_round(turn, provider, &request).await?;
                append_round_text(&mut answer, &round.content);
                round
            };
            if let Some(round_usage) = round.usage {
                usage.get_or_insert_with(TokenUsage::default).add(&round_usage.into());
            }

            if round.tool_calls.is_empty() {
                break;
            }
            if tool_rounds >= self.settings.max_tool_rounds {
                warn!(rounds = tool_rounds, "tool round limit reached");
                return Err(Interrupt::Failed(Error::Tool(format!(
                    "tool call limit of {} rounds exceeded",
                    self.settings.max_tool_rounds
                ))));
            }
            tool_rounds += 1;
            debug!(round = tool_rounds, calls = round.tool_calls.len(), "dispatching tool calls");

            let mut round_text = Some(round.content);
            for call in round.tool_calls {
                let output = self.dispatch_tool(turn, &call, &offered).await?;
                let text = round_text.take().unwrap_or_default();
                messages.push(ChatMessage::assistant_tool_call(text, call.clone()));
                messages.push(ChatMessage::tool_result(call.id, output));
            }
        }

        self.record(
            turn,
            MessageBody::Message {
                role: MessageRole::Assistant,
                content: answer.clone(),
                attachments: None,
                usage,
            },
        )
        .await;
        info!(rounds = tool_rounds, "answer complete");
        turn.emit(EventKind::Answer, answer).await
    }

    async fn blocking_round(
        &self,
        turn: &Turn,
        provider: &dyn LlmProvider,
        request: &LlmRequest,
    ) -> Flow<Round> {
        let response = tokio::select! {
            _ = turn.sink.closed() => return Err(Interrupt::Disconnected),
            response = provider.complete(request) => response?,
        };
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Agent("model returned no choices".into()))?;
        Ok(Round {
            content: choice.message.content,
            tool_calls: choice.message.tool_calls,
            usage: response.usage,
        })
    }

    /// Consume one streamed response, forwarding text as `answer_delta`.
    async fn stream_round(
        &self,
        turn: &Turn,
        provider: &dyn LlmProvider,
        request: &LlmRequest,
        answer: &mut String,
    ) -> Flow<Round> {
        let mut stream = tokio::select! {
            _ = turn.sink.closed() => return Err(Interrupt::Disconnected),
            stream = provider.complete_stream(request) => stream?,
        };

        let mut content = String::new();
        let mut assembler = ToolCallAssembler::new();
        let mut usage = None;
        loop {
            let chunk = tokio::select! {
                _ = turn.sink.closed() => return Err(Interrupt::Disconnected),
                next = stream.next() => match next {
                    Some(chunk) => chunk?,
                    None => break,
                },
            };
            for choice in chunk.choices {
                if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                    if content.is_empty() && !answer.is_empty() {
                        answer.push_str(ROUND_SEPARATOR);
                        turn.emit(EventKind::AnswerDelta, ROUND_SEPARATOR).await?;
                    }
                    content.push_str(&text);
                    answer.push_str(&text);
                    turn.emit(EventKind::AnswerDelta, text).await?;
                }
                for delta in &choice.delta.tool_calls {
                    assembler.apply(delta);
                }
            }
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
        }

        Ok(Round {
            content,
            tool_calls: assembler.finish(),
            usage,
        })
    }

    /// Run one tool call with its full trace. Tool failures become the result
    /// text; only a disconnected client stops the turn.
    #[instrument(skip(self, turn, call), fields(tool = %call.name, call_id = %call.id))]
    async fn dispatch_tool(
        &self,
        turn: &Turn,
        call: &ToolCall,
        offered: &HashSet<String>,
    ) -> Flow<String> {
        self.record(
            turn,
            MessageBody::FunctionCall {
                call_id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        )
        .await;
        turn.emit(EventKind::ToolCall, call.name.clone()).await?;
        turn.emit(EventKind::ToolCallProcessing, call.name.clone())
            .await?;

        let result = if offered.contains(&call.name) {
            let context = turn.tool_context();
            tokio::select! {
                _ = turn.sink.closed() => return Err(Interrupt::Disconnected),
                result = self.invoker.invoke(&context, call) => result,
            }
        } else {
            Err(Error::Tool(format!(
                "tool '{}' was not offered in this turn",
                call.name
            )))
        };
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                warn!("tool call failed: {e}");
                format!("tool call failed: {e}")
            }
        };

        self.record(
            turn,
            MessageBody::FunctionCallOutput {
                call_id: call.id.clone(),
                name: call.name.clone(),
                output: output.clone(),
            },
        )
        .await;
        turn.emit(EventKind::ToolCallEnd, call.name.clone()).await?;
        Ok(output)
    }

    /// Append a trace row. Failures past the user message are logged only.
    async fn record(&self, turn: &Turn, body: MessageBody) {
        let kind = body.kind();
        if let Err(e) = self.messages.append_message(turn.new_message(body)).await {
            warn!(%kind, "failed to persist turn message: {e}");
        }
    }
}

fn append_round_text(answer: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    if !answer.is_empty() {
        answer.push_str(ROUND_SEPARATOR);
    }
    answer.push_str(text);
}

/// Replayable history entry for a stored `message` row.
fn history_message(row: &StoredMessage) -> Option<ChatMessage> {
    let MessageBody::Message {
        role,
        content,
        attachments,
        ..
    } = &row.body
    else {
        return None;
    };
    match role {
        MessageRole::User => Some(ChatMessage::user(match attachments {
            Some(manifest) => prompt_with_manifest(manifest, content),
            None => content.clone(),
        })),
        MessageRole::Assistant => Some(ChatMessage::assistant(content.clone())),
        MessageRole::System => Some(ChatMessage::system(content.clone())),
        MessageRole::Tool => None,
    }
}
