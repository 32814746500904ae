use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::extract::OutputExtractor;
use crate::llm::{ChatRequest, LanguageModel, ModelCompletion, ToolChoice};
use crate::memory::Conversation;
use crate::message::ToolCallRequest;
use crate::tool::ToolRegistry;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
pub const DEFAULT_MAX_TOOL_INVOCATIONS: u32 = 5;

/// Returned instead of an answer once the tool round limit is reached.
pub const LIMIT_EXCEEDED: &str =
    "Tool invocation limit exceeded. Stopping to prevent infinite loop.";

const INCOMPLETE_TOOL_CALL: &str = "tool call was not completed";

/// What to do when a provider reports that a tool call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorPolicy {
    /// Abort `invoke()` with the error.
    #[default]
    Abort,
    /// Hand `{"error": <message>}` back to the model as the tool result.
    ReportToModel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub model: String,
    pub system_prompt: String,
    pub max_tool_invocations: u32,
    pub response_delimiters: Option<(String, String)>,
    pub tool_error_policy: ToolErrorPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_tool_invocations: DEFAULT_MAX_TOOL_INVOCATIONS,
            response_delimiters: None,
            tool_error_policy: ToolErrorPolicy::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_tool_invocations(mut self, max: u32) -> Self {
        self.max_tool_invocations = max;
        self
    }

    pub fn with_response_delimiters(
        mut self,
        open: impl Into<String>,
        close: impl Into<String>,
    ) -> Self {
        self.response_delimiters = Some((open.into(), close.into()));
        self
    }

    pub fn with_tool_error_policy(mut self, policy: ToolErrorPolicy) -> Self {
        self.tool_error_policy = policy;
        self
    }

    fn extractor(&self) -> Result<OutputExtractor> {
        match &self.response_delimiters {
            Some((open, close)) => OutputExtractor::between(open, close),
            None => Ok(OutputExtractor::identity()),
        }
    }
}

enum LoopState {
    QueryModel,
    DispatchTools(Vec<ToolCallRequest>),
    Finished(String),
}

/// Drives a conversation between a language model and the registered tools.
pub struct Agent<M: LanguageModel> {
    model: Arc<M>,
    config: AgentConfig,
    tools: ToolRegistry,
    conversation: Conversation,
    extractor: OutputExtractor,
    tool_invocation_count: u32,
    session_id: Uuid,
}

impl<M: LanguageModel> Agent<M> {
    pub fn new(model: Arc<M>, config: AgentConfig) -> Result<Self> {
        let extractor = config.extractor()?;
        Ok(Self {
            model,
            conversation: Conversation::new(config.system_prompt.clone()),
            config,
            tools: ToolRegistry::new(),
            extractor,
            tool_invocation_count: 0,
            session_id: Uuid::new_v4(),
        })
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn tools_mut(&mut self) -> &mut ToolRegistry {
        &mut self.tools
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Replaces the system prompt and clears the conversation.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        self.config.system_prompt = prompt.clone();
        self.conversation.set_system_prompt(prompt);
    }

    pub fn set_response_delimiters(
        &mut self,
        delimiters: Option<(String, String)>,
    ) -> Result<()> {
        self.extractor = match &delimiters {
            Some((open, close)) => OutputExtractor::between(open, close)?,
            None => OutputExtractor::identity(),
        };
        self.config.response_delimiters = delimiters;
        Ok(())
    }

    /// Number of tool rounds dispatched over the agent's lifetime.
    pub fn tool_invocation_count(&self) -> u32 {
        self.tool_invocation_count
    }

    /// The counter is never reset by the agent itself.
    pub fn reset_tool_invocation_count(&mut self) {
        self.tool_invocation_count = 0;
    }

    /// Appends `prompt` as a user message and runs the loop.
    pub async fn invoke_with_prompt(&mut self, prompt: impl Into<String>) -> Result<String> {
        self.settle_dangling_calls()?;
        self.conversation.append_user(prompt);
        self.invoke().await
    }

    /// Runs the loop on the current conversation until the model answers or
    /// the tool round limit is hit.
    pub async fn invoke(&mut self) -> Result<String> {
        let span = tracing::info_span!("invoke", session = %self.session_id);
        async move {
            self.settle_dangling_calls()?;
            self.run_loop().await
        }
        .instrument(span)
        .await
    }

    fn limit_reached(&self) -> bool {
        self.config.max_tool_invocations == 0
            || self.tool_invocation_count > self.config.max_tool_invocations
    }

    async fn run_loop(&mut self) -> Result<String> {
        let mut state = LoopState::QueryModel;
        loop {
            state = match state {
                LoopState::QueryModel => {
                    if self.limit_reached() {
                        tracing::warn!(
                            count = self.tool_invocation_count,
                            max = self.config.max_tool_invocations,
                            "tool invocation limit reached"
                        );
                        return Ok(LIMIT_EXCEEDED.to_string());
                    }
                    let completion = self.query_model().await?;
                    self.record_completion(completion)
                }
                LoopState::DispatchTools(calls) => {
                    self.tool_invocation_count += 1;
                    tracing::debug!(
                        round = self.tool_invocation_count,
                        calls = calls.len(),
                        "dispatching tool calls"
                    );
                    for call in &calls {
                        self.dispatch(call).await?;
                    }
                    LoopState::QueryModel
                }
                LoopState::Finished(answer) => return Ok(answer),
            };
        }
    }

    async fn query_model(&self) -> Result<ModelCompletion> {
        let tools = self.tools.get_tools();
        let (tools, tool_choice) = if tools.is_empty() {
            (None, None)
        } else {
            (Some(tools), Some(ToolChoice::Auto))
        };
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: self.conversation.snapshot().to_vec(),
            tools,
            tool_choice,
        };
        tracing::debug!(
            messages = request.messages.len(),
            tools = request.tools.as_ref().map_or(0, Vec::len),
            "querying model"
        );
        self.model.complete_chat(&request).await
    }

    /// Appends the assistant turn and decides the next state.
    fn record_completion(&mut self, completion: ModelCompletion) -> LoopState {
        let ModelCompletion {
            finish_reason,
            content,
            tool_calls,
        } = completion;
        let content = content.map(|text| self.extractor.apply(&text));
        let requested = if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls.clone())
        };
        self.conversation.append_assistant(content.clone(), requested);

        if finish_reason.wants_tools() {
            LoopState::DispatchTools(tool_calls)
        } else {
            tracing::debug!(?finish_reason, "model finished");
            LoopState::Finished(content.unwrap_or_default())
        }
    }

    async fn dispatch(&mut self, call: &ToolCallRequest) -> Result<()> {
        let arguments: Value =
            serde_json::from_str(&call.arguments).map_err(|source| AgentError::InvalidArguments {
                name: call.tool_name.clone(),
                source,
            })?;

        let result = match self.tools.execute_tool(&call.tool_name, arguments).await {
            Ok(value) => value,
            Err(AgentError::ToolExecution { name, message })
                if self.config.tool_error_policy == ToolErrorPolicy::ReportToModel =>
            {
                tracing::warn!(tool = %name, error = %message, "reporting tool failure to the model");
                json!({ "error": message })
            }
            Err(err) => return Err(err),
        };

        self.conversation
            .append_tool_result(call.id.clone(), serde_json::to_string(&result)?)
    }

    /// Answers calls left open by an interrupted `invoke()` so the transcript
    /// stays acceptable to the model.
    fn settle_dangling_calls(&mut self) -> Result<()> {
        let pending: Vec<String> = self
            .conversation
            .pending_tool_calls()
            .iter()
            .map(|call| call.id.clone())
            .collect();
        for id in pending {
            tracing::warn!(tool_call_id = %id, "closing tool call left open by an interrupted run");
            self.conversation
                .append_tool_result(id, json!({ "error": INCOMPLETE_TOOL_CALL }).to_string())?;
        }
        Ok(())
    }
}
