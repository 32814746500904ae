use crate::error::{AgentError, Result};
use crate::message::{Message, Role, ToolCallRequest};

/// Ordered transcript plus the active system prompt.
///
/// The transcript only ever grows, one message per append. The single
/// exception is [`Conversation::set_system_prompt`], which starts over from a
/// fresh system message.
#[derive(Clone, Debug)]
pub struct Conversation {
    system_prompt: String,
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        let system_prompt = system_prompt.into();
        Self {
            messages: vec![Message::system(system_prompt.clone())],
            system_prompt,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Replaces the system prompt and drops every prior message.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        *self = Self::new(prompt);
    }

    pub fn append_user(&mut self, text: impl Into<String>) {
        self.messages.push(Message::user(text));
    }

    pub fn append_assistant(
        &mut self,
        content: Option<String>,
        tool_calls: Option<Vec<ToolCallRequest>>,
    ) {
        self.messages.push(Message::assistant(content, tool_calls));
    }

    /// Appends a tool result. The id must belong to a request of the latest
    /// assistant message that has not been answered yet. A repeated id is
    /// answered once per occurrence.
    pub fn append_tool_result(
        &mut self,
        tool_call_id: impl Into<String>,
        result: impl Into<String>,
    ) -> Result<()> {
        let tool_call_id = tool_call_id.into();
        if !self
            .pending_tool_calls()
            .iter()
            .any(|call| call.id == tool_call_id)
        {
            return Err(AgentError::Protocol(format!(
                "tool result `{tool_call_id}` does not answer an outstanding tool call"
            )));
        }
        self.messages.push(Message::tool(tool_call_id, result));
        Ok(())
    }

    /// Requests of the latest assistant message that have no tool result yet.
    pub fn pending_tool_calls(&self) -> Vec<&ToolCallRequest> {
        let Some(idx) = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::Assistant)
        else {
            return Vec::new();
        };
        // Each result answers one request, so a repeated id needs one
        // result per occurrence.
        let mut answered: Vec<&str> = self.messages[idx + 1..]
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        self.messages[idx]
            .requested_calls()
            .iter()
            .filter(|call| match answered.iter().position(|id| *id == call.id) {
                Some(pos) => {
                    answered.swap_remove(pos);
                    false
                }
                None => true,
            })
            .collect()
    }

    pub fn snapshot(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message> + '_ {
        self.messages.iter()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new(crate::agent::DEFAULT_SYSTEM_PROMPT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest::new(id, "read", "{}")
    }

    #[test]
    fn starts_with_system_message() {
        let conversation = Conversation::new("be brief");
        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation.snapshot()[0].role, Role::System);
        assert_eq!(
            conversation.snapshot()[0].content.as_deref(),
            Some("be brief")
        );
    }

    #[test]
    fn each_append_grows_history_by_one() {
        let mut conversation = Conversation::new("sys");
        let mut previous = conversation.len();

        conversation.append_user("hello");
        assert_eq!(conversation.len(), previous + 1);
        previous = conversation.len();

        conversation.append_assistant(None, Some(vec![call("c1"), call("c2")]));
        assert_eq!(conversation.len(), previous + 1);
        previous = conversation.len();

        conversation.append_tool_result("c1", "{}").unwrap();
        assert_eq!(conversation.len(), previous + 1);
        previous = conversation.len();

        conversation.append_tool_result("c2", "{}").unwrap();
        assert_eq!(conversation.len(), previous + 1);
    }

    #[test]
    fn rejects_uncorrelated_tool_results() {
        let mut conversation = Conversation::new("sys");
        assert!(conversation.append_tool_result("nope", "{}").is_err());

        conversation.append_assistant(None, Some(vec![call("c1")]));
        conversation.append_tool_result("c1", "{}").unwrap();
        let err = conversation.append_tool_result("c1", "{}").unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)));
        assert_eq!(conversation.len(), 3);
    }

    #[test]
    fn repeated_ids_are_answered_once_per_request() {
        let mut conversation = Conversation::new("sys");
        conversation.append_assistant(None, Some(vec![call("c"), call("c")]));

        conversation.append_tool_result("c", "{}").unwrap();
        assert_eq!(conversation.pending_tool_calls().len(), 1);
        conversation.append_tool_result("c", "{}").unwrap();
        assert!(conversation.pending_tool_calls().is_empty());
        assert!(conversation.append_tool_result("c", "{}").is_err());
    }

    #[test]
    fn tracks_pending_calls_of_latest_assistant_turn() {
        let mut conversation = Conversation::new("sys");
        conversation.append_assistant(None, Some(vec![call("a"), call("b")]));
        conversation.append_tool_result("a", "{}").unwrap();

        let pending: Vec<&str> = conversation
            .pending_tool_calls()
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(pending, vec!["b"]);
    }

    #[test]
    fn replacing_system_prompt_discards_history() {
        let mut conversation = Conversation::new("first");
        conversation.append_user("hi");
        conversation.append_assistant(Some("hello".into()), None);

        conversation.set_system_prompt("second");

        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation.system_prompt(), "second");
        assert_eq!(conversation.snapshot()[0].content.as_deref(), Some("second"));
    }
}
