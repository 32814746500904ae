//! Runs the agent loop offline: a scripted model asks for the `echo` tool
//! once, then answers with a delimited reply.

use serde_json::json;

use agentwire::{Agent, AgentConfig, ModelCompletion, ScriptedModel, ToolCallRequest, ToolRegistry};

#[tokio::main]
async fn main() -> agentwire::Result<()> {
    let model = ScriptedModel::new(vec![
        ModelCompletion::tool_calls(vec![ToolCallRequest::new(
            "call_1",
            "echo",
            json!({ "text": "hello from the tool" }).to_string(),
        )]),
        ModelCompletion::text("Thinking it over. <answer>The tool said hello.</answer>"),
    ]);

    let mut tools = ToolRegistry::new();
    tools.register_fn(
        "echo",
        "Echo the `text` argument back",
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        }),
        |args| async move { Ok(json!({ "echo": args["text"].clone() })) },
    );

    let config = AgentConfig::new("scripted").with_response_delimiters("<answer>", "</answer>");
    let mut agent = Agent::new(model.clone(), config)?.with_tools(tools);

    let answer = agent.invoke_with_prompt("Say hello through the echo tool.").await?;
    println!("answer: {answer}");
    println!("tool rounds: {}", agent.tool_invocation_count());
    for message in agent.conversation().iter() {
        println!(
            "  {:<9} {}",
            message.role.to_string(),
            message.content.as_deref().unwrap_or("<tool calls>")
        );
    }
    println!("model queries: {}", model.request_count());
    Ok(())
}
