use std::sync::Arc;

use serde_json::json;

use agentwire::{
    Agent, AgentConfig, AgentError, ModelCompletion, ProviderConfig, ProviderPool, Role,
    ScriptedModel, ToolCallRequest, ToolRegistry, LIMIT_EXCEEDED,
};

fn fs_provider(root: &std::path::Path) -> ProviderConfig {
    ProviderConfig::stdio(
        "fs",
        env!("CARGO_BIN_EXE_fs-provider"),
        ["--root-dir".to_string(), root.display().to_string()],
    )
}

#[tokio::test]
async fn model_reads_a_file_through_the_provider() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "hi").unwrap();

    let pool = ProviderPool::connect(&[fs_provider(dir.path())]).await.unwrap();
    let mut tools = ToolRegistry::new();
    pool.register_tools(&mut tools).await.unwrap();

    let model = ScriptedModel::new(vec![
        ModelCompletion::tool_calls(vec![ToolCallRequest::new(
            "c1",
            "read",
            r#"{"path":"a.txt"}"#,
        )]),
        ModelCompletion::text("The file says hi"),
    ]);
    let mut agent = Agent::new(Arc::clone(&model), AgentConfig::default())
        .unwrap()
        .with_tools(tools);

    let answer = agent.invoke_with_prompt("What does a.txt say?").await.unwrap();
    assert_eq!(answer, "The file says hi");
    assert_eq!(agent.tool_invocation_count(), 1);

    let tool_message = agent
        .conversation()
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    let result: serde_json::Value =
        serde_json::from_str(tool_message.content.as_deref().unwrap()).unwrap();
    assert_eq!(result["content"], "hi");

    let catalog = model.requests()[0].tools.clone().unwrap();
    let names: Vec<_> = catalog.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["list", "read", "write"]);

    pool.shutdown().await;
}

#[tokio::test]
async fn provider_failure_aborts_the_invocation() {
    let dir = tempfile::tempdir().unwrap();
    let pool = ProviderPool::connect(&[fs_provider(dir.path())]).await.unwrap();
    let mut tools = ToolRegistry::new();
    pool.register_tools(&mut tools).await.unwrap();

    let model = ScriptedModel::new(vec![ModelCompletion::tool_calls(vec![ToolCallRequest::new(
        "c1",
        "read",
        r#"{"path":"missing.txt"}"#,
    )])]);
    let mut agent = Agent::new(model, AgentConfig::default())
        .unwrap()
        .with_tools(tools);

    let err = agent.invoke_with_prompt("read it").await.unwrap_err();
    assert!(matches!(err, AgentError::ToolExecution { ref name, .. } if name == "read"));

    pool.shutdown().await;
}

#[tokio::test]
async fn looping_model_hits_the_limit_with_real_tools() {
    let dir = tempfile::tempdir().unwrap();
    let pool = ProviderPool::connect(&[fs_provider(dir.path())]).await.unwrap();
    let mut tools = ToolRegistry::new();
    pool.register_tools(&mut tools).await.unwrap();

    let model = ScriptedModel::repeating(ModelCompletion::tool_calls(vec![ToolCallRequest::new(
        "c1",
        "list",
        json!({"path": "."}).to_string(),
    )]));
    let mut agent = Agent::new(
        Arc::clone(&model),
        AgentConfig::default().with_max_tool_invocations(2),
    )
    .unwrap()
    .with_tools(tools);

    assert_eq!(agent.invoke_with_prompt("list forever").await.unwrap(), LIMIT_EXCEEDED);
    assert_eq!(model.request_count(), 3);

    pool.shutdown().await;
}
