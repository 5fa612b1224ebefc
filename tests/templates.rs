use std::sync::Arc;

use promptl::compiler::chain::ChainOptions;
use promptl::compiler::scan::FileReferences;
use promptl::message::MessageRole;
use promptl::providers::ProviderConversation;
use promptl::{ChainError, CompileOptions, Document, ObjectMap, ReferenceFn, Scan, Value, render};
use tempfile::TempDir;

async fn render_with(source: &str, parameters: &[(&str, Value)]) -> Result<ProviderConversation, ChainError> {
    let parameters: ObjectMap = parameters
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect();
    render(source, parameters, ChainOptions::default()).await
}

fn text(conversation: &ProviderConversation, index: usize) -> &str {
    conversation.messages[index]["content"][0]["text"]
        .as_str()
        .unwrap_or_default()
}

fn error_code(result: Result<ProviderConversation, ChainError>) -> &'static str {
    match result {
        Err(ChainError::Compile(e)) => e.code(),
        other => panic!("expected compile error, got {:?}", other),
    }
}

#[tokio::test]
async fn outer_assignments_survive_blocks() {
    let out = render_with(
        "{{ a = 1 }}{{ if true }}{{ a = 2 }}{{ b = 3 }}{{ endif }}{{ a }}",
        &[],
    )
    .await
    .unwrap();
    assert_eq!(text(&out, 0), "2");

    let leaked = render_with("{{ if true }}{{ b = 3 }}{{ endif }}{{ b }}", &[])
        .await
        .unwrap();
    assert!(leaked.messages.is_empty(), "{:?}", leaked.messages);

    let looped = render_with("{{ total = 0 }}{{ for x in [1, 2, 3] }}{{ total += x }}{{ endfor }}{{ total }}", &[])
        .await
        .unwrap();
    assert_eq!(text(&looped, 0), "6");
}

#[tokio::test]
async fn scope_tags_only_see_passed_attributes() {
    let passed = render_with("<scope foo={{ foo }}>{{ foo }}</scope>", &[("foo", "bar".into())])
        .await
        .unwrap();
    assert_eq!(text(&passed, 0), "bar");

    let hidden = render_with("<scope>{{ foo }}</scope>", &[("foo", "bar".into())]).await;
    assert_eq!(error_code(hidden), "variable-not-declared");
}

#[tokio::test]
async fn tool_messages_require_id_and_name() {
    let no_id = render_with("<tool name=\"y\">body</tool>", &[]).await;
    assert_eq!(error_code(no_id), "tool-message-without-id");

    let no_name = render_with("<tool id=\"x\">body</tool>", &[]).await;
    assert_eq!(error_code(no_name), "tool-message-without-name");

    let ok = render_with("<tool id=\"x\" name=\"y\">body</tool>", &[]).await.unwrap();
    assert_eq!(ok.messages[0]["role"], "tool");
    assert_eq!(ok.messages[0]["content"][0]["toolCallId"], "x");
}

#[tokio::test]
async fn config_header_becomes_step_config() {
    let out = render_with("---\nmodel: gpt-4o\ntemperature: 0.2\n---\n<user>Hi {{ name }}</user>", &[("name", "Ada".into())])
        .await
        .unwrap();
    assert_eq!(out.config["model"], "gpt-4o");
    assert_eq!(out.messages[0]["role"], "user");
    assert_eq!(text(&out, 0), "Hi Ada");
}

#[tokio::test]
async fn default_role_applies_to_stray_text() {
    let options = ChainOptions::default().with_compile_options(CompileOptions {
        default_role: MessageRole::User,
        ..CompileOptions::default()
    });
    let out = render("Plain text", ObjectMap::new(), options).await.unwrap();
    assert_eq!(out.messages[0]["role"], "user");
}

#[tokio::test]
async fn scanned_references_render_as_scopes() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("greeting.promptl"), "Hello {{ who }}!").unwrap();
    let source = "<user><prompt path=\"greeting.promptl\" who={{ name }} /></user>";

    let refs: Arc<dyn ReferenceFn> = Arc::new(FileReferences::new(dir.path()));
    let metadata = Scan::new(Document::new(dir.path().join("main.promptl").to_string_lossy(), source))
        .with_reference_fn(refs)
        .run()
        .await;
    assert!(metadata.errors.is_empty(), "{:?}", metadata.errors);
    assert!(metadata.parameters.contains("name"));

    let out = render_with(&metadata.resolved_prompt, &[("name", "Ada".into())])
        .await
        .unwrap();
    assert_eq!(text(&out, 0), "Hello Ada!");

    let unresolved = render_with(source, &[("name", "Ada".into())]).await;
    assert_eq!(error_code(unresolved), "unresolved-reference");
}
