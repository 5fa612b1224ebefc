use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use promptl::compiler::chain::ChainOptions;
use promptl::{AdapterKind, Callable, Chain, ChainError, ObjectMap, StepResponse, Value};
use serde_json::json;

fn chain(source: &str) -> Chain {
    Chain::new(source, ObjectMap::new(), ChainOptions::default()).expect("chain")
}

fn texts(messages: &[serde_json::Value]) -> Vec<String> {
    messages
        .iter()
        .map(|message| message["content"][0]["text"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn two_steps_grow_the_conversation() {
    let mut c = chain("<step>first</step><step>second</step>");

    let one = c.step(None).await.unwrap();
    assert_eq!(one.messages.len(), 1);
    assert!(!one.completed);

    let two = c.step(Some("R1".into())).await.unwrap();
    assert_eq!(texts(&two.messages), vec!["first", "R1", "second"]);
    assert_eq!(two.messages[1]["role"], "assistant");
    assert!(!two.completed);

    let three = c.step(Some("R2".into())).await.unwrap();
    assert_eq!(texts(&three.messages), vec!["first", "R1", "second", "R2"]);
    assert!(three.completed);
    assert!(c.completed());

    match c.step(Some("R3".into())).await {
        Err(ChainError::AlreadyCompleted) => {}
        other => panic!("expected AlreadyCompleted, got {:?}", other),
    }
}

#[tokio::test]
async fn step_free_documents_need_one_acknowledgment() {
    let mut c = chain("{{ foo = 5 }} {{ foo += 2 }} {{ foo }}");
    let first = c.step(None).await.unwrap();
    assert_eq!(texts(&first.messages), vec!["7"]);
    assert!(!first.completed);

    let second = c.step(Some("ok".into())).await.unwrap();
    assert!(second.completed);
    assert_eq!(second.messages.len(), 2);

    let mut empty = chain("{{ x = 1 }}");
    let only = empty.step(None).await.unwrap();
    assert!(only.completed);
    assert!(only.messages.is_empty());
}

#[tokio::test]
async fn memoized_calls_run_once_per_iteration() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let tick = Callable::sync(move |_args| Ok(Value::Number(counter.fetch_add(1, Ordering::SeqCst) as f64 + 1.0)));
    let parameters = ObjectMap::from_iter([("tick".to_string(), Value::from(tick))]);

    let mut c = Chain::new(
        "{{ for i in [1, 2] }}<step>{{ tick() }}</step>{{ endfor }}done",
        parameters,
        ChainOptions::default(),
    )
    .unwrap();

    let mut step = c.step(None).await.unwrap();
    let mut responses = 0;
    while !step.completed {
        responses += 1;
        step = c.step(Some(format!("answer {responses}").into())).await.unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(responses, 3);
    assert_eq!(
        texts(&step.messages),
        vec!["1", "answer 1", "2", "answer 2", "done", "answer 3"]
    );
}

#[tokio::test]
async fn step_responses_bind_variables() {
    let mut c = chain(
        "<step as=\"reply\">Pick a number</step>\
         {{ if reply == \"4\" }}correct{{ else }}wrong{{ endif }}",
    );
    c.step(None).await.unwrap();
    let step = c.step(Some("4".into())).await.unwrap();
    assert_eq!(texts(&step.messages).last().map(String::as_str), Some("correct"));
}

#[tokio::test]
async fn structured_responses_parse_with_a_schema() {
    let mut c = chain("<step as=\"data\" schema=\"object\">Give json</step>{{ data.items.length }}");
    c.step(None).await.unwrap();
    let step = c
        .step(Some(StepResponse::from(json!("{\"items\": [1, 2, 3]}"))))
        .await
        .unwrap();
    assert_eq!(texts(&step.messages).last().map(String::as_str), Some("3"));
}

#[tokio::test]
async fn serialized_chains_continue_identically() {
    let source = "{{ n = 1 }}<step>a {{ n }}</step>{{ n += 1 }}<step>b {{ n }}</step>{{ n }}";
    let mut original = chain(source);
    original.step(None).await.unwrap();
    original.step(Some("R1".into())).await.unwrap();

    let saved = serde_json::to_string(&original.serialize()).unwrap();
    let mut restored = Chain::deserialize(serde_json::from_str(&saved).unwrap()).unwrap();
    assert_eq!(
        serde_json::to_value(restored.serialize()).unwrap(),
        serde_json::to_value(original.serialize()).unwrap()
    );

    let left = original.step(Some("R2".into())).await.unwrap();
    let right = restored.step(Some("R2".into())).await.unwrap();
    assert_eq!(
        serde_json::to_string(&left).unwrap(),
        serde_json::to_string(&right).unwrap()
    );
    assert_eq!(texts(&right.messages), vec!["a 1", "R1", "b 2", "R2", "2"]);

    let source = "{{ x = missing }}<step>a</step>[{{ x }}]";
    let mut original = chain(source);
    original.step(None).await.unwrap();
    let saved = serde_json::to_string(&original.serialize()).unwrap();
    let mut restored = Chain::deserialize(serde_json::from_str(&saved).unwrap()).unwrap();

    let left = original.step(Some("R1".into())).await.unwrap();
    let right = restored.step(Some("R1".into())).await.unwrap();
    assert_eq!(
        serde_json::to_string(&left).unwrap(),
        serde_json::to_string(&right).unwrap()
    );
    assert_eq!(texts(&right.messages).last().map(String::as_str), Some("[]"));
}

#[tokio::test]
async fn serialized_state_uses_camel_case_keys() {
    let mut c = chain("<step>x</step>");
    c.step(None).await.unwrap();
    let saved = serde_json::to_value(c.serialize()).unwrap();
    for key in ["rawText", "ast", "scope", "didStart", "completed", "adapterType", "compilerOptions", "globalMessages"] {
        assert!(saved.get(key).is_some(), "missing {key}");
    }
    assert_eq!(saved["adapterType"], "default");
}

#[tokio::test]
async fn openai_responses_round_trip_through_the_adapter() {
    let options = ChainOptions::default().with_adapter(AdapterKind::OpenAi);
    let mut c = Chain::new(
        "<system>Be brief</system><step><user>Hi</user></step><user>Thanks</user>",
        ObjectMap::new(),
        options,
    )
    .unwrap();

    let first = c.step(None).await.unwrap();
    assert_eq!(first.messages[0], json!({"role": "system", "content": "Be brief"}));
    assert_eq!(first.messages[1]["content"][0], json!({"type": "text", "text": "Hi"}));

    let second = c
        .step(Some(StepResponse::from(json!({"content": "Hello!"}))))
        .await
        .unwrap();
    assert_eq!(second.messages.len(), 4);
    assert_eq!(second.messages[2]["role"], "assistant");
    assert_eq!(second.messages[2]["content"][0]["text"], "Hello!");
    assert_eq!(second.messages[3]["content"][0]["text"], "Thanks");
}

#[tokio::test]
async fn compile_errors_surface_through_the_chain() {
    let mut c = chain("<tool name=\"y\">body</tool>");
    match c.step(None).await {
        Err(ChainError::Compile(e)) => assert_eq!(e.code(), "tool-message-without-id"),
        other => panic!("expected compile error, got {:?}", other),
    }
    assert!(!c.completed());
}
