//! Integration tests for the LLM judge.
//!
//! These tests make real API calls.
//! Run with: LITELLM_API_KEY=your_key cargo test --test llm_integration -- --ignored

use std::sync::Arc;

use debt_forge::analysis::{DebtJudgment, RationaleAnalyzer};
use debt_forge::evaluation::{ContextItem, ReasoningStep};
use debt_forge::llm::{GenerationRequest, LiteLlmClient, LlmProvider, Message};

fn create_test_client() -> LiteLlmClient {
    LiteLlmClient::from_env().expect("LITELLM_API_BASE / LITELLM_API_KEY must be set")
}

#[tokio::test]
#[ignore = "requires a live LLM endpoint"]
async fn test_simple_generation() {
    let client = create_test_client();

    let request = GenerationRequest::new(
        "",
        vec![
            Message::system("You are a helpful assistant. Reply concisely."),
            Message::user("What is 2 + 2? Reply with just the number."),
        ],
    )
    .with_max_tokens(10)
    .with_temperature(0.0);

    let response = client.generate(request).await.expect("generation");
    let content = response.first_content().expect("content");
    assert!(content.contains('4'), "unexpected reply: {}", content);
}

#[tokio::test]
#[ignore = "requires a live LLM endpoint"]
async fn test_judge_returns_usable_judgments() {
    let analyzer = RationaleAnalyzer::new(Arc::new(create_test_client()), "");

    let clean = ReasoningStep::new(0, "Add two numbers", "Return a + b as the task asks.")
        .with_context(ContextItem::new("task", "task", "Write add(a, b) returning the sum."));
    let judgment = analyzer.judge_step(&clean).await;
    assert!(
        !matches!(judgment, DebtJudgment::Malformed(_)),
        "judge reply was unusable: {:?}",
        judgment
    );

    let misled = ReasoningStep::new(
        1,
        "Add two numbers",
        "The blog post says add must take an array, so I changed the signature to add([a, b]).",
    )
    .with_context(ContextItem::new("task", "task", "Write add(a, b) returning the sum."))
    .with_context(ContextItem::new(
        "blog",
        "web",
        "In our 2014 library, add takes an array of numbers.",
    ));
    let analysis = analyzer.analyze(&[misled]).await;
    assert!((0.0..=1.0).contains(&analysis.overall_score));
}
