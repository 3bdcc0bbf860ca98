use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dotenvy::dotenv;
use futures_util::StreamExt;
use llmux::http::reqwest::ReqwestTransport;
use llmux::provider::openai_compat::OpenAiCompatProvider;
use llmux::{CompletionRequest, LLMClient, RequestContext};
use serde_json::json;

fn load_env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn build_request(model: &str) -> CompletionRequest {
    CompletionRequest::new(model).with_field(
        "messages",
        json!([
            {"role": "system", "content": "You are a helpful assistant."},
            {"role": "user", "content": "Please introduce Rust language in one sentence."}
        ]),
    )
}

#[tokio::test]
#[ignore = "requires valid OpenAI-compatible endpoint"]
async fn openai_chat_live_complete_and_stream() {
    let _ = dotenv();

    let Some(endpoint) = load_env_var("OPENAI_CHAT_ENDPOINT") else {
        eprintln!("skip live test: OPENAI_CHAT_ENDPOINT missing");
        return;
    };
    let Some(api_key) = load_env_var("OPENAI_CHAT_KEY") else {
        eprintln!("skip live test: OPENAI_CHAT_KEY missing");
        return;
    };
    let Some(model) = load_env_var("OPENAI_CHAT_MODEL") else {
        eprintln!("skip live test: OPENAI_CHAT_MODEL missing");
        return;
    };

    let transport = Arc::new(ReqwestTransport::default_client().expect("transport"));
    let provider = OpenAiCompatProvider::new(transport, api_key)
        .with_base_url(endpoint)
        .with_default_model(model.clone());
    let client = LLMClient::builder()
        .register_handle("live", Arc::new(provider))
        .build();

    let chunks_seen = Arc::new(AtomicUsize::new(0));
    let counter = chunks_seen.clone();
    client.callbacks().register_stream(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let ctx = RequestContext::background();
    let response = client
        .complete(&ctx, "live", build_request(&model))
        .await
        .expect("completion request should succeed");
    assert!(
        response.body["choices"].as_array().is_some_and(|c| !c.is_empty()),
        "completion response should contain choices"
    );

    let stream = client
        .stream(&ctx, "live", build_request(&model))
        .await
        .expect("streaming request should start");
    let mut stream = stream.into_stream();
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.expect("stream chunk should be valid");
        text.push_str(&chunk.text());
    }
    assert!(!text.is_empty(), "stream should yield text");
    assert!(chunks_seen.load(Ordering::SeqCst) > 0);
}
