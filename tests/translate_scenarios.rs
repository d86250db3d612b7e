use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use relaybridge::config::ChannelConfig;
use relaybridge::observability::token_counter::HeuristicTokenizer;
use relaybridge::protocol::canonical::{IngressApi, UpstreamWire, Usage};
use relaybridge::relay::{
    relay_body, Adaptor, ChannelAdaptor, Downstream, InboundRequest, Pairing, RelayContext,
    RelayOutcome,
};
use relaybridge::stream::decoder::decode_document;
use relaybridge::stream::{canonical_event_stream, ScannerLimits, TranslationState};
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn sse(events: &[Value]) -> Vec<String> {
    events.iter().map(|event| format!("data: {event}\n\n")).collect()
}

fn body(chunks: Vec<String>) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    futures_util::stream::iter(chunks.into_iter().map(|chunk| Ok(Bytes::from(chunk))))
}

fn context(pairing: Pairing, include_usage: bool) -> RelayContext {
    RelayContext {
        ingress: IngressApi::OpenAiChat,
        pairing,
        model: "gpt-5".to_string(),
        prompt_estimate: 11,
        include_usage,
        thinking_to_content: false,
        limits: ScannerLimits::default(),
        upstream_status: 200,
        response_id: "chatcmpl-scenario".to_string(),
        created: 1_700_000_000,
    }
}

async fn run(ctx: &RelayContext, chunks: Vec<String>) -> (Vec<Bytes>, RelayOutcome) {
    let (tx, mut rx) = mpsc::channel(8);
    let ctx = ctx.clone();
    let task = tokio::spawn(async move {
        relay_body(&ctx, body(chunks), Some("text/event-stream"), &HeuristicTokenizer, &tx).await
    });
    let mut frames = Vec::new();
    while let Some(message) = rx.recv().await {
        match message {
            Downstream::Frame(frame) => frames.push(frame),
            Downstream::Failed(err) => panic!("unexpected failure: {err}"),
        }
    }
    (frames, task.await.unwrap())
}

fn chunk_json(frame: &Bytes) -> Value {
    let text = std::str::from_utf8(frame).unwrap();
    serde_json::from_str(text.trim_start_matches("data: ").trim_end()).unwrap()
}

#[tokio::test]
async fn test_text_deltas_become_chat_chunks() {
    let chunks = sse(&[
        json!({"type": "response.created", "response": {"id": "resp_1", "model": "gpt-5", "created_at": 1}}),
        json!({"type": "response.output_text.delta", "item_id": "msg_1", "output_index": 0, "delta": "Hel"}),
        json!({"type": "response.output_text.delta", "item_id": "msg_1", "output_index": 0, "delta": "lo wor"}),
        json!({"type": "response.output_text.delta", "item_id": "msg_1", "output_index": 0, "delta": "ld!"}),
        json!({"type": "response.completed", "response": {"id": "resp_1", "output": [],
            "usage": {"input_tokens": 5, "output_tokens": 3, "total_tokens": 8}}}),
    ]);
    let (frames, outcome) = run(&context(Pairing::ResponsesToChatStream, true), chunks).await;

    assert_eq!(frames.len(), 7);
    assert_eq!(chunk_json(&frames[0])["choices"][0]["delta"]["role"], "assistant");
    let contents: Vec<Value> = frames[1..4]
        .iter()
        .map(|frame| chunk_json(frame)["choices"][0]["delta"]["content"].clone())
        .collect();
    assert_eq!(contents, vec![json!("Hel"), json!("lo wor"), json!("ld!")]);
    assert_eq!(chunk_json(&frames[4])["choices"][0]["finish_reason"], "stop");
    let usage = chunk_json(&frames[5]);
    assert_eq!(usage["usage"]["prompt_tokens"], 5);
    assert_eq!(usage["usage"]["completion_tokens"], 3);
    assert_eq!(usage["usage"]["total_tokens"], 8);
    assert_eq!(&frames[6][..], b"data: [DONE]\n\n");

    assert_eq!(outcome.usage, Usage::new(5, 3, 8));
    assert_eq!(outcome.text, "Hello world!");
    assert!(!outcome.cancelled);
}

#[tokio::test]
async fn test_function_call_streams_as_tool_chunks() {
    let chunks = sse(&[
        json!({"type": "response.output_item.added", "output_index": 0, "item": {
            "type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "lookup", "arguments": ""}}),
        json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "output_index": 0, "delta": "{\"q\":"}),
        json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "output_index": 0, "delta": "\"x\"}"}),
        json!({"type": "response.completed", "response": {"id": "resp_2", "output": []}}),
    ]);
    let (frames, outcome) = run(&context(Pairing::ResponsesToChatStream, false), chunks).await;

    let tool_chunks: Vec<Value> = frames
        .iter()
        .filter(|frame| frame.as_ref() != b"data: [DONE]\n\n")
        .map(chunk_json)
        .filter(|chunk| !chunk["choices"][0]["delta"]["tool_calls"].is_null())
        .collect();
    assert_eq!(tool_chunks.len(), 3);
    let calls: Vec<&Value> = tool_chunks
        .iter()
        .map(|chunk| &chunk["choices"][0]["delta"]["tool_calls"][0])
        .collect();
    assert!(calls.iter().all(|call| call["index"] == 0));
    assert_eq!(calls[0]["function"]["name"], "lookup");
    assert!(calls[1]["function"].get("name").is_none());
    assert!(calls[2]["function"].get("name").is_none());
    assert_eq!(calls[1]["function"]["arguments"], "{\"q\":");
    assert_eq!(calls[2]["function"]["arguments"], "\"x\"}");

    let stop = frames
        .iter()
        .filter(|frame| frame.as_ref() != b"data: [DONE]\n\n")
        .map(chunk_json)
        .find(|chunk| !chunk["choices"][0]["finish_reason"].is_null())
        .unwrap();
    assert_eq!(stop["choices"][0]["finish_reason"], "tool_calls");
    assert!(outcome.usage.completion_tokens > 0);
    assert_eq!(outcome.usage.prompt_tokens, 11);
    assert_eq!(
        outcome.usage.total_tokens,
        outcome.usage.prompt_tokens + outcome.usage.completion_tokens
    );
}

#[tokio::test]
async fn test_malformed_event_is_skipped() {
    let mut chunks = sse(&[json!({"type": "response.output_text.delta", "item_id": "m", "delta": "a"})]);
    chunks.push("data: {not json\n\n".to_string());
    chunks.extend(sse(&[
        json!({"type": "response.output_text.delta", "item_id": "m", "delta": "b"}),
        json!({"type": "response.completed", "response": {"id": "r", "output": []}}),
    ]));
    let (frames, outcome) = run(&context(Pairing::ResponsesToChatStream, false), chunks).await;

    let contents: Vec<String> = frames
        .iter()
        .filter(|frame| frame.as_ref() != b"data: [DONE]\n\n")
        .map(chunk_json)
        .filter_map(|chunk| {
            chunk["choices"][0]["delta"]["content"]
                .as_str()
                .filter(|text| !text.is_empty())
                .map(str::to_string)
        })
        .collect();
    assert_eq!(contents, vec!["a", "b"]);
    assert_eq!(outcome.text, "ab");
    assert!(outcome.error.is_none());
}

#[tokio::test]
async fn test_snapshot_and_deltas_finalize_alike() {
    let message = json!({"type": "message", "id": "msg_1", "role": "assistant", "status": "completed",
        "content": [{"type": "output_text", "text": "Hello"}]});
    let usage = json!({"input_tokens": 5, "output_tokens": 2, "total_tokens": 7});

    let streamed = sse(&[
        json!({"type": "response.output_text.delta", "item_id": "msg_1", "output_index": 0, "delta": "Hel"}),
        json!({"type": "response.output_text.delta", "item_id": "msg_1", "output_index": 0, "delta": "lo"}),
        json!({"type": "response.output_item.done", "output_index": 0, "item": message}),
        json!({"type": "response.completed", "response": {"id": "resp_1", "output": [], "usage": usage}}),
    ]);
    let mut from_stream = TranslationState::new(false);
    let events = canonical_event_stream(body(streamed), UpstreamWire::Responses, ScannerLimits::default());
    futures_util::pin_mut!(events);
    while let Some(event) = events.next().await {
        from_stream.apply(event.unwrap()).unwrap();
    }

    let document = json!({"id": "resp_1", "object": "response", "status": "completed",
        "model": "gpt-5", "output": [message], "usage": usage});
    let mut from_snapshot = TranslationState::new(false);
    for event in decode_document(UpstreamWire::Responses, document.to_string().as_bytes()).unwrap() {
        from_snapshot.apply(event).unwrap();
    }

    let streamed = from_stream.finalize(11, "gpt-5", &HeuristicTokenizer);
    let snapshot = from_snapshot.finalize(11, "gpt-5", &HeuristicTokenizer);
    assert_eq!(streamed.outputs, snapshot.outputs);
    assert_eq!(streamed.usage, snapshot.usage);
    assert_eq!(snapshot.usage, Usage::new(5, 2, 7));
}

#[tokio::test]
async fn test_codex_non_stream_responses_are_synthesized() {
    let channel = ChannelConfig {
        name: "codex".to_string(),
        provider: "codex".to_string(),
        base_url: "https://codex.example".to_string(),
        api_key: "token".to_string(),
        models: vec!["gpt-5-codex".to_string()],
        chat_via_responses: false,
        chat_via_responses_models: Vec::new(),
        thinking_to_content: false,
        proxy: None,
    };
    let adaptor = ChannelAdaptor::from_config(&channel).unwrap();
    let inbound = json!({"model": "gpt-5-codex", "input": "hi"});
    let plan = adaptor
        .plan(&InboundRequest {
            ingress: IngressApi::OpenAiResponses,
            path: "/v1/responses",
            body: &inbound,
            upstream_model: "gpt-5-codex",
            stream: false,
            gemini_action: None,
        })
        .unwrap();
    assert_eq!(plan.pairing, Pairing::ResponsesToResponseDocument);

    let completed = json!({"type": "response.completed", "response": {
        "id": "resp_9", "object": "response", "model": "gpt-5-codex", "background": false,
        "billing": {"payer": "openai"}, "status": "completed",
        "output": [{"type": "message", "id": "m", "role": "assistant",
            "content": [{"type": "output_text", "text": "done"}]}],
        "usage": {"input_tokens": 3, "output_tokens": 1, "total_tokens": 4}}});
    let mut ctx = context(plan.pairing, false);
    ctx.ingress = IngressApi::OpenAiResponses;
    let (frames, outcome) = run(&ctx, sse(&[completed])).await;

    assert_eq!(frames.len(), 1);
    let document: Value = serde_json::from_slice(&frames[0]).unwrap();
    assert_eq!(document["id"], "resp_9");
    assert_eq!(document["billing"], json!({"payer": "developer"}));
    assert_eq!(outcome.usage, Usage::new(3, 1, 4));
    assert_eq!(outcome.text, "done");
}

#[tokio::test]
async fn test_slow_client_is_paced_and_cancellation_keeps_usage() {
    let deltas: Vec<Value> = (0..64)
        .map(|i| json!({"type": "response.output_text.delta", "item_id": "m", "delta": format!("word{i} ")}))
        .collect();
    let ctx = context(Pairing::ResponsesToChatStream, false);
    let (tx, mut rx) = mpsc::channel(1);
    let task = tokio::spawn(async move {
        relay_body(&ctx, body(sse(&deltas)), None, &HeuristicTokenizer, &tx).await
    });
    for _ in 0..3 {
        assert!(matches!(rx.recv().await, Some(Downstream::Frame(_))));
    }
    drop(rx);

    let outcome = task.await.unwrap();
    assert!(outcome.cancelled);
    assert!(outcome.error.is_none());
    assert!(outcome.usage.completion_tokens > 0);
    assert!(!outcome.text.is_empty());
}

#[tokio::test]
async fn test_arguments_done_without_payload_keeps_streamed_arguments() {
    let chunks = sse(&[
        json!({"type": "response.output_item.added", "output_index": 0, "item": {
            "type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "lookup", "arguments": ""}}),
        json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "output_index": 0, "delta": "{\"q\":"}),
        json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "output_index": 0, "delta": "\"x\"}"}),
        json!({"type": "response.function_call_arguments.done", "item_id": "fc_1", "output_index": 0}),
        json!({"type": "response.output_item.done", "output_index": 0, "item": {
            "type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "lookup"}}),
        json!({"type": "response.completed", "response": {"id": "resp_3", "output": []}}),
    ]);
    let (frames, _) = run(&context(Pairing::ResponsesToChatDocument, false), chunks).await;

    assert_eq!(frames.len(), 1);
    let completion: Value = serde_json::from_slice(&frames[0]).unwrap();
    let call = &completion["choices"][0]["message"]["tool_calls"][0];
    assert_eq!(call["id"], "call_1");
    assert_eq!(call["function"]["arguments"], "{\"q\":\"x\"}");
    assert_eq!(completion["choices"][0]["finish_reason"], "tool_calls");
}

#[tokio::test]
async fn test_usage_chunk_withheld_unless_client_asked() {
    let chunks = vec![
        format!("data: {}\n\n", json!({"id": "c1", "choices": [{"index": 0, "delta": {"content": "hi"}}]})),
        format!("data: {}\n\n", json!({"id": "c1", "choices": [],
            "usage": {"prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6}})),
        "data: [DONE]\n\n".to_string(),
    ];
    let pairing = Pairing::StreamPassthrough(UpstreamWire::ChatCompletions);

    let (frames, outcome) = run(&context(pairing, false), chunks.clone()).await;
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|frame| !frame.windows(12).any(|w| w == b"\"choices\":[]")));
    assert_eq!(outcome.usage, Usage::new(5, 1, 6));

    let (frames, outcome) = run(&context(pairing, true), chunks).await;
    assert_eq!(frames.len(), 3);
    assert_eq!(outcome.usage, Usage::new(5, 1, 6));
}

#[tokio::test]
async fn test_silent_upstream_is_abandoned_when_client_leaves() {
    for pairing in [
        Pairing::ResponsesToChatStream,
        Pairing::StreamPassthrough(UpstreamWire::ChatCompletions),
        Pairing::DocumentPassthrough(UpstreamWire::ChatCompletions),
        Pairing::ResponsesToChatDocument,
    ] {
        let ctx = context(pairing, false);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let silent = futures_util::stream::pending::<Result<Bytes, Infallible>>();
        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            relay_body(&ctx, silent, Some("text/event-stream"), &HeuristicTokenizer, &tx),
        )
        .await
        .unwrap_or_else(|_| panic!("{pairing:?} kept waiting on a silent upstream"));
        assert!(outcome.cancelled, "{pairing:?}");
        assert!(outcome.error.is_none(), "{pairing:?}");
    }
}

#[tokio::test]
async fn test_client_leaving_mid_stream_keeps_streamed_usage() {
    let head = sse(&[json!({"type": "response.output_text.delta", "item_id": "m", "delta": "partial answer"})]);
    let upstream = body(head).chain(futures_util::stream::pending::<Result<Bytes, Infallible>>());
    let ctx = context(Pairing::ResponsesToChatStream, false);
    let (tx, mut rx) = mpsc::channel(4);
    let task = tokio::spawn(async move {
        relay_body(&ctx, upstream, None, &HeuristicTokenizer, &tx).await
    });
    assert!(matches!(rx.recv().await, Some(Downstream::Frame(_))));
    drop(rx);

    let outcome = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("relay did not notice the client leaving")
        .unwrap();
    assert!(outcome.cancelled);
    assert!(outcome.usage.completion_tokens > 0);
    assert_eq!(outcome.text, "partial answer");
}

#[tokio::test]
async fn test_truncated_codex_stream_synthesizes_developer_billed_response() {
    let chunks = sse(&[
        json!({"type": "response.created", "response": {"id": "resp_7", "model": "gpt-5-codex", "created_at": 3}}),
        json!({"type": "response.output_text.delta", "item_id": "msg_7", "output_index": 0, "delta": "all "}),
        json!({"type": "response.output_text.delta", "item_id": "msg_7", "output_index": 0, "delta": "done"}),
    ]);
    let mut ctx = context(Pairing::ResponsesToResponseDocument, false);
    ctx.ingress = IngressApi::OpenAiResponses;
    let (frames, outcome) = run(&ctx, chunks).await;

    assert_eq!(frames.len(), 1);
    let document: Value = serde_json::from_slice(&frames[0]).unwrap();
    assert_eq!(document["id"], "resp_7");
    assert_eq!(document["output"][0]["content"][0]["text"], "all done");
    assert_eq!(document["billing"], json!({"payer": "developer"}));
    assert_eq!(outcome.text, "all done");
}
