use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use relaybridge::config::{
    AppConfig, ChannelConfig, ClientAuthConfig, ClientKeyConfig, FeaturesConfig, ServerConfig,
    StreamConfig,
};
use relaybridge::error::RelayError;
use relaybridge::history::{ConversationMessage, ConversationSink};
use relaybridge::protocol::canonical::IngressApi;
use relaybridge::routing::dispatch::dispatch_request;
use relaybridge::state::{AppState, SharedServices};
use serde_json::{json, Value};

const RESPONSES_SSE: &str = concat!(
    "data: {\"type\":\"response.created\",\"response\":{\"id\":\"resp_1\",\"model\":\"gpt-5\",\"created_at\":7}}\n\n",
    "data: {\"type\":\"response.output_text.delta\",\"item_id\":\"m\",\"output_index\":0,\"delta\":\"Hi \"}\n\n",
    "data: {\"type\":\"response.output_text.delta\",\"item_id\":\"m\",\"output_index\":0,\"delta\":\"there\"}\n\n",
    "data: {\"type\":\"response.completed\",\"response\":{\"id\":\"resp_1\",\"output\":[],",
    "\"usage\":{\"input_tokens\":4,\"output_tokens\":2,\"total_tokens\":6}}}\n\n",
);

#[derive(Default)]
struct RecordingSink {
    saved: Mutex<Vec<(String, Vec<ConversationMessage>, u64, u64, String)>>,
}

impl ConversationSink for RecordingSink {
    fn save_full_conversation(
        &self,
        conversation_id: &str,
        messages: &[ConversationMessage],
        _response: &Value,
        _model: &str,
        user_id: u64,
        token_id: u64,
        channel_id: &str,
    ) -> Result<(), RelayError> {
        self.saved.lock().push((
            conversation_id.to_string(),
            messages.to_vec(),
            user_id,
            token_id,
            channel_id.to_string(),
        ));
        Ok(())
    }
}

async fn spawn_upstream() -> String {
    let app = Router::new().route(
        "/v1/responses",
        post(|| async {
            (
                [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                RESPONSES_SSE,
            )
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn build_config(base_url: &str) -> AppConfig {
    AppConfig {
        server: ServerConfig::default(),
        stream: StreamConfig::default(),
        channels: vec![ChannelConfig {
            name: "primary".to_string(),
            provider: "openai".to_string(),
            base_url: base_url.to_string(),
            api_key: "sk-upstream".to_string(),
            models: vec!["smart:gpt-5".to_string()],
            chat_via_responses: true,
            chat_via_responses_models: Vec::new(),
            thinking_to_content: false,
            proxy: None,
        }],
        client_authentication: ClientAuthConfig {
            allowed_keys: vec![ClientKeyConfig::Mapped {
                key: "sk-client".to_string(),
                user_id: 3,
                token_id: 9,
            }],
        },
        features: FeaturesConfig::default(),
    }
}

fn build_state(base_url: &str, history: Arc<RecordingSink>) -> Arc<AppState> {
    let config = build_config(base_url);
    let mut services = SharedServices::from_config(&config);
    services.history = Some(history);
    Arc::new(AppState::new(config, services).unwrap())
}

fn chat_request(stream: bool, key: &str) -> Request<Body> {
    let body = json!({
        "model": "smart",
        "stream": stream,
        "stream_options": {"include_usage": true},
        "messages": [{"role": "user", "content": "hello"}],
    });
    Request::post("/v1/chat/completions")
        .header("authorization", format!("Bearer {key}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_state_routes_alias_and_authenticates() {
    let state = build_state("http://127.0.0.1:1", Arc::new(RecordingSink::default()));
    let seq = state.mint_request_ids().seq;
    let (target, channel) = state.route("smart", seq).unwrap();
    assert_eq!(target.upstream_model, "gpt-5");
    assert_eq!(channel.config.name, "primary");
    assert!(state.route("gpt-5", seq).is_err());

    let mut headers = http::HeaderMap::new();
    headers.insert("authorization", "Bearer sk-client".parse().unwrap());
    let identity = state.authenticate(IngressApi::OpenAiChat, &headers).unwrap();
    assert_eq!((identity.user_id, identity.token_id), (3, 9));
}

#[tokio::test]
async fn test_chat_via_responses_non_stream_end_to_end() {
    let base_url = spawn_upstream().await;
    let history = Arc::new(RecordingSink::default());
    let state = build_state(&base_url, Arc::clone(&history));

    let response = dispatch_request(state, Arc::from(""), chat_request(false, "sk-client"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let completion: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(completion["object"], "chat.completion");
    assert_eq!(completion["choices"][0]["message"]["content"], "Hi there");
    assert_eq!(completion["choices"][0]["finish_reason"], "stop");
    assert_eq!(completion["usage"]["total_tokens"], 6);

    for _ in 0..50 {
        if !history.saved.lock().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let saved = history.saved.lock();
    let (conversation_id, messages, user_id, token_id, channel) = &saved[0];
    assert!(conversation_id.starts_with("conv_"));
    assert_eq!(messages.first().map(|m| m.content.as_str()), Some("hello"));
    assert_eq!(messages.last().map(|m| m.role.as_str()), Some("assistant"));
    assert_eq!((*user_id, *token_id), (3, 9));
    assert_eq!(channel, "primary");
}

#[tokio::test]
async fn test_chat_via_responses_stream_end_to_end() {
    let base_url = spawn_upstream().await;
    let state = build_state(&base_url, Arc::new(RecordingSink::default()));

    let response = dispatch_request(state, Arc::from(""), chat_request(true, "sk-client"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/event-stream"
    );
    let text = body_text(response).await;
    assert!(text.contains("\"content\":\"Hi \""));
    assert!(text.contains("\"finish_reason\":\"stop\""));
    assert!(text.contains("\"total_tokens\":6"));
    assert!(text.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn test_invalid_key_is_rejected_in_ingress_envelope() {
    let state = build_state("http://127.0.0.1:1", Arc::new(RecordingSink::default()));
    let response = dispatch_request(state, Arc::from(""), chat_request(false, "wrong"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn test_unreachable_upstream_is_an_http_error() {
    let state = build_state("http://127.0.0.1:1", Arc::new(RecordingSink::default()));
    let response = dispatch_request(state, Arc::from(""), chat_request(true, "sk-client"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
