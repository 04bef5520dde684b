use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use modelgateway::store::ConfigStore;
use modelgateway::{AppState, Stores, app};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, header as mock_header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn state_with(doc: &str) -> AppState {
	AppState::new(Stores::new(ConfigStore::load(doc, None).unwrap()))
}

fn gateway(state: &AppState) -> Router {
	app(state.clone())
}

async fn post_json(router: Router, uri: &str, body: Value) -> (StatusCode, Value) {
	let resp = router
		.oneshot(
			Request::post(uri)
				.header(header::CONTENT_TYPE, "application/json")
				.body(Body::from(body.to_string()))
				.unwrap(),
		)
		.await
		.unwrap();
	let status = resp.status();
	let bytes = resp.into_body().collect().await.unwrap().to_bytes();
	let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
	(status, value)
}

async fn get(router: Router, uri: &str) -> (StatusCode, Value) {
	let resp = router
		.oneshot(Request::get(uri).body(Body::empty()).unwrap())
		.await
		.unwrap();
	let status = resp.status();
	let bytes = resp.into_body().collect().await.unwrap().to_bytes();
	let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
	(status, value)
}

fn chat_body() -> Value {
	json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hello there"}]})
}

fn completion_response(total: u64) -> Value {
	json!({
		"id": "chatcmpl-1",
		"object": "chat.completion",
		"model": "gpt-4o",
		"choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
		"usage": {"prompt_tokens": total / 2, "completion_tokens": total - total / 2, "total_tokens": total},
	})
}

#[tokio::test]
async fn simple_forward_hits_provider_and_counts() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.and(mock_header("authorization", "Bearer k1"))
		.and(body_partial_json(json!({"model": "gpt-4o"})))
		.respond_with(ResponseTemplate::new(200).set_body_json(completion_response(10)))
		.expect(1)
		.mount(&server)
		.await;

	let state = state_with(&format!(
		r#"
api_provider:
  p1:
    base_url: {}/v1
    api_key: k1
    limits:
      rpm: 10
model_config:
  gpt-4o:
    p1: {{}}
"#,
		server.uri()
	));

	let (status, body) = post_json(gateway(&state), "/v1/chat/completions", chat_body()).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body, completion_response(10));

	let doc = state.stores.config.snapshot();
	let st = state
		.stores
		.limiters
		.get("p1")
		.status(&doc.api_provider["p1"].limits);
	assert_eq!(st.rpm_used, 1);
	assert_eq!(st.tpm_used, 10);
	assert_eq!(state.stores.ledger.len(), 1);
}

#[tokio::test]
async fn alias_rewrites_upstream_model_only() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.and(body_partial_json(json!({"model": "gpt4o-mini"})))
		.respond_with(ResponseTemplate::new(200).set_body_json(completion_response(6)))
		.expect(1)
		.mount(&server)
		.await;

	let state = state_with(&format!(
		r#"
api_provider:
  p1:
    base_url: {}/v1
    api_key: k1
model_config:
  gpt-4o:
    p1:
      alias: gpt4o-mini
"#,
		server.uri()
	));

	let (status, body) = post_json(gateway(&state), "/v1/chat/completions", chat_body()).await;
	assert_eq!(status, StatusCode::OK);
	// The caller-visible response is the upstream body, untouched.
	assert_eq!(body["model"], "gpt-4o");
}

#[tokio::test]
async fn failover_rolls_back_failed_provider() {
	let bad = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(500).set_body_string("boom"))
		.expect(1)
		.mount(&bad)
		.await;
	let good = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(completion_response(8)))
		.expect(1)
		.mount(&good)
		.await;

	let state = state_with(&format!(
		r#"
api_provider:
  p1:
    base_url: {}/v1
    api_key: k1
  p2:
    base_url: {}/v1
    api_key: k2
model_config:
  gpt-4o:
    p1: {{}}
    p2: {{}}
"#,
		bad.uri(),
		good.uri()
	));

	let (status, _) = post_json(gateway(&state), "/v1/chat/completions", chat_body()).await;
	assert_eq!(status, StatusCode::OK);

	let limits = Default::default();
	assert_eq!(state.stores.limiters.get("p1").status(&limits).rpm_used, 0);
	assert_eq!(state.stores.limiters.get("p2").status(&limits).rpm_used, 1);

	// One failure record and one success record.
	let records = state.stores.ledger.recent(10);
	assert_eq!(records.len(), 2);
	assert_eq!(records[1].provider, "p1");
	assert!(records[1].error.as_deref().unwrap().contains("upstream_http_error"));
	assert_eq!(records[0].provider, "p2");
}

#[tokio::test]
async fn exhausted_quota_yields_503_without_reserve() {
	let state = state_with(
		r#"
api_provider:
  p1:
    base_url: https://unused.example.com/v1
    api_key: k1
    limits:
      rpm: 1
model_config:
  gpt-4o:
    p1: {}
"#,
	);
	// One request already in flight.
	let in_flight = state.stores.limiters.get("p1").reserve();

	let (status, body) = post_json(gateway(&state), "/v1/chat/completions", chat_body()).await;
	assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
	let reason = body["error"]["reasons"]["p1"].as_str().unwrap();
	assert!(reason.contains("rpm"), "{reason}");

	// The denied request took no reserve of its own.
	let st = state.stores.limiters.get("p1").status(&Default::default());
	assert_eq!(st.rpm_used, 1);
	drop(in_flight);
}

#[tokio::test]
async fn streaming_relays_chunks_and_commits_usage() {
	let sse = concat!(
		"data: {\"choices\":[{\"delta\":{\"content\":\"he\"}}]}\n\n",
		"data: {\"choices\":[{\"delta\":{\"content\":\"ll\"}}]}\n\n",
		"data: {\"choices\":[{\"delta\":{\"content\":\"o\"}}]}\n\n",
		"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":30,\"completion_tokens\":12,\"total_tokens\":42}}\n\n",
		"data: [DONE]\n\n",
	);
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.and(body_partial_json(json!({"stream": true})))
		.respond_with(ResponseTemplate::new(200).set_body_raw(sse.as_bytes(), "text/event-stream"))
		.expect(1)
		.mount(&server)
		.await;

	let state = state_with(&format!(
		r#"
api_provider:
  p1:
    base_url: {}/v1
    api_key: k1
    limits:
      tpm: 1000
model_config:
  gpt-4o:
    p1: {{}}
"#,
		server.uri()
	));

	let mut body = chat_body();
	body["stream"] = json!(true);
	let resp = gateway(&state)
		.oneshot(
			Request::post("/v1/chat/completions")
				.header(header::CONTENT_TYPE, "application/json")
				.body(Body::from(body.to_string()))
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(
		resp.headers()[header::CONTENT_TYPE],
		"text/event-stream"
	);
	let relayed = resp.into_body().collect().await.unwrap().to_bytes();
	// Byte-for-byte passthrough, including the terminator.
	assert_eq!(relayed.as_ref(), sse.as_bytes());

	let doc = state.stores.config.snapshot();
	let st = state
		.stores
		.limiters
		.get("p1")
		.status(&doc.api_provider["p1"].limits);
	assert_eq!(st.tpm_used, 42);

	let records = state.stores.ledger.recent(10);
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].total_tokens, 42);
	assert_eq!(records[0].prompt_tokens, Some(30));
	assert_eq!(records[0].completion_tokens, Some(12));
}

/// A one-shot upstream that starts a chunked SSE response, sends a single
/// event, then drops the connection without terminating the body.
async fn flaky_sse_upstream() -> std::net::SocketAddr {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		let (mut sock, _) = listener.accept().await.unwrap();
		// Read until the JSON request body has fully arrived.
		let mut received = Vec::new();
		let mut buf = [0u8; 8192];
		loop {
			let n = sock.read(&mut buf).await.unwrap();
			received.extend_from_slice(&buf[..n]);
			if n == 0 || received.ends_with(b"}") {
				break;
			}
		}
		let event = "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n";
		let resp = format!(
			"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
			event.len(),
			event
		);
		sock.write_all(resp.as_bytes()).await.unwrap();
		sock.flush().await.unwrap();
		// Drop without the terminating zero-length chunk.
	});
	addr
}

#[tokio::test]
async fn mid_stream_abort_surfaces_error_without_failover() {
	let addr = flaky_sse_upstream().await;
	let fallback = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(completion_response(5)))
		.expect(0)
		.mount(&fallback)
		.await;

	let state = state_with(&format!(
		r#"
api_provider:
  flaky:
    base_url: http://{}/v1
    api_key: k1
  fallback:
    base_url: {}/v1
    api_key: k2
model_config:
  gpt-4o:
    flaky: {{}}
    fallback: {{}}
"#,
		addr,
		fallback.uri()
	));

	let mut body = chat_body();
	body["stream"] = json!(true);
	let resp = gateway(&state)
		.oneshot(
			Request::post("/v1/chat/completions")
				.header(header::CONTENT_TYPE, "application/json")
				.body(Body::from(body.to_string()))
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	let relayed = resp.into_body().collect().await.unwrap().to_bytes();
	let text = String::from_utf8_lossy(&relayed);
	// The relayed chunk arrives, followed by a synthetic error event.
	assert!(text.contains("partial"), "{text}");
	assert!(text.contains("upstream_transport"), "{text}");

	let records = state.stores.ledger.recent(10);
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].provider, "flaky");
	assert!(records[0].error.as_deref().unwrap().contains("upstream_transport"));
}

#[tokio::test]
async fn all_candidates_failing_returns_502() {
	let bad = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
		.expect(1)
		.mount(&bad)
		.await;

	let state = state_with(&format!(
		r#"
api_provider:
  p1:
    base_url: {}/v1
    api_key: k1
model_config:
  gpt-4o:
    p1: {{}}
"#,
		bad.uri()
	));

	let (status, body) = post_json(gateway(&state), "/v1/chat/completions", chat_body()).await;
	assert_eq!(status, StatusCode::BAD_GATEWAY);
	assert_eq!(body["error"]["type"], "upstream_http_error");
}

#[tokio::test]
async fn models_lists_configured_models_plus_auto() {
	let state = state_with(
		r#"
api_provider:
  p1:
    base_url: https://unused.example.com/v1
    api_key: k1
model_config:
  gpt-4o:
    p1: {}
  claude:
    p1: {}
"#,
	);
	let (status, body) = get(gateway(&state), "/v1/models").await;
	assert_eq!(status, StatusCode::OK);
	let ids: Vec<&str> = body["data"]
		.as_array()
		.unwrap()
		.iter()
		.map(|m| m["id"].as_str().unwrap())
		.collect();
	assert_eq!(ids, vec!["gpt-4o", "claude", "auto"]);
}

#[tokio::test]
async fn auto_routes_to_first_enabled_binding() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.and(body_partial_json(json!({"model": "gpt-4o"})))
		.respond_with(ResponseTemplate::new(200).set_body_json(completion_response(4)))
		.expect(1)
		.mount(&server)
		.await;

	let state = state_with(&format!(
		r#"
api_provider:
  p1:
    base_url: {}/v1
    api_key: k1
model_config:
  gpt-4o:
    p1: {{}}
"#,
		server.uri()
	));

	let mut body = chat_body();
	body["model"] = json!("auto");
	let (status, _) = post_json(gateway(&state), "/v1/chat/completions", body).await;
	assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn admin_binding_edit_round_trips() {
	let state = state_with(
		r#"
api_provider:
  p1:
    base_url: https://unused.example.com/v1
    api_key: k1
model_config:
  gpt-4o:
    p1: {}
"#,
	);
	let (status, _) = post_json(
		gateway(&state),
		"/admin/config/binding",
		json!({"model": "gpt-4o", "provider": "p1", "field": "alias", "value": "gpt4o-mini"}),
	)
	.await;
	assert_eq!(status, StatusCode::OK);

	let (_, config) = get(gateway(&state), "/admin/config").await;
	assert_eq!(config["model_config"]["gpt-4o"]["p1"]["alias"], "gpt4o-mini");

	// Disabling the only binding makes the model unroutable.
	let (status, _) = post_json(
		gateway(&state),
		"/admin/config/binding",
		json!({"model": "gpt-4o", "provider": "p1", "field": "enable", "value": false}),
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	let (status, body) = post_json(gateway(&state), "/v1/chat/completions", chat_body()).await;
	assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
	assert_eq!(body["error"]["reasons"]["p1"], "binding disabled");
}

#[tokio::test]
async fn admin_reset_zeroes_counters() {
	let state = state_with(
		r#"
api_provider:
  p1:
    base_url: https://unused.example.com/v1
    api_key: k1
model_config: {}
"#,
	);
	let ticket = state.stores.limiters.get("p1").reserve();
	state.stores.limiters.get("p1").commit(ticket, 9);

	let (status, _) = post_json(gateway(&state), "/admin/limits/p1/reset", json!({})).await;
	assert_eq!(status, StatusCode::OK);
	let st = state.stores.limiters.get("p1").status(&Default::default());
	assert_eq!((st.rpm_used, st.tpm_used, st.rpd_used), (0, 0, 0));

	let (status, _) = post_json(gateway(&state), "/admin/limits/ghost/reset", json!({})).await;
	assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_config_replace_swaps_document_and_prunes_limiters() {
	let state = state_with(
		r#"
api_provider:
  old:
    base_url: https://old.example.com/v1
    api_key: k1
model_config:
  gpt-4o:
    old: {}
"#,
	);
	let _t = state.stores.limiters.get("old").reserve();

	let next = r#"
api_provider:
  new:
    base_url: https://new.example.com/v1
    api_key: k2
model_config:
  gpt-4o:
    new: {}
"#;
	let resp = gateway(&state)
		.oneshot(
			Request::post("/admin/config")
				.header(header::CONTENT_TYPE, "application/yaml")
				.body(Body::from(next))
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	assert!(state.stores.config.snapshot().api_provider.contains_key("new"));
	// The removed provider's counters are gone.
	assert!(!state.stores.limiters.names().contains(&"old".to_string()));

	// A document referencing an unknown provider is rejected wholesale.
	let (status, body) = post_json(
		gateway(&state),
		"/admin/config",
		json!({"api_provider": {}, "model_config": {"gpt-4o": {"ghost": {}}}}),
	)
	.await;
	assert_eq!(status, StatusCode::BAD_REQUEST);
	assert!(body["error"].as_str().unwrap().contains("ghost"));
	assert!(state.stores.config.snapshot().api_provider.contains_key("new"));
}

#[tokio::test]
async fn usage_endpoints_summarize_and_clear() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(completion_response(20)))
		.mount(&server)
		.await;

	let state = state_with(&format!(
		r#"
api_provider:
  p1:
    base_url: {}/v1
    api_key: k1
model_config:
  gpt-4o:
    p1: {{}}
"#,
		server.uri()
	));

	for _ in 0..2 {
		let (status, _) = post_json(gateway(&state), "/v1/chat/completions", chat_body()).await;
		assert_eq!(status, StatusCode::OK);
	}

	let (_, usage) = get(gateway(&state), "/api_usage").await;
	assert_eq!(usage["providers"]["p1"]["requests"], 2);
	assert_eq!(usage["providers"]["p1"]["total_tokens"], 40);

	let (_, recent) = get(gateway(&state), "/api_usage/recent?n=1").await;
	assert_eq!(recent["records"].as_array().unwrap().len(), 1);

	let (status, _) = post_json(gateway(&state), "/api_usage/clear", json!({})).await;
	assert_eq!(status, StatusCode::OK);
	let (_, usage) = get(gateway(&state), "/api_usage").await;
	assert!(usage["providers"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn health_probe_records_pass_and_fail() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.and(body_partial_json(json!({"max_tokens": 1})))
		.respond_with(ResponseTemplate::new(200).set_body_json(completion_response(2)))
		.mount(&server)
		.await;

	let state = state_with(&format!(
		r#"
api_provider:
  up:
    base_url: {}/v1
    api_key: k1
  down:
    base_url: http://127.0.0.1:9/v1
    api_key: k2
model_config:
  gpt-4o:
    up: {{}}
    down: {{}}
"#,
		server.uri()
	));

	let (status, matrix) = post_json(gateway(&state), "/admin/health", json!({})).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(matrix["gpt-4o"]["up"]["ok"], true);
	assert_eq!(matrix["gpt-4o"]["down"]["ok"], false);

	// The probe flows through normal accounting.
	assert_eq!(state.stores.limiters.get("up").status(&Default::default()).rpm_used, 1);
	let (_, read_back) = get(gateway(&state), "/admin/health").await;
	assert_eq!(read_back["gpt-4o"]["up"]["ok"], true);
}

#[tokio::test]
async fn admin_page_is_served() {
	let state = state_with("{}");
	let resp = gateway(&state)
		.oneshot(Request::get("/admin").body(Body::empty()).unwrap())
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	let bytes = resp.into_body().collect().await.unwrap().to_bytes();
	assert!(String::from_utf8_lossy(&bytes).contains("modelgateway"));
}
