//! Integration tests for the HTTP transport routes.

use std::sync::atomic::AtomicU64;

use actix_web::http::StatusCode;
use actix_web::{App, test, web};
use fetch_mcp_server::core::server::{McpServer, configure_routes, initialize_tools};
use serde_json::{Value, json};

macro_rules! app {
    () => {
        test::init_service(
            App::new()
                .app_data(web::Data::new(McpServer::new("Fetch", "1.0.0", initialize_tools())))
                .app_data(web::Data::new(AtomicU64::new(0)))
                .configure(configure_routes),
        )
        .await
    };
}

#[actix_rt::test]
async fn health_endpoint_reports_ok() {
    let app = app!();
    for uri in ["/health", "/"] {
        let req = test::TestRequest::get().uri(uri).to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "ok");
    }
}

#[actix_rt::test]
async fn initialize_over_http() {
    let app = app!();
    let req = test::TestRequest::post()
        .uri("/mcp")
        .set_json(json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["serverInfo"]["name"], "Fetch");
    assert_eq!(body["result"]["protocolVersion"], "2024-11-05");
}

#[actix_rt::test]
async fn root_post_lists_tools() {
    let app = app!();
    let req = test::TestRequest::post()
        .uri("/")
        .set_json(json!({ "jsonrpc": "2.0", "id": "x", "method": "tools/list" }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["result"]["tools"][0]["name"], "fetch");
}

#[actix_rt::test]
async fn notifications_are_accepted_without_body() {
    let app = app!();
    let req = test::TestRequest::post()
        .uri("/mcp")
        .set_json(json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
}

#[actix_rt::test]
async fn metrics_count_rpc_requests() {
    let app = app!();
    for id in 0..2 {
        let req = test::TestRequest::post()
            .uri("/mcp")
            .set_json(json!({ "jsonrpc": "2.0", "id": id, "method": "ping" }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["result"], json!({}));
    }

    let req = test::TestRequest::get().uri("/metrics").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["requests_total"], 2);
}

#[actix_rt::test]
async fn sse_emits_tool_discovery_event() {
    let app = app!();
    let req = test::TestRequest::get().uri("/sse").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let body = test::read_body(resp).await;
    let text = std::str::from_utf8(&body).unwrap();
    assert!(text.starts_with("data: "));
    assert!(text.ends_with("\n\n"));

    let event: Value = serde_json::from_str(text["data: ".len()..].trim()).unwrap();
    assert_eq!(event["count"], 1);
    assert_eq!(event["tools"][0]["name"], "fetch");
}
