/// MCP Server Implementation
///
/// This module contains the core MCP server implementation including:
/// - Tool registry for managing available tools
/// - A transport-independent request dispatcher
/// - HTTP server setup with Actix Web
/// - STDIO server implementation for line-based communication

use actix_web::{
    web, App, HttpServer, HttpResponse, Result,
    middleware::{Compress, Logger, DefaultHeaders},
};
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::config::ServerConfig;
use crate::core::protocol::{
    Content, INTERNAL_ERROR, MCPRequest, MCPResponse, MCPTool, METHOD_NOT_FOUND, PROTOCOL_VERSION,
};
use crate::tools;

/// Tool handler function type definition.
///
/// Tool handlers are boxed closures that take JSON arguments and return a
/// future resolving to either content blocks or an error string. The handler
/// and its future must be Send so they can run on any worker thread.
pub type ToolHandler =
    Box<dyn Fn(Value) -> BoxFuture<'static, Result<Vec<Content>, String>> + Send + Sync>;

/// Registry of available MCP tools.
///
/// The registry maintains a list of tool definitions for discovery and a
/// HashMap of tool names to their handler functions for execution.
pub struct ToolRegistry {
    /// List of all registered tools (for tools/list method)
    pub tools: Vec<MCPTool>,
    /// Map of tool names to their handler functions (for tools/call method)
    pub handlers: HashMap<String, ToolHandler>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    /// Register a tool with the registry.
    ///
    /// A later registration under the same name replaces the earlier one.
    pub fn register(&mut self, tool: MCPTool, handler: ToolHandler) {
        let name = tool.name.clone();
        self.tools.retain(|t| t.name != name);
        self.tools.push(tool);
        self.handlers.insert(name, handler);
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize and register all tools.
pub fn initialize_tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    tools::fetch::register(&mut registry);
    registry
}

/// Transport-independent MCP request dispatcher.
///
/// Both the STDIO loop and the HTTP handler hand parsed requests to
/// [`McpServer::handle`]; the returned response (if any) is what goes back
/// on the wire.
pub struct McpServer {
    /// Server name as reported in MCP initialize responses
    pub server_name: String,
    /// Server version string as reported in MCP initialize responses
    pub server_version: String,
    registry: ToolRegistry,
}

impl McpServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>, registry: ToolRegistry) -> Self {
        Self {
            server_name: name.into(),
            server_version: version.into(),
            registry,
        }
    }

    pub fn tools(&self) -> &[MCPTool] {
        &self.registry.tools
    }

    /// Handle one request. Notifications yield `None`.
    pub async fn handle(&self, req: MCPRequest) -> Option<MCPResponse> {
        if req.is_notification() {
            tracing::debug!(method = %req.method, "notification received");
            return None;
        }

        let response = match req.method.as_str() {
            "initialize" => self.handle_initialize(req.id),
            "ping" => MCPResponse::success(req.id, json!({})),
            "tools/list" => self.handle_tools_list(req.id),
            "tools/call" => self.handle_tools_call(req.id, req.params).await,
            other => {
                tracing::debug!(method = other, "method not found");
                MCPResponse::method_not_found(req.id, other)
            }
        };
        Some(response)
    }

    /// Handle MCP initialize method.
    ///
    /// Returns the protocol version, server capabilities, and server
    /// information.
    fn handle_initialize(&self, id: Option<Value>) -> MCPResponse {
        MCPResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {}
                },
                "serverInfo": {
                    "name": self.server_name,
                    "version": self.server_version
                }
            }),
        )
    }

    fn handle_tools_list(&self, id: Option<Value>) -> MCPResponse {
        MCPResponse::success(id, json!({ "tools": self.registry.tools }))
    }

    /// Handle MCP tools/call method.
    ///
    /// The tool name and arguments are extracted from the params, the tool
    /// handler is looked up in the registry and awaited. A handler error is
    /// returned as a JSON-RPC internal error carrying the error text.
    async fn handle_tools_call(&self, id: Option<Value>, params: Option<Value>) -> MCPResponse {
        let Some(tool_params) = params else {
            return MCPResponse::invalid_params(id);
        };

        let tool_name = tool_params
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        // Arguments default to an empty object
        let arguments = tool_params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let Some(handler) = self.registry.handlers.get(tool_name) else {
            return MCPResponse::error(id, METHOD_NOT_FOUND, format!("Unknown tool: {}", tool_name));
        };

        match handler(arguments).await {
            Ok(content) => MCPResponse::success(
                id,
                json!({
                    "content": content,
                    "isError": false
                }),
            ),
            Err(e) => {
                tracing::warn!(tool = tool_name, error = %e, "tool call failed");
                MCPResponse::error(id, INTERNAL_ERROR, e)
            }
        }
    }
}

/// Health check endpoint handler.
async fn health() -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": "fetch-mcp-server"
    })))
}

/// MCP JSON-RPC request handler with metrics tracking.
///
/// Increments the request counter, dispatches the request and returns the
/// JSON-RPC response. Notifications are acknowledged with 202 and no body.
async fn mcp_handler(
    server: web::Data<McpServer>,
    counter: web::Data<AtomicU64>,
    req: web::Json<MCPRequest>,
) -> Result<HttpResponse> {
    // Only atomicity is needed, not ordering with other operations
    counter.fetch_add(1, Ordering::Relaxed);

    match server.handle(req.into_inner()).await {
        Some(response) => Ok(HttpResponse::Ok().json(response)),
        None => Ok(HttpResponse::Accepted().finish()),
    }
}

/// Metrics endpoint handler.
///
/// Returns the total number of JSON-RPC requests processed since start.
async fn metrics_handler(counter: web::Data<AtomicU64>) -> Result<HttpResponse> {
    let count = counter.load(Ordering::Relaxed);
    Ok(HttpResponse::Ok().json(json!({
        "requests_total": count,
        "status": "ok"
    })))
}

/// Server-Sent Events endpoint for tools discovery.
///
/// Emits a single SSE event carrying the registered tools and their count.
async fn sse_tools_discovery(server: web::Data<McpServer>) -> Result<HttpResponse> {
    use actix_web::http::header;

    let tools_data = json!({
        "tools": server.tools(),
        "count": server.tools().len()
    });

    // Format as SSE event: "data: {json}\n\n"
    let sse_data = format!("data: {}\n\n", tools_data);

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(header::CacheControl(vec![
            header::CacheDirective::NoCache,
            header::CacheDirective::NoStore,
            header::CacheDirective::MustRevalidate,
        ]))
        // Disable nginx buffering
        .insert_header(("x-accel-buffering", "no"))
        .body(sse_data))
}

/// Route table shared by the HTTP server and its tests.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics_handler))
        .route("/sse", web::get().to(sse_tools_discovery))
        .route("/mcp", web::post().to(mcp_handler))
        .route("/", web::post().to(mcp_handler))
        .route("/", web::get().to(health));
}

/// Run the MCP server in HTTP mode.
///
/// # Configuration
/// The server is configured with:
/// - Worker threads: from config (CPU count, max 16, by default)
/// - Max connections: 10,000 concurrent connections
/// - Connection rate limit: 1,000 connections per second
/// - Keep-alive: 30 seconds
/// - Request timeout: 30 seconds
/// - Disconnect timeout: 2 seconds
/// - Shutdown timeout: 10 seconds
pub async fn run_server_http(config: &ServerConfig, server: Arc<McpServer>) -> std::io::Result<()> {
    use std::time::Duration;

    let bind_addr = config.bind_addr();
    let server = web::Data::from(server);
    let request_count = web::Data::new(AtomicU64::new(0));

    tracing::info!(
        name = %config.name,
        version = %config.version,
        bind = %bind_addr,
        workers = config.workers,
        "MCP server starting (HTTP mode)"
    );

    HttpServer::new(move || {
        App::new()
            .app_data(server.clone())
            .app_data(request_count.clone())
            .wrap(Compress::default())
            // Security headers on all responses
            .wrap(
                DefaultHeaders::new()
                    .add(("X-Content-Type-Options", "nosniff"))
                    .add(("X-Frame-Options", "DENY"))
                    .add(("X-XSS-Protection", "1; mode=block"))
            )
            // %r = request line, %s = status, %Dms = duration in milliseconds
            .wrap(Logger::new("%r %s %Dms"))
            .configure(configure_routes)
    })
    .workers(config.workers)
    .max_connections(10000)
    .max_connection_rate(1000)
    .keep_alive(Duration::from_secs(30))
    .client_request_timeout(Duration::from_secs(30))
    .client_disconnect_timeout(Duration::from_secs(2))
    .shutdown_timeout(10)
    .bind(&bind_addr)?
    .run()
    .await
}

/// Run the MCP server in STDIO mode over the process stdin/stdout.
pub async fn run_server_stdio(server: Arc<McpServer>) -> std::io::Result<()> {
    tracing::info!(
        name = %server.server_name,
        version = %server.server_version,
        "MCP server starting (STDIO mode)"
    );
    serve_lines(&server, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve newline-delimited JSON-RPC from `input`, writing responses to
/// `output`.
///
/// Requests are processed one at a time. Each response is a single line and
/// is flushed immediately. Lines that fail to parse (including lines that are
/// not UTF-8) are logged; if they are JSON objects carrying an `id`, a parse
/// error response is written for them.
pub async fn serve_lines<R, W>(server: &McpServer, input: R, output: W) -> std::io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

    let mut input = BufReader::with_capacity(8192, input);
    let mut output = BufWriter::with_capacity(8192, output);
    let mut buf = Vec::with_capacity(8192);

    loop {
        buf.clear();
        if input.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }

        // A line that is not UTF-8 is dropped, the session keeps going
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim_end_matches(['\n', '\r']),
            Err(e) => {
                tracing::warn!(error = %e, "skipping line that is not valid UTF-8");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<MCPRequest>(line) {
            Ok(req) => match server.handle(req).await {
                Some(response) => response,
                None => continue,
            },
            Err(e) => {
                tracing::warn!(error = %e, "parse error");
                let id = serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|partial| partial.get("id").cloned());
                match id {
                    Some(id) => MCPResponse::parse_error(Some(id), e),
                    None => continue,
                }
            }
        };

        let response_json = match serde_json::to_string(&response) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "error serializing response");
                continue;
            }
        };

        output.write_all(response_json.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn echo_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        let tool = MCPTool {
            name: "echo".to_string(),
            description: "Echo a message".to_string(),
            input_schema: json!({ "type": "object" }),
        };
        let handler: ToolHandler = Box::new(|args: Value| {
            async move {
                match args.get("message").and_then(|m| m.as_str()) {
                    Some(m) => Ok(vec![Content::text(m)]),
                    None => Err("Missing required parameter: message".to_string()),
                }
            }
            .boxed()
        });
        registry.register(tool, handler);
        registry
    }

    fn request(id: Option<Value>, method: &str, params: Option<Value>) -> MCPRequest {
        MCPRequest {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn initialize_reports_server_info() {
        let server = McpServer::new("Fetch", "1.0.0", ToolRegistry::new());
        let resp = server
            .handle(request(Some(json!(1)), "initialize", None))
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], "Fetch");
        assert_eq!(result["serverInfo"]["version"], "1.0.0");
        assert!(result["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let server = McpServer::new("Fetch", "1.0.0", echo_registry());
        assert!(server
            .handle(request(None, "notifications/initialized", None))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn tools_call_wraps_content() {
        let server = McpServer::new("Fetch", "1.0.0", echo_registry());
        let resp = server
            .handle(request(
                Some(json!("a")),
                "tools/call",
                Some(json!({ "name": "echo", "arguments": { "message": "hi" } })),
            ))
            .await
            .unwrap();
        assert_eq!(
            resp.result.unwrap(),
            json!({ "content": [{ "type": "text", "text": "hi" }], "isError": false })
        );
    }

    #[tokio::test]
    async fn tool_errors_become_internal_errors() {
        let server = McpServer::new("Fetch", "1.0.0", echo_registry());
        let resp = server
            .handle(request(
                Some(json!(2)),
                "tools/call",
                Some(json!({ "name": "echo" })),
            ))
            .await
            .unwrap();
        assert!(resp.result.is_none());
        let error = resp.error.unwrap();
        assert_eq!(error.code, INTERNAL_ERROR);
        assert_eq!(error.message, "Missing required parameter: message");
    }

    #[tokio::test]
    async fn unknown_tool_and_method() {
        let server = McpServer::new("Fetch", "1.0.0", echo_registry());
        let resp = server
            .handle(request(Some(json!(3)), "tools/call", Some(json!({ "name": "nope" }))))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().message, "Unknown tool: nope");

        let resp = server
            .handle(request(Some(json!(4)), "resources/list", None))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, -32601);

        let resp = server
            .handle(request(Some(json!(5)), "tools/call", None))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, -32602);
    }

    #[test]
    fn re_registering_replaces_tool() {
        let mut registry = echo_registry();
        let tool = MCPTool {
            name: "echo".to_string(),
            description: "second".to_string(),
            input_schema: json!({ "type": "object" }),
        };
        let handler: ToolHandler =
            Box::new(|_: Value| async { Ok::<Vec<Content>, String>(Vec::new()) }.boxed());
        registry.register(tool, handler);
        assert_eq!(registry.tools.len(), 1);
        assert_eq!(registry.tools[0].description, "second");
    }
}
