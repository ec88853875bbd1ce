/// Fetch Tool Implementation
///
/// Performs a single HTTP request on behalf of the client and returns two
/// content blocks: a JSON text block with the response metadata, followed by
/// the body as text or, for `image/*` responses, as a base64 image block.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures_util::FutureExt;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode, Url, Version};
use serde::Serialize;
use serde_json::Value;

use crate::core::protocol::{Content, MCPTool};
use crate::core::server::{ToolHandler, ToolRegistry};

pub const TOOL_NAME: &str = "fetch";
pub const DEFAULT_TIMEOUT_SECONDS: f64 = 30.0;
pub const DEFAULT_METHOD: &str = "GET";
pub const DEFAULT_HEADERS: &str = "{}";

/// Failure at any step of a fetch. The display text is what the client sees.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("missing required argument: url")]
    MissingUrl,
    #[error("invalid timeout: {0}")]
    InvalidTimeout(f64),
    #[error("error parsing headers: {0}")]
    Headers(#[source] serde_json::Error),
    #[error("error creating request: {0}")]
    Request(String),
    #[error("error fetching URL: {0}")]
    Fetch(#[source] reqwest::Error),
    #[error("error encoding response metadata: {0}")]
    Metadata(#[source] serde_json::Error),
    #[error("error reading response body: {0}")]
    Body(#[source] reqwest::Error),
    #[error("response body is not valid utf-8")]
    InvalidUtf8,
}

/// Validated arguments of a `fetch` call.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchArgs {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl FetchArgs {
    /// Extract arguments from the raw `tools/call` arguments object.
    ///
    /// Optional arguments of the wrong JSON type fall back to their defaults,
    /// as does an empty method.
    pub fn from_value(args: &Value) -> Result<Self, FetchError> {
        let url = args
            .get("url")
            .and_then(Value::as_str)
            .ok_or(FetchError::MissingUrl)?
            .to_string();

        let timeout_secs = args
            .get("timeout")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        let timeout = Duration::try_from_secs_f64(timeout_secs)
            .map_err(|_| FetchError::InvalidTimeout(timeout_secs))?;

        let method = args
            .get("method")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_METHOD)
            .to_string();

        let raw_headers = args
            .get("headers")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_HEADERS);
        // "null" decodes to no headers
        let headers: BTreeMap<String, String> =
            serde_json::from_str::<Option<BTreeMap<String, String>>>(raw_headers)
                .map_err(FetchError::Headers)?
                .unwrap_or_default();

        Ok(Self {
            url,
            method,
            headers,
            timeout,
        })
    }
}

/// Response metadata reported in the first content block.
///
/// Field order is the serialized key order.
#[derive(Debug, Serialize, PartialEq)]
pub struct ResponseMeta {
    pub code: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    pub http_version: String,
    pub status: String,
}

impl ResponseMeta {
    pub fn new(status: StatusCode, version: Version, headers: &HeaderMap) -> Self {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            grouped
                .entry(canonical_header_name(name.as_str()))
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        Self {
            code: status.as_u16(),
            headers: grouped,
            http_version: version_text(version),
            status: status_text(status),
        }
    }
}

/// Canonical MIME header form: first letter and every letter after a hyphen
/// upper-cased, the rest lower-cased (`content-type` -> `Content-Type`).
pub fn canonical_header_name(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

fn status_text(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

fn version_text(version: Version) -> String {
    match version {
        Version::HTTP_09 => "HTTP/0.9".to_string(),
        Version::HTTP_10 => "HTTP/1.0".to_string(),
        Version::HTTP_11 => "HTTP/1.1".to_string(),
        Version::HTTP_2 => "HTTP/2.0".to_string(),
        Version::HTTP_3 => "HTTP/3.0".to_string(),
        other => format!("{:?}", other),
    }
}

/// Turn a response body into its content block.
///
/// `image/*` bodies are base64 encoded; anything else must be UTF-8 text.
pub fn body_content(content_type: Option<&str>, body: Bytes) -> Result<Content, FetchError> {
    match content_type {
        Some(mime) if mime.starts_with("image/") => Ok(Content::image(STANDARD.encode(&body), mime)),
        _ => {
            let text = String::from_utf8(body.to_vec()).map_err(|_| FetchError::InvalidUtf8)?;
            Ok(Content::text(text))
        }
    }
}

fn build_request(client: &Client, args: &FetchArgs) -> Result<reqwest::Request, FetchError> {
    let method = Method::from_bytes(args.method.as_bytes())
        .map_err(|e| FetchError::Request(format!("invalid method {:?}: {}", args.method, e)))?;
    let url = Url::parse(&args.url)
        .map_err(|e| FetchError::Request(format!("invalid URL {:?}: {}", args.url, e)))?;

    let mut headers = HeaderMap::with_capacity(args.headers.len());
    for (name, value) in &args.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| FetchError::Request(format!("invalid header name {:?}: {}", name, e)))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| FetchError::Request(format!("invalid value for header {:?}: {}", name, e)))?;
        headers.append(header_name, header_value);
    }

    client
        .request(method, url)
        .headers(headers)
        .timeout(args.timeout)
        .build()
        .map_err(|e| FetchError::Request(e.to_string()))
}

/// Perform the request described by `args` and shape the result.
///
/// Non-2xx statuses are not errors; they are reported through the metadata
/// block.
pub async fn fetch(client: &Client, args: &FetchArgs) -> Result<Vec<Content>, FetchError> {
    let request = build_request(client, args)?;

    tracing::debug!(method = %args.method, url = %args.url, timeout = ?args.timeout, "fetching URL");
    let response = client.execute(request).await.map_err(FetchError::Fetch)?;

    let meta = ResponseMeta::new(response.status(), response.version(), response.headers());
    let meta_json = serde_json::to_string(&meta).map_err(FetchError::Metadata)?;

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
    let body = response.bytes().await.map_err(FetchError::Body)?;

    tracing::info!(
        url = %args.url,
        code = meta.code,
        bytes = body.len(),
        "fetched URL"
    );

    let body_block = body_content(content_type.as_deref(), body)?;
    Ok(vec![Content::text(meta_json), body_block])
}

/// JSON Schema advertised for the tool arguments.
pub fn input_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "url": {
                "type": "string",
                "description": "The URL to fetch"
            },
            "headers": {
                "type": "string",
                "description": "JSON encoded object of headers to send",
                "default": DEFAULT_HEADERS
            },
            "method": {
                "type": "string",
                "description": "The HTTP method to use",
                "default": DEFAULT_METHOD
            },
            "timeout": {
                "type": "number",
                "description": "The timeout in seconds",
                "default": DEFAULT_TIMEOUT_SECONDS
            }
        },
        "required": ["url"]
    })
}

/// Register the fetch tool backed by a default HTTP client.
pub fn register(registry: &mut ToolRegistry) {
    register_with_client(registry, Client::new());
}

/// Register the fetch tool backed by the given client.
pub fn register_with_client(registry: &mut ToolRegistry, client: Client) {
    let tool = MCPTool {
        name: TOOL_NAME.to_string(),
        description: "Fetches the content of a URL".to_string(),
        input_schema: input_schema(),
    };

    let handler: ToolHandler = Box::new(move |args: Value| {
        let client = client.clone();
        async move {
            let args = FetchArgs::from_value(&args).map_err(|e| e.to_string())?;
            fetch(&client, &args).await.map_err(|e| {
                tracing::warn!(url = %args.url, error = %e, "fetch failed");
                e.to_string()
            })
        }
        .boxed()
    });

    registry.register(tool, handler);
}
