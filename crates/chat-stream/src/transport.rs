use std::pin::Pin;

use futures::StreamExt as _;
use tracing::debug;

use crate::config::GatewayConfig;
use crate::errors::{ConfigError, TransportError, error_message_from_body};
use crate::request::StreamRequest;

/// Response body chunks in arrival order.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, TransportError>> + Send + 'static>>;

/// What the gateway answered with once the request succeeded.
pub enum ResponseBody {
    /// An incremental event stream.
    Stream(ByteStream),
    /// A complete JSON document (error body or non-streamed completion).
    Json(serde_json::Value),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("ResponseBody::Stream(..)"),
            Self::Json(value) => f.debug_tuple("ResponseBody::Json").field(value).finish(),
        }
    }
}

/// Opens a chat-completion response for a request.
///
/// Dropping the returned body (or the pending `open` future) must abort the
/// underlying request.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: &StreamRequest) -> Result<ResponseBody, TransportError>;
}

/// `reqwest`-backed transport posting to the configured gateway endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpTransport {
    /// Creates a transport after validating `config`.
    pub fn new(config: GatewayConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .cookie_store(config.with_credentials);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates a transport from [`GatewayConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(GatewayConfig::from_env()?)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: &StreamRequest) -> Result<ResponseBody, TransportError> {
        let url = self.config.chat_url();
        debug!(%url, model = %request.model, messages = request.messages.len(), "opening chat stream");

        let mut http_req = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request);
        if let Some(key) = &self.config.api_key {
            http_req = http_req.bearer_auth(key);
        }
        for (name, value) in &self.config.headers {
            http_req = http_req.header(name.as_str(), value.as_str());
        }

        let response = http_req
            .send()
            .await
            .map_err(|e| TransportError::request(format!("could not reach gateway: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::status(
                status.as_u16(),
                error_message_from_body(&body),
            ));
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));
        if is_json {
            let value = response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| TransportError::body(format!("invalid JSON response: {e}")))?;
            return Ok(ResponseBody::Json(value));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::read(e.to_string())));
        Ok(ResponseBody::Stream(Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ChatMessage;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> StreamRequest {
        StreamRequest::new("gpt-4o-mini").message(ChatMessage::user("hi"))
    }

    async fn collect(body: ResponseBody) -> String {
        let ResponseBody::Stream(mut stream) = body else {
            panic!("expected stream body");
        };
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.expect("chunk"));
        }
        String::from_utf8(out).expect("utf8")
    }

    #[tokio::test]
    async fn posts_request_and_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pg/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(header("new-api-user", "7"))
            .and(body_partial_json(serde_json::json!({"model":"gpt-4o-mini","stream":true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("data: [DONE]\n\n", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::new(
            GatewayConfig::new(server.uri())
                .api_key("sk-test")
                .header("New-Api-User", "7"),
        )
        .expect("transport");
        let body = transport.open(&request()).await.expect("open");
        assert_eq!(collect(body).await, "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn non_success_status_extracts_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(
                serde_json::json!({"error":{"message":"rate limited","type":"new_api_error"}}),
            ))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(GatewayConfig::new(server.uri())).expect("transport");
        let err = transport.open(&request()).await.expect_err("should fail");
        assert_eq!(err, TransportError::status(429, "rate limited"));
    }

    #[tokio::test]
    async fn json_response_is_returned_whole() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"error":{"message":"model not found"}})),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::new(GatewayConfig::new(server.uri())).expect("transport");
        let body = transport.open(&request()).await.expect("open");
        assert!(matches!(body, ResponseBody::Json(v) if v["error"]["message"] == "model not found"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(HttpTransport::new(GatewayConfig::new("not-a-url")).is_err());
    }
}
