//! HTTP-Kollaborateure: Token-Endpoint und SDP-Negotiation
//!
//! - `POST <token_endpoint>` liefert ein ephemeres Token
//!   (`client_secret.value` oder `token`)
//! - `POST <base_url>?model=<model>` mit `application/sdp` liefert das Answer-SDP

use super::manager::ConnectionError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

// ============================================================================
// TOKEN
// ============================================================================

/// Kurzlebiges Token für genau eine Negotiation
#[derive(Clone, PartialEq, Eq)]
pub struct EphemeralToken {
    value: String,
    pub expires_at: Option<i64>,
}

impl EphemeralToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
        }
    }

    pub fn secret(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Debug for EphemeralToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralToken")
            .field("value", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Liefert ephemere Tokens
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<EphemeralToken, ConnectionError>;
}

/// Tauscht das lokale Offer gegen das Remote-Answer
#[async_trait]
pub trait SdpNegotiator: Send + Sync {
    async fn negotiate(
        &self,
        offer_sdp: &str,
        token: &EphemeralToken,
    ) -> Result<String, ConnectionError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    client_secret: Option<ClientSecret>,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientSecret {
    value: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

impl TokenResponse {
    fn into_token(self) -> Option<EphemeralToken> {
        match (self.client_secret, self.token) {
            (Some(secret), _) if !secret.value.is_empty() => Some(EphemeralToken {
                value: secret.value,
                expires_at: secret.expires_at,
            }),
            (_, Some(token)) if !token.is_empty() => Some(EphemeralToken::new(token)),
            _ => None,
        }
    }
}

// ============================================================================
// HTTP TOKEN PROVIDER
// ============================================================================

/// Holt Tokens per POST vom konfigurierten Endpoint
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTokenProvider {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ConnectionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectionError::TokenFetch(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(endpoint, client))
    }

    pub fn with_client(endpoint: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            endpoint: endpoint.into(),
            client,
        }
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn fetch_token(&self) -> Result<EphemeralToken, ConnectionError> {
        tracing::debug!("Requesting ephemeral token from {}", self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body("{}")
            .send()
            .await
            .map_err(|e| ConnectionError::TokenFetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectionError::TokenFetch(format!(
                "status {}: {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| ConnectionError::TokenFetch(format!("Invalid token response: {}", e)))?;

        parsed.into_token().ok_or_else(|| {
            ConnectionError::TokenFetch("Token response contains no credential".to_string())
        })
    }
}

// ============================================================================
// HTTP NEGOTIATOR
// ============================================================================

/// SDP-Austausch mit dem Realtime-Endpoint des Providers
#[derive(Debug, Clone)]
pub struct HttpNegotiator {
    url: url::Url,
    client: reqwest::Client,
}

impl HttpNegotiator {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, ConnectionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectionError::NegotiationRequest(e.to_string()))?;
        Self::with_client(base_url, model, client)
    }

    pub fn with_client(
        base_url: &str,
        model: &str,
        client: reqwest::Client,
    ) -> Result<Self, ConnectionError> {
        let mut url = url::Url::parse(base_url)
            .map_err(|e| ConnectionError::NegotiationRequest(format!("Invalid URL: {}", e)))?;
        url.query_pairs_mut().append_pair("model", model);
        Ok(Self { url, client })
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }
}

#[async_trait]
impl SdpNegotiator for HttpNegotiator {
    async fn negotiate(
        &self,
        offer_sdp: &str,
        token: &EphemeralToken,
    ) -> Result<String, ConnectionError> {
        tracing::debug!("Posting SDP offer to {}", self.url);

        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(token.secret())
            .header("OpenAI-Beta", "realtime=v1")
            .header(reqwest::header::CONTENT_TYPE, "application/sdp")
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(|e| ConnectionError::NegotiationRequest(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectionError::Negotiation {
                status: status.as_u16(),
                body,
            });
        }

        response
            .text()
            .await
            .map_err(|e| ConnectionError::NegotiationRequest(e.to_string()))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Beantwortet genau einen Request und liefert den Roh-Request zurück
    async fn serve_once(status: u16, content_type: &str, body: &str) -> (String, JoinHandle<String>) {
        let response = format!(
            "HTTP/1.1 {} X\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            content_type,
            body.len(),
            body
        );
        serve_raw(response).await
    }

    /// Schickt eine beliebige Roh-Antwort und schließt danach den Socket
    async fn serve_raw(response: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            request
        });

        (format!("http://{}", addr), handle)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);

            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..pos]).to_string();
                let content_length = head
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= pos + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[tokio::test]
    async fn test_token_from_client_secret() {
        let (url, server) = serve_once(
            200,
            "application/json",
            r#"{"client_secret":{"value":"ek_123","expires_at":1700000000}}"#,
        )
        .await;

        let provider = HttpTokenProvider::with_client(format!("{}/token", url), client());
        let token = provider.fetch_token().await.unwrap();

        assert_eq!(token.secret(), "ek_123");
        assert_eq!(token.expires_at, Some(1700000000));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /token"));
    }

    #[tokio::test]
    async fn test_token_from_plain_field() {
        let (url, _server) = serve_once(200, "application/json", r#"{"token":"tok_9"}"#).await;

        let provider = HttpTokenProvider::with_client(url, client());
        assert_eq!(provider.fetch_token().await.unwrap().secret(), "tok_9");
    }

    #[tokio::test]
    async fn test_token_unauthorized() {
        let (url, _server) = serve_once(401, "text/plain", "Unauthorized").await;

        let provider = HttpTokenProvider::with_client(url, client());
        let err = provider.fetch_token().await.unwrap_err();

        assert!(matches!(err, ConnectionError::TokenFetch(ref m) if m.contains("401")));
    }

    #[tokio::test]
    async fn test_token_without_credential() {
        let (url, _server) = serve_once(200, "application/json", r#"{"other":1}"#).await;

        let provider = HttpTokenProvider::with_client(url, client());
        assert!(matches!(
            provider.fetch_token().await,
            Err(ConnectionError::TokenFetch(_))
        ));
    }

    #[tokio::test]
    async fn test_negotiation_sends_sdp_with_auth() {
        let (url, server) = serve_once(200, "application/sdp", "v=0\r\nanswer").await;

        let negotiator =
            HttpNegotiator::with_client(&format!("{}/v1/realtime", url), "test-model", client())
                .unwrap();
        let answer = negotiator
            .negotiate("v=0\r\noffer", &EphemeralToken::new("ek_test"))
            .await
            .unwrap();

        assert_eq!(answer, "v=0\r\nanswer");

        let request = server.await.unwrap();
        let lower = request.to_lowercase();
        assert!(request.starts_with("POST /v1/realtime?model=test-model"));
        assert!(lower.contains("authorization: bearer ek_test"));
        assert!(lower.contains("openai-beta: realtime=v1"));
        assert!(lower.contains("content-type: application/sdp"));
        assert!(request.ends_with("v=0\r\noffer"));
    }

    #[tokio::test]
    async fn test_negotiation_error_carries_status_and_body() {
        let (url, _server) = serve_once(400, "text/plain", "Bad request").await;

        let negotiator = HttpNegotiator::with_client(&url, "m", client()).unwrap();
        let err = negotiator
            .negotiate("v=0", &EphemeralToken::new("ek"))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ConnectionError::Negotiation {
                status: 400,
                body: "Bad request".to_string()
            }
        );
        let message = err.to_string();
        assert!(message.contains("400"));
        assert!(message.contains("Bad request"));
    }

    #[tokio::test]
    async fn test_negotiation_error_keeps_status_when_body_is_cut_off() {
        let response =
            "HTTP/1.1 502 X\r\nContent-Length: 100\r\nConnection: close\r\n\r\npartial"
                .to_string();
        let (url, _server) = serve_raw(response).await;

        let negotiator = HttpNegotiator::with_client(&url, "m", client()).unwrap();
        let err = negotiator
            .negotiate("v=0", &EphemeralToken::new("ek"))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ConnectionError::Negotiation {
                status: 502,
                body: String::new()
            }
        );
    }

    #[test]
    fn test_token_debug_hides_secret() {
        let token = EphemeralToken::new("ek_secret");
        assert!(!format!("{:?}", token).contains("ek_secret"));
    }
}
