//! HTTP core for the Graph API.
//!
//! One shared `reqwest` client, auth header injection, and the error
//! classification every caller relies on. Retry discipline here is
//! deliberately small: a 401 gets one token refresh and one retry, a
//! 5xx gets one inline retry. Anything larger (chunk backoff) belongs
//! to the upload machinery.

use reqwest::Method;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::{ConflictKind, Error, Result};
use crate::graph::auth::Auth;

/// API endpoint of Microsoft Graph.
pub const GRAPH_URL: &str = "https://graph.microsoft.com/v1.0";

/// Wire shape of Graph's error messages.
#[derive(Debug, Deserialize, Default)]
struct GraphError {
    #[serde(default)]
    error: GraphErrorBody,
}

#[derive(Debug, Deserialize, Default)]
struct GraphErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Authenticated client for the Graph REST API.
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    auth: RwLock<Auth>,
}

impl GraphClient {
    pub fn new(auth: Auth) -> Self {
        Self::with_base_url(auth, GRAPH_URL)
    }

    /// Client pointed at an alternate endpoint. Used by tests.
    pub fn with_base_url(auth: Auth, base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: RwLock::new(auth),
        }
    }

    /// The underlying HTTP client, for requests that must not carry the
    /// Authorization header (pre-signed upload URLs).
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Current access token, refreshing first if expired.
    pub async fn access_token(&self) -> Result<String> {
        let mut auth = self.auth.write().await;
        auth.refresh(&self.http).await?;
        Ok(auth.access_token.clone())
    }

    /// Force-renew the token regardless of its recorded expiry.
    async fn force_refresh(&self) -> Result<()> {
        let mut auth = self.auth.write().await;
        auth.invalidate();
        auth.refresh(&self.http).await
    }

    async fn send(
        &self,
        method: &Method,
        resource: &str,
        body: Option<&[u8]>,
        headers: &[(&str, String)],
    ) -> Result<reqwest::Response> {
        let token = self.access_token().await?;
        let url = format!("{}{}", self.base_url, resource);

        let mut builder = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&token);
        builder = if *method == Method::PATCH {
            builder
                .header("If-Match", "*")
                .header("Content-Type", "application/json")
        } else if *method == Method::POST {
            builder.header("Content-Type", "application/json")
        } else if *method == Method::PUT {
            builder.header("Content-Type", "text/plain")
        } else {
            builder
        };
        for (key, value) in headers {
            builder = builder.header(*key, value.as_str());
        }
        if let Some(body) = body {
            builder = builder.body(body.to_vec());
        }
        builder.send().await.map_err(|e| classify_transport(&e))
    }

    /// Perform an authenticated request and return the response body.
    pub async fn request(
        &self,
        method: Method,
        resource: &str,
        body: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        self.request_with_headers(method, resource, body, &[]).await
    }

    /// Same as `request`, with extra headers (Range for chunked reads).
    pub async fn request_with_headers(
        &self,
        method: Method,
        resource: &str,
        body: Option<&[u8]>,
        headers: &[(&str, String)],
    ) -> Result<Vec<u8>> {
        let mut response = self.send(&method, resource, body, headers).await?;

        if response.status().as_u16() == 401 {
            log::warn!(
                "Authentication token rejected for {}, forcing renewal before retry.",
                resource
            );
            self.force_refresh().await?;
            response = self.send(&method, resource, body, headers).await?;
        } else if response.status().is_server_error() {
            // The API is having a moment; one polite retry.
            response = self.send(&method, resource, body, headers).await?;
        }

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_transport(&e))?
            .to_vec();
        if status >= 400 {
            return Err(classify_status(status, &bytes));
        }
        Ok(bytes)
    }

    pub async fn get(&self, resource: &str) -> Result<Vec<u8>> {
        self.request(Method::GET, resource, None).await
    }

    pub async fn post(&self, resource: &str, body: &[u8]) -> Result<Vec<u8>> {
        self.request(Method::POST, resource, Some(body)).await
    }

    pub async fn put(&self, resource: &str, body: &[u8]) -> Result<Vec<u8>> {
        self.request(Method::PUT, resource, Some(body)).await
    }

    pub async fn patch(&self, resource: &str, body: &[u8]) -> Result<Vec<u8>> {
        self.request(Method::PATCH, resource, Some(body)).await
    }

    pub async fn delete(&self, resource: &str) -> Result<()> {
        self.request(Method::DELETE, resource, None).await?;
        Ok(())
    }
}

/// Classify a transport-level failure: unreachable network, refused
/// connections, and name-resolution failures all read as `Offline`.
pub(crate) fn classify_transport(err: &reqwest::Error) -> Error {
    if err.is_connect() {
        Error::Offline
    } else {
        Error::RemoteIO
    }
}

/// Classify an HTTP error status plus its decoded Graph error body.
pub(crate) fn classify_status(status: u16, body: &[u8]) -> Error {
    let decoded: GraphError = serde_json::from_slice(body).unwrap_or_default();
    let code = decoded.error.code;

    match status {
        401 => Error::AuthExpired,
        404 => Error::NotFound,
        s if s >= 500 => Error::ServerBusy(s),
        _ if code.contains("nameAlreadyExists") => {
            Error::Conflict(ConflictKind::NameAlreadyExists)
        }
        _ if code.contains("resourceModified") => {
            Error::Conflict(ConflictKind::ResourceModified)
        }
        s => Error::Other(s, format!("{}: {}", code, decoded.error.message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_body(code: &str) -> Vec<u8> {
        format!(
            r#"{{"error":{{"code":"{}","message":"something happened"}}}}"#,
            code
        )
        .into_bytes()
    }

    #[test]
    fn test_classify_auth_and_not_found() {
        assert!(matches!(
            classify_status(401, &graph_body("InvalidAuthenticationToken")),
            Error::AuthExpired
        ));
        assert!(matches!(
            classify_status(404, &graph_body("itemNotFound")),
            Error::NotFound
        ));
    }

    #[test]
    fn test_classify_server_errors_as_busy() {
        assert!(matches!(
            classify_status(503, &graph_body("serviceNotAvailable")),
            Error::ServerBusy(503)
        ));
        assert!(matches!(classify_status(500, b"not json"), Error::ServerBusy(500)));
    }

    #[test]
    fn test_classify_conflicts_by_code() {
        assert!(matches!(
            classify_status(409, &graph_body("nameAlreadyExists")),
            Error::Conflict(ConflictKind::NameAlreadyExists)
        ));
        assert!(matches!(
            classify_status(409, &graph_body("resourceModified")),
            Error::Conflict(ConflictKind::ResourceModified)
        ));
    }

    #[test]
    fn test_classify_unknown_status_keeps_code_and_message() {
        match classify_status(418, &graph_body("teapot")) {
            Error::Other(418, msg) => {
                assert!(msg.contains("teapot"));
                assert!(msg.contains("something happened"));
            }
            other => panic!("expected Other(418, ..), got {:?}", other),
        }
    }

    #[test]
    fn test_classify_tolerates_unparseable_bodies() {
        assert!(matches!(
            classify_status(409, b"<html>nope</html>"),
            Error::Other(409, _)
        ));
    }
}
