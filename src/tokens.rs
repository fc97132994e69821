//! Lookup of a user's GitLab token from the token-wrapper service.
//!
//! Only consulted when the request did not carry a token header.

use std::time::Duration;

use serde::Deserialize;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

/// Client for `GET {base}/api/internal/tokens/{email}/gitlab`.
#[derive(Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    base_url: Option<String>,
    api_key: Option<String>,
}

impl TokenClient {
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            api_key,
        }
    }

    /// Whether lookups can happen at all.
    pub fn is_configured(&self) -> bool {
        self.base_url.is_some() && self.api_key.is_some()
    }

    /// Fetch the stored token for `email`. Every failure is logged and yields `None`.
    pub async fn fetch_scm_token(&self, email: &str) -> Option<String> {
        let (Some(base), Some(key)) = (&self.base_url, &self.api_key) else {
            tracing::debug!("Token service not configured, skipping token fetch");
            return None;
        };
        if email.trim().is_empty() {
            tracing::debug!("No user email, skipping token fetch");
            return None;
        }

        let url = format!(
            "{}/api/internal/tokens/{}/gitlab",
            base,
            urlencoding::encode(email)
        );
        let response = match self
            .http
            .get(&url)
            .header("X-Internal-Api-Key", key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Token service request failed");
                return None;
            }
        };

        match response.status() {
            reqwest::StatusCode::OK => match response.json::<TokenResponse>().await {
                Ok(body) => {
                    let token = body.token.filter(|t| !t.is_empty());
                    if token.is_some() {
                        tracing::info!(user = %email, "Fetched GitLab token from token service");
                    }
                    token
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Token service returned malformed JSON");
                    None
                }
            },
            reqwest::StatusCode::NOT_FOUND => {
                tracing::debug!(user = %email, "No GitLab token stored for user");
                None
            }
            status => {
                tracing::warn!(%status, "Token service returned an error");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn returns_token_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/internal/tokens/u%40example.com/gitlab"))
            .and(header("X-Internal-Api-Key", "secret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "glpat-123"})),
            )
            .mount(&server)
            .await;

        let client = TokenClient::new(Some(server.uri()), Some("secret".to_string()));
        assert_eq!(
            client.fetch_scm_token("u@example.com").await.as_deref(),
            Some("glpat-123")
        );
    }

    #[tokio::test]
    async fn email_is_a_single_path_segment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/internal/tokens/a%2Fb%23c%3Fd%40example.com/gitlab"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "glpat-9"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = TokenClient::new(Some(server.uri()), Some("secret".to_string()));
        assert_eq!(
            client.fetch_scm_token("a/b#c?d@example.com").await.as_deref(),
            Some("glpat-9")
        );
    }

    #[tokio::test]
    async fn missing_token_yields_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = TokenClient::new(Some(server.uri()), Some("secret".to_string()));
        assert_eq!(client.fetch_scm_token("nobody@example.com").await, None);
    }

    #[tokio::test]
    async fn skipped_without_configuration_or_email() {
        let unconfigured = TokenClient::new(None, None);
        assert!(!unconfigured.is_configured());
        assert_eq!(unconfigured.fetch_scm_token("u@example.com").await, None);

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "x"})))
            .expect(0)
            .mount(&server)
            .await;
        let client = TokenClient::new(Some(server.uri()), Some("secret".to_string()));
        assert_eq!(client.fetch_scm_token("").await, None);
    }
}
