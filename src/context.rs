//! Per-request context resolved from inbound HTTP headers.
//!
//! Callers reach the server either directly (an MCP client sending `X-Chat-Id`)
//! or through the chat UI proxy, which forwards the same values under an
//! `X-OpenWebUI-` prefix. The direct form always wins.

use std::collections::HashMap;

use axum::http::HeaderMap;

use crate::config::Config;

/// Identity and credentials for one request. Built per request, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub chat_id: Option<String>,
    pub user_email: Option<String>,
    pub user_name: Option<String>,
    pub scm_token: Option<String>,
    pub scm_host: Option<String>,
    pub api_key: Option<String>,
    pub api_base_url: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Field {
    ChatId,
    UserEmail,
    UserName,
    ScmToken,
    ScmHost,
    ApiKey,
    ApiBaseUrl,
}

/// Field, direct header, proxied header. Names are lowercase.
const HEADER_TABLE: [(Field, &str, &str); 7] = [
    (Field::ChatId, "x-chat-id", "x-openwebui-chat-id"),
    (Field::UserEmail, "x-user-email", "x-openwebui-user-email"),
    (Field::UserName, "x-user-name", "x-openwebui-user-name"),
    (Field::ScmToken, "x-gitlab-token", "x-openwebui-gitlab-token"),
    (Field::ScmHost, "x-gitlab-host", "x-openwebui-gitlab-host"),
    (Field::ApiKey, "x-anthropic-api-key", "x-openwebui-anthropic-api-key"),
    (
        Field::ApiBaseUrl,
        "x-anthropic-base-url",
        "x-openwebui-anthropic-base-url",
    ),
];

/// Headers advertised by `GET /mcp`.
pub fn header_names() -> impl Iterator<Item = (&'static str, &'static str)> {
    HEADER_TABLE.iter().map(|(_, direct, proxied)| (*direct, *proxied))
}

impl RequestContext {
    fn slot(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::ChatId => &mut self.chat_id,
            Field::UserEmail => &mut self.user_email,
            Field::UserName => &mut self.user_name,
            Field::ScmToken => &mut self.scm_token,
            Field::ScmHost => &mut self.scm_host,
            Field::ApiKey => &mut self.api_key,
            Field::ApiBaseUrl => &mut self.api_base_url,
        }
    }

    fn fill<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut ctx = Self::default();
        for (field, direct, proxied) in HEADER_TABLE {
            *ctx.slot(field) = lookup(direct).or_else(|| lookup(proxied));
        }
        ctx
    }

    /// Resolve a context from a plain header bag. Names match case-insensitively,
    /// values are taken verbatim.
    pub fn resolve(headers: &HashMap<String, String>) -> Self {
        let lowered: HashMap<String, &String> = headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
        Self::fill(|name| lowered.get(name).map(|v| (*v).clone()))
    }

    /// Resolve straight from an axum header map. Non-UTF-8 values count as absent.
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        Self::fill(|name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
    }

    /// Session key for this request, if any.
    pub fn session_key(&self) -> Option<&str> {
        self.chat_id.as_deref().filter(|id| !id.trim().is_empty())
    }

    /// Environment applied to a chat container when it is first created.
    pub fn container_env(&self, config: &Config) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert(
            "NPM_CONFIG_PREFIX".to_string(),
            "/home/assistant/.npm-global".to_string(),
        );
        env.insert(
            "GITLAB_HOST".to_string(),
            self.scm_host
                .clone()
                .unwrap_or_else(|| config.gitlab_host.clone()),
        );
        if let Some(token) = &self.scm_token {
            env.insert("GITLAB_TOKEN".to_string(), token.clone());
        }

        let api_key = self.api_key.clone().or_else(|| config.anthropic_api_key.clone());
        if let Some(key) = api_key {
            env.insert("ANTHROPIC_API_KEY".to_string(), key);
            env.insert(
                "ANTHROPIC_BASE_URL".to_string(),
                self.api_base_url
                    .clone()
                    .unwrap_or_else(|| config.anthropic_base_url.clone()),
            );
        }

        if let Some(name) = &self.user_name {
            env.insert("GIT_AUTHOR_NAME".to_string(), name.clone());
            env.insert("GIT_COMMITTER_NAME".to_string(), name.clone());
        }
        if let Some(email) = &self.user_email {
            env.insert("GIT_AUTHOR_EMAIL".to_string(), email.clone());
            env.insert("GIT_COMMITTER_EMAIL".to_string(), email.clone());
            env.insert(
                "ANTHROPIC_CUSTOM_HEADERS".to_string(),
                format!("x-openwebui-user-email: {}", email),
            );
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::path::PathBuf;

    fn bag(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn direct_header_beats_proxied() {
        let ctx = RequestContext::resolve(&bag(&[
            ("X-Chat-Id", "A"),
            ("X-OpenWebUI-Chat-Id", "B"),
        ]));
        assert_eq!(ctx.chat_id.as_deref(), Some("A"));
    }

    #[test]
    fn proxied_header_used_when_direct_missing() {
        let ctx = RequestContext::resolve(&bag(&[("X-OpenWebUI-User-Email", "e@x.com")]));
        assert_eq!(ctx.user_email.as_deref(), Some("e@x.com"));
        assert_eq!(ctx.chat_id, None);
    }

    #[test]
    fn mixed_scenario_resolves_expected_fields() {
        let ctx = RequestContext::resolve(&bag(&[
            ("x-chat-id", "c1"),
            ("x-openwebui-user-email", "u@example.com"),
        ]));
        assert_eq!(
            ctx,
            RequestContext {
                chat_id: Some("c1".to_string()),
                user_email: Some("u@example.com".to_string()),
                ..Default::default()
            }
        );
        assert_eq!(ctx.scm_token, None);
    }

    #[test]
    fn casing_does_not_change_result() {
        let a = RequestContext::resolve(&bag(&[("x-chat-id", "c1"), ("x-gitlab-token", "t")]));
        let b = RequestContext::resolve(&bag(&[("X-Chat-Id", "c1"), ("X-GITLAB-TOKEN", "t")]));
        assert_eq!(a, b);
        assert_eq!(a, RequestContext::resolve(&bag(&[("x-chat-id", "c1"), ("x-gitlab-token", "t")])));
    }

    #[test]
    fn values_are_taken_verbatim() {
        let ctx = RequestContext::resolve(&bag(&[("x-user-name", "  Ada Lovelace ")]));
        assert_eq!(ctx.user_name.as_deref(), Some("  Ada Lovelace "));
    }

    #[test]
    fn resolves_from_header_map() {
        let mut headers = HeaderMap::new();
        headers.insert("x-openwebui-chat-id", HeaderValue::from_static("proxied"));
        headers.insert("x-anthropic-base-url", HeaderValue::from_static("https://llm.local"));
        headers.insert(
            "x-user-name",
            HeaderValue::from_bytes(b"caf\xe9").expect("opaque header value"),
        );

        let ctx = RequestContext::from_header_map(&headers);
        assert_eq!(ctx.chat_id.as_deref(), Some("proxied"));
        assert_eq!(ctx.api_base_url.as_deref(), Some("https://llm.local"));
        assert_eq!(ctx.user_name, None);
    }

    #[test]
    fn blank_chat_id_is_not_a_session_key() {
        let ctx = RequestContext {
            chat_id: Some("   ".to_string()),
            ..Default::default()
        };
        assert_eq!(ctx.session_key(), None);
    }

    #[test]
    fn container_env_uses_context_then_config() {
        let mut config = Config::new(PathBuf::from("/data"));
        config.anthropic_api_key = Some("sk-default".to_string());

        let ctx = RequestContext {
            user_email: Some("u@example.com".to_string()),
            user_name: Some("Ada".to_string()),
            scm_token: Some("glpat-1".to_string()),
            ..Default::default()
        };
        let env = ctx.container_env(&config);

        assert_eq!(env["GITLAB_HOST"], "gitlab.com");
        assert_eq!(env["GITLAB_TOKEN"], "glpat-1");
        assert_eq!(env["ANTHROPIC_API_KEY"], "sk-default");
        assert_eq!(env["ANTHROPIC_BASE_URL"], "https://api.anthropic.com");
        assert_eq!(env["GIT_AUTHOR_NAME"], "Ada");
        assert_eq!(env["GIT_COMMITTER_EMAIL"], "u@example.com");
        assert_eq!(
            env["ANTHROPIC_CUSTOM_HEADERS"],
            "x-openwebui-user-email: u@example.com"
        );
    }

    #[test]
    fn container_env_omits_unknown_credentials() {
        let env = RequestContext::default().container_env(&Config::new(PathBuf::from("/data")));
        assert!(!env.contains_key("GITLAB_TOKEN"));
        assert!(!env.contains_key("ANTHROPIC_API_KEY"));
        assert!(!env.contains_key("GIT_AUTHOR_EMAIL"));
        assert_eq!(env["NPM_CONFIG_PREFIX"], "/home/assistant/.npm-global");
    }
}
