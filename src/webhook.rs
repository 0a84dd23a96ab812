//! HTTP webhook provider.
//!
//! One logical provider wraps an ordered list of endpoints; `send` tries
//! them in order until one succeeds. Endpoint URLs, methods, headers,
//! auth material, and payload templates are validated once at
//! construction so dispatch-time failures are transport failures only.

use crate::config::{ConfigError, EndpointConfig, ProviderConfig, SecretRef};
use crate::notification::{Notification, NotificationType};
use crate::provider::{Provider, ProviderError};
use async_trait::async_trait;
use handlebars::Handlebars;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde_json::json;
use std::time::Duration;

/// Largest slice of a response body kept for error context; the rest is
/// drained and discarded so connections return to the pool.
const BODY_CAP: usize = 1024;

const TEMPLATE_NAME: &str = "payload";

/// Turns configuration secret references into credential strings.
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, secret: &SecretRef) -> Result<String, ConfigError>;
}

/// Resolves environment variables, file paths, and inline literals.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretResolver;

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, secret: &SecretRef) -> Result<String, ConfigError> {
        if let Some(name) = &secret.env {
            return std::env::var(name).map_err(|_| ConfigError::Invalid {
                field: "auth",
                reason: format!("environment variable {name:?} is not set"),
            });
        }
        if let Some(path) = &secret.file {
            return std::fs::read_to_string(path)
                .map(|contents| contents.trim().to_string())
                .map_err(|e| ConfigError::Invalid {
                    field: "auth",
                    reason: format!("cannot read secret file {path:?}: {e}"),
                });
        }
        if let Some(value) = &secret.value {
            return Ok(value.clone());
        }
        Err(ConfigError::Invalid {
            field: "auth",
            reason: "secret reference has no env, file, or value".to_string(),
        })
    }
}

#[derive(Debug, Clone)]
enum ResolvedAuth {
    None,
    Bearer(String),
    Basic { username: String, password: String },
    Custom { header: HeaderName, value: String },
}

#[derive(Debug, Clone)]
struct Endpoint {
    url: Url,
    method: Method,
    headers: HeaderMap,
    timeout: Option<Duration>,
    auth: ResolvedAuth,
}

/// Webhook-backed [`Provider`].
pub struct WebhookProvider {
    name: String,
    enabled: bool,
    supported_types: Vec<NotificationType>,
    endpoints: Vec<Endpoint>,
    client: reqwest::Client,
    template: Option<Handlebars<'static>>,
}

impl WebhookProvider {
    /// Builds and validates a provider from its configuration entry.
    pub fn from_config(
        config: &ProviderConfig,
        resolver: &dyn SecretResolver,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let webhook = config.webhook.as_ref().ok_or(ConfigError::Invalid {
            field: "webhook",
            reason: format!("provider {:?} has no webhook transport", config.name),
        })?;
        if webhook.endpoints.is_empty() {
            return Err(ConfigError::Invalid {
                field: "webhook.endpoints",
                reason: "at least one endpoint is required".to_string(),
            });
        }

        let mut endpoints = Vec::with_capacity(webhook.endpoints.len());
        for endpoint in &webhook.endpoints {
            endpoints.push(build_endpoint(endpoint, resolver)?);
        }

        let template = match &webhook.template {
            None => None,
            Some(source) => Some(compile_template(source)?),
        };

        let client = reqwest::Client::builder().build().map_err(|e| ConfigError::Invalid {
            field: "webhook",
            reason: format!("cannot build HTTP client: {e}"),
        })?;

        let supported_types = config
            .supported_types
            .clone();

        Ok(Self {
            name: config.name.clone(),
            enabled: config.enabled,
            supported_types,
            endpoints,
            client,
            template,
        })
    }

    fn payload(&self, notification: &Notification) -> Result<String, ProviderError> {
        match &self.template {
            Some(registry) => {
                let data = serde_json::to_value(notification)
                    .map_err(|e| ProviderError::Validation(e.to_string()))?;
                let rendered = registry
                    .render(TEMPLATE_NAME, &data)
                    .map_err(|e| ProviderError::Validation(e.to_string()))?;
                Ok(rendered)
            }
            None => Ok(default_payload(notification).to_string()),
        }
    }

    async fn send_endpoint(
        &self,
        endpoint: &Endpoint,
        body: String,
    ) -> Result<(), ProviderError> {
        let mut request = self
            .client
            .request(endpoint.method.clone(), endpoint.url.clone())
            .headers(endpoint.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(timeout) = endpoint.timeout {
            request = request.timeout(timeout);
        }
        request = match &endpoint.auth {
            ResolvedAuth::None => request,
            ResolvedAuth::Bearer(token) => request.bearer_auth(token),
            ResolvedAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            ResolvedAuth::Custom { header, value } => request.header(header.clone(), value),
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(endpoint.timeout.unwrap_or(Duration::ZERO))
            } else {
                ProviderError::transport(format!("request to {} failed: {e}", endpoint.url))
            }
        })?;

        let status = response.status();
        let body = read_body_capped(response).await;
        if status.is_success() {
            Ok(())
        } else {
            Err(ProviderError::Http { status: status.as_u16(), body })
        }
    }
}

#[async_trait]
impl Provider for WebhookProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn supports_type(&self, kind: NotificationType) -> bool {
        self.supported_types.is_empty() || self.supported_types.contains(&kind)
    }

    async fn validate_config(&self) -> Result<(), ProviderError> {
        // Endpoints were fully validated at construction; a probe only has
        // to confirm the provider still has somewhere to send.
        if self.endpoints.is_empty() {
            return Err(ProviderError::Validation("no endpoints configured".to_string()));
        }
        Ok(())
    }

    async fn send(&self, notification: &Notification) -> Result<(), ProviderError> {
        let body = self.payload(notification)?;
        let mut last_error = None;
        for endpoint in &self.endpoints {
            match self.send_endpoint(endpoint, body.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(
                        provider = %self.name,
                        endpoint = %endpoint.url,
                        error = %e,
                        "webhook endpoint failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ProviderError::Validation("no endpoints".to_string())))
    }
}

/// Default wire shape. `priority` is always present; `component` and
/// `metadata` are omitted when empty.
fn default_payload(notification: &Notification) -> serde_json::Value {
    let mut payload = json!({
        "id": notification.id,
        "type": notification.kind.as_str(),
        "priority": notification.priority.as_str(),
        "title": notification.title,
        "message": notification.message,
        "timestamp": notification.timestamp.to_rfc3339(),
    });
    let object = payload.as_object_mut().expect("payload is an object");
    if !notification.component.is_empty() {
        object.insert("component".to_string(), json!(notification.component));
    }
    if !notification.metadata.is_empty() {
        object.insert(
            "metadata".to_string(),
            serde_json::to_value(&notification.metadata).unwrap_or(serde_json::Value::Null),
        );
    }
    payload
}

fn build_endpoint(
    config: &EndpointConfig,
    resolver: &dyn SecretResolver,
) -> Result<Endpoint, ConfigError> {
    if config.url.trim().is_empty() {
        return Err(ConfigError::Invalid {
            field: "webhook.endpoints.url",
            reason: "url must not be empty".to_string(),
        });
    }
    let url: Url = config.url.parse().map_err(|e| ConfigError::Invalid {
        field: "webhook.endpoints.url",
        reason: format!("{:?}: {e}", config.url),
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::Invalid {
            field: "webhook.endpoints.url",
            reason: format!("unsupported scheme {:?}", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        return Err(ConfigError::Invalid {
            field: "webhook.endpoints.url",
            reason: format!("{:?} has no host", config.url),
        });
    }

    let method = match config.method.as_deref() {
        None => Method::POST,
        Some(m) => match m.to_ascii_uppercase().as_str() {
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "PATCH" => Method::PATCH,
            other => {
                return Err(ConfigError::Invalid {
                    field: "webhook.endpoints.method",
                    reason: format!("{other:?} is not one of POST, PUT, PATCH"),
                })
            }
        },
    };

    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let header = parse_header_name(name)?;
        let value = HeaderValue::from_str(value).map_err(|_| ConfigError::Invalid {
            field: "webhook.endpoints.headers",
            reason: format!("invalid value for header {name:?}"),
        })?;
        headers.insert(header, value);
    }

    let auth = match &config.auth {
        crate::config::AuthConfig::None => ResolvedAuth::None,
        crate::config::AuthConfig::Bearer { token } => {
            ResolvedAuth::Bearer(resolve_non_empty(resolver, token, "bearer token")?)
        }
        crate::config::AuthConfig::Basic { username, password } => {
            if username.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "auth",
                    reason: "basic auth username must not be empty".to_string(),
                });
            }
            ResolvedAuth::Basic {
                username: username.clone(),
                password: resolve_non_empty(resolver, password, "basic auth password")?,
            }
        }
        crate::config::AuthConfig::Custom { header, value } => ResolvedAuth::Custom {
            header: parse_header_name(header)?,
            value: resolve_non_empty(resolver, value, "custom auth header")?,
        },
    };

    Ok(Endpoint { url, method, headers, timeout: config.timeout(), auth })
}

fn parse_header_name(name: &str) -> Result<HeaderName, ConfigError> {
    // CR, LF, and ':' would let a header name smuggle extra header lines.
    if name.is_empty() || name.contains(['\r', '\n', ':']) {
        return Err(ConfigError::Invalid {
            field: "webhook.endpoints.headers",
            reason: format!("invalid header name {name:?}"),
        });
    }
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| ConfigError::Invalid {
        field: "webhook.endpoints.headers",
        reason: format!("invalid header name {name:?}"),
    })
}

fn resolve_non_empty(
    resolver: &dyn SecretResolver,
    secret: &SecretRef,
    what: &str,
) -> Result<String, ConfigError> {
    let value = resolver.resolve(secret)?;
    if value.is_empty() {
        return Err(ConfigError::Invalid {
            field: "auth",
            reason: format!("{what} resolved to an empty string"),
        });
    }
    Ok(value)
}

/// Compiles a payload template and proves it renders valid JSON against a
/// stand-in notification.
fn compile_template(source: &str) -> Result<Handlebars<'static>, ConfigError> {
    let mut registry = Handlebars::new();
    registry
        .register_template_string(TEMPLATE_NAME, source)
        .map_err(|e| ConfigError::Invalid {
            field: "webhook.template",
            reason: format!("template parse error: {e}"),
        })?;

    let dummy = Notification::new(
        NotificationType::Info,
        crate::notification::NotificationPriority::Low,
        "Template validation",
        "Template validation body",
    )
    .with_component("template-check");
    let data = serde_json::to_value(&dummy).map_err(|e| ConfigError::Invalid {
        field: "webhook.template",
        reason: e.to_string(),
    })?;
    let rendered = registry.render(TEMPLATE_NAME, &data).map_err(|e| ConfigError::Invalid {
        field: "webhook.template",
        reason: format!("template render error: {e}"),
    })?;
    serde_json::from_str::<serde_json::Value>(&rendered).map_err(|e| ConfigError::Invalid {
        field: "webhook.template",
        reason: format!("template output is not valid JSON: {e}"),
    })?;
    Ok(registry)
}

/// Reads at most [`BODY_CAP`] bytes of the response body and discards the
/// rest, so the connection is reusable and errors stay bounded.
async fn read_body_capped(mut response: reqwest::Response) -> String {
    let mut collected: Vec<u8> = Vec::new();
    while let Ok(Some(chunk)) = response.chunk().await {
        if collected.len() < BODY_CAP {
            let remaining = BODY_CAP - collected.len();
            collected.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
        }
        // Keep draining past the cap.
    }
    String::from_utf8_lossy(&collected).into_owned()
}
