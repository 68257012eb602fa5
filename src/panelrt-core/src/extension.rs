//! The extension registry (§4.8): named async services a handler reaches
//! through `$ext.<name>.<method>(args)`. The built-in HTTP extension is
//! grounded on `reqwest`, mirroring how other services in the retrieved
//! corpus reach for it for outbound calls, with a semaphore concurrency
//! gate matching this workspace's own `tokio::sync::Semaphore` convention
//! (the interpreter pool, §4.1).

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::Method;
use serde_json::Value as Json;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::config::HttpExtensionConfig;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtensionCallError {
    #[error("extension not found")]
    NotFound,
    #[error("extension method not found")]
    MethodNotFound,
    #[error("{0}")]
    Failed(String),
}

/// A host-provided async service (§4.8). `call` is a manually-written
/// dyn-async method (no `async_trait`) since nothing else in this
/// workspace's dependency stack pulls that crate in.
pub trait Extension: Send + Sync {
    fn methods(&self) -> &[&'static str];
    fn call<'a>(&'a self, method: &'a str, args: Json) -> BoxFuture<'a, Result<Json, ExtensionCallError>>;
}

#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: HashMap<String, Arc<dyn Extension>>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("an extension named {0:?} is already registered")]
pub struct AlreadyRegistered(pub String);

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, extension: Arc<dyn Extension>) -> Result<(), AlreadyRegistered> {
        let name = name.into();
        if self.extensions.contains_key(&name) {
            return Err(AlreadyRegistered(name));
        }
        self.extensions.insert(name, extension);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.extensions.remove(name).is_some()
    }

    pub fn has(&self, name: &str) -> bool {
        self.extensions.contains_key(name)
    }

    pub fn has_method(&self, name: &str, method: &str) -> bool {
        self.extensions.get(name).is_some_and(|e| e.methods().contains(&method))
    }

    pub fn methods(&self, name: &str) -> Vec<String> {
        self.extensions
            .get(name)
            .map(|e| e.methods().iter().map(|m| m.to_string()).collect())
            .unwrap_or_default()
    }

    pub fn list(&self) -> Vec<String> {
        self.extensions.keys().cloned().collect()
    }

    /// Capability checks happened at the host-function boundary already
    /// (§4.8: "this call does not re-check").
    #[instrument(skip(self, args))]
    pub async fn call(&self, name: &str, method: &str, args: Json) -> Result<Json, ExtensionCallError> {
        let Some(extension) = self.extensions.get(name) else {
            return Err(ExtensionCallError::NotFound);
        };
        if !extension.methods().contains(&method) {
            return Err(ExtensionCallError::MethodNotFound);
        }
        extension.call(method, args).await
    }
}

const HTTP_METHODS: &[&str] = &["get", "post", "put", "patch", "delete", "head", "options", "request"];

/// The built-in HTTP extension (§4.8's "minimum viable" behaviors):
/// concurrency limit with a FIFO queue (a `tokio::sync::Semaphore`
/// naturally grants in FIFO order), per-request timeout, an optional
/// hostname allow-list, and automatic JSON body encode/decode.
pub struct HttpExtension {
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
    config: HttpExtensionConfig,
}

impl HttpExtension {
    pub fn new(config: HttpExtensionConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            semaphore: Arc::new(Semaphore::new(config.concurrency_limit.max(1))),
            config,
        })
    }

    fn host_allowed(&self, url: &reqwest::Url) -> bool {
        match &self.config.allowed_hosts {
            None => true,
            Some(allowed) => url.host_str().is_some_and(|h| allowed.iter().any(|a| a == h)),
        }
    }

    async fn dispatch(&self, method: Method, args: Json) -> Result<Json, ExtensionCallError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ExtensionCallError::Failed("http extension is shutting down".to_string()))?;

        let url_str = args
            .get("url")
            .and_then(Json::as_str)
            .ok_or_else(|| ExtensionCallError::Failed("missing required \"url\" argument".to_string()))?;
        let url = reqwest::Url::parse(url_str).map_err(|e| ExtensionCallError::Failed(format!("invalid url: {e}")))?;
        if !self.host_allowed(&url) {
            return Err(ExtensionCallError::Failed(format!("host {:?} is not in the allow-list", url.host_str())));
        }

        let mut builder = self.client.request(method, url);
        if let Some(headers) = args.get("headers").and_then(Json::as_object) {
            for (k, v) in headers {
                if let Some(v) = v.as_str() {
                    builder = builder.header(k, v);
                }
            }
        }
        if let Some(body) = args.get("body") {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| ExtensionCallError::Failed(e.to_string()))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let text = response.text().await.unwrap_or_default();
        let data = if content_type.contains("application/json") {
            serde_json::from_str(&text).unwrap_or(Json::String(text))
        } else {
            Json::String(text)
        };
        Ok(serde_json::json!({ "status": status, "data": data }))
    }
}

impl Extension for HttpExtension {
    fn methods(&self) -> &[&'static str] {
        HTTP_METHODS
    }

    fn call<'a>(&'a self, method: &'a str, args: Json) -> BoxFuture<'a, Result<Json, ExtensionCallError>> {
        Box::pin(async move {
            let http_method = match method {
                "get" => Method::GET,
                "post" => Method::POST,
                "put" => Method::PUT,
                "patch" => Method::PATCH,
                "delete" => Method::DELETE,
                "head" => Method::HEAD,
                "options" => Method::OPTIONS,
                "request" => {
                    let raw = args.get("method").and_then(Json::as_str).unwrap_or("GET");
                    Method::from_bytes(raw.to_uppercase().as_bytes())
                        .map_err(|_| ExtensionCallError::Failed(format!("invalid http method {raw:?}")))?
                }
                other => {
                    warn!(method = other, "http extension dispatched to an unknown method name");
                    return Err(ExtensionCallError::MethodNotFound);
                }
            };
            self.dispatch(http_method, args).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;
    impl Extension for Echo {
        fn methods(&self) -> &[&'static str] {
            &["ping"]
        }
        fn call<'a>(&'a self, _method: &'a str, args: Json) -> BoxFuture<'a, Result<Json, ExtensionCallError>> {
            Box::pin(async move { Ok(args) })
        }
    }

    #[tokio::test]
    async fn registry_dispatches_to_registered_extension() {
        let mut registry = ExtensionRegistry::new();
        registry.register("echo", Arc::new(Echo)).unwrap();
        let result = registry.call("echo", "ping", serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(result, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn unknown_extension_is_not_found() {
        let registry = ExtensionRegistry::new();
        let err = registry.call("missing", "ping", Json::Null).await.unwrap_err();
        assert!(matches!(err, ExtensionCallError::NotFound));
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let mut registry = ExtensionRegistry::new();
        registry.register("echo", Arc::new(Echo)).unwrap();
        let err = registry.call("echo", "nope", Json::Null).await.unwrap_err();
        assert!(matches!(err, ExtensionCallError::MethodNotFound));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let mut registry = ExtensionRegistry::new();
        registry.register("echo", Arc::new(Echo)).unwrap();
        assert!(registry.register("echo", Arc::new(Echo)).is_err());
    }

    #[test]
    fn disallowed_host_is_rejected() {
        let ext = HttpExtension::new(HttpExtensionConfig {
            allowed_hosts: Some(vec!["example.test".to_string()]),
            ..HttpExtensionConfig::default()
        })
        .unwrap();
        let url = reqwest::Url::parse("https://evil.test/x").unwrap();
        assert!(!ext.host_allowed(&url));
        let url = reqwest::Url::parse("https://example.test/x").unwrap();
        assert!(ext.host_allowed(&url));
    }
}
