use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Client, Method, Request, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Result, SidelinkError};

/// Interception points around every call the client makes to the sidecar.
#[async_trait]
pub trait RequestMiddleware: Send + Sync {
    async fn pre_request(&self, _request: &mut Request) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_response(&self, _response: &Response) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct SidecarHttpClient {
    base_url: String,
    client: Client,
    connection_id_header: HeaderName,
    middleware: Vec<Arc<dyn RequestMiddleware>>,
}

impl SidecarHttpClient {
    pub fn new(base_url: impl Into<String>, connection_id_header: HeaderName) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
            connection_id_header,
            middleware: Vec::new(),
        }
    }

    /// Append a middleware; pre hooks run in insertion order.
    pub fn with_middleware(mut self, middleware: Arc<dyn RequestMiddleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a request for `path`, tagged with the connection it targets.
    pub fn request(
        &self,
        method: Method,
        path: &str,
        connection_id: Option<&str>,
    ) -> Result<Request> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut builder = self.client.request(method, url);
        if let Some(connection_id) = connection_id {
            let value = HeaderValue::from_str(connection_id)
                .map_err(|err| SidelinkError::Middleware(err.to_string()))?;
            builder = builder.header(self.connection_id_header.clone(), value);
        }
        Ok(builder.build()?)
    }

    pub async fn execute(&self, mut request: Request) -> Result<Response> {
        for middleware in &self.middleware {
            middleware
                .pre_request(&mut request)
                .await
                .map_err(|err| SidelinkError::Middleware(format!("{err:#}")))?;
        }
        debug!(method = %request.method(), url = %request.url(), "sidecar request");
        let response = self.client.execute(request).await?;
        for middleware in &self.middleware {
            middleware
                .post_response(&response)
                .await
                .map_err(|err| SidelinkError::Middleware(format!("{err:#}")))?;
        }
        Ok(response)
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        connection_id: Option<&str>,
    ) -> Result<T> {
        let request = self.request(Method::GET, path, connection_id)?;
        let response = self.execute(request).await?.error_for_status()?;
        Ok(response.json::<T>().await?)
    }
}
