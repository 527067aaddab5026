use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::{Method, RequestBuilder, Response};

use crate::{error::AicurateError, Environment};

/// A thin wrapper on an HTTP client for upstream calls. Sets timeouts and the
/// user-agent, refuses plain-HTTP URLs in production, and retries transient
/// failures.
#[derive(Debug, Clone)]
pub struct Request {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
    require_https: bool,
}

impl Request {
    /// Initializes a new `Request` for the given environment.
    pub(crate) fn new(environment: Environment) -> Self {
        Self::with_client(reqwest::Client::new(), environment)
    }

    /// Initializes a `Request` around a preconfigured client (e.g. with a cookie store).
    pub(crate) fn with_client(client: reqwest::Client, environment: Environment) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(10),
            max_retries: 3, // total attempts = 4
            require_https: environment.requires_https(),
        }
    }

    /// Overrides the per-request timeout.
    pub(crate) const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Creates a request builder with defaults applied.
    pub(crate) fn req(
        &self,
        method: Method,
        url: &str,
    ) -> Result<RequestBuilder, AicurateError> {
        if self.require_https && !url.starts_with("https") {
            return Err(AicurateError::InvalidInput(format!(
                "refusing non-https upstream {url}"
            )));
        }

        Ok(self
            .client
            .request(method, url)
            .timeout(self.timeout)
            .header(
                "User-Agent",
                format!("aicurate-core/{}", env!("CARGO_PKG_VERSION")),
            ))
    }

    /// Creates a GET request builder with defaults applied.
    pub(crate) fn get(&self, url: &str) -> Result<RequestBuilder, AicurateError> {
        self.req(Method::GET, url)
    }

    /// Creates a POST request builder with defaults applied.
    pub(crate) fn post(&self, url: &str) -> Result<RequestBuilder, AicurateError> {
        self.req(Method::POST, url)
    }

    /// Sends a request once, without retries. Used for calls whose side
    /// effects must not be repeated.
    pub(crate) async fn send_once(
        &self,
        request_builder: RequestBuilder,
    ) -> Result<Response, AicurateError> {
        request_builder.send().await.map_err(Into::into)
    }

    /// Handles sending a request built by `req`/`get`/`post` with retries for transient failures.
    pub(crate) async fn handle(
        &self,
        request_builder: RequestBuilder,
    ) -> Result<Response, AicurateError> {
        let Some(template) = request_builder.try_clone() else {
            return execute_request_builder(request_builder)
                .await
                .map_err(Into::into);
        };

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(self.max_retries as usize);

        (|| async {
            let request_builder = template.try_clone().ok_or_else(|| {
                RequestHandleError::permanent(
                    "<unknown>".to_string(),
                    None,
                    "request cannot be retried because it is not cloneable".to_string(),
                )
            })?;
            execute_request_builder(request_builder).await
        })
        .retry(backoff)
        .when(RequestHandleError::is_retryable)
        .notify(|err: &RequestHandleError, delay: Duration| {
            tracing::debug!(
                url = %err.url,
                status = ?err.status,
                "retrying upstream request in {delay:?}: {}",
                err.error
            );
        })
        .await
        .map_err(Into::into)
    }
}

#[derive(Debug)]
struct RequestHandleError {
    url: String,
    status: Option<u16>,
    error: String,
    retryable: bool,
}

impl RequestHandleError {
    fn retryable(url: String, status: Option<u16>, error: String) -> Self {
        Self {
            url,
            status,
            error,
            retryable: true,
        }
    }

    fn permanent(url: String, status: Option<u16>, error: String) -> Self {
        Self {
            url,
            status,
            error,
            retryable: false,
        }
    }

    const fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<RequestHandleError> for AicurateError {
    fn from(value: RequestHandleError) -> Self {
        Self::NetworkError {
            url: value.url,
            status: value.status,
            error: value.error,
        }
    }
}

async fn execute_request_builder(
    request_builder: RequestBuilder,
) -> Result<Response, RequestHandleError> {
    let (client, request) = request_builder.build_split();
    let request = request.map_err(|err| {
        RequestHandleError::permanent(
            err.url()
                .map_or_else(|| "<unknown>".to_string(), ToString::to_string),
            None,
            format!("request build failed: {err}"),
        )
    })?;
    let url = request.url().to_string();

    match client.execute(request).await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if status == 429 || (500..600).contains(&status) {
                return Err(RequestHandleError::retryable(
                    url,
                    Some(status),
                    format!("request error with bad status code {status}"),
                ));
            }
            Ok(resp)
        }
        Err(err) => {
            if err.is_timeout() || err.is_connect() {
                return Err(RequestHandleError::retryable(
                    url,
                    None,
                    format!("request timeout/connect error: {err}"),
                ));
            }

            Err(RequestHandleError::permanent(
                url,
                None,
                format!("request failed: {err}"),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_errors_are_retried_until_exhausted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(503)
            .expect(4)
            .create_async()
            .await;

        let request = Request::new(Environment::Staging);
        let url = format!("{}/flaky", server.url());
        let result = request.handle(request.get(&url).unwrap()).await;

        mock.assert_async().await;
        match result {
            Err(AicurateError::NetworkError { status, url: failed, .. }) => {
                assert_eq!(status, Some(503));
                assert_eq!(failed, url);
            }
            other => panic!("expected NetworkError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/reject")
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let request = Request::new(Environment::Staging);
        let response = request
            .handle(request.post(&format!("{}/reject", server.url())).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 400);
        mock.assert_async().await;
    }

    #[test]
    fn test_production_refuses_plain_http() {
        let request = Request::new(Environment::Production);
        assert!(matches!(
            request.get("http://example.com"),
            Err(AicurateError::InvalidInput(_))
        ));
        assert!(request.get("https://example.com").is_ok());
    }
}
