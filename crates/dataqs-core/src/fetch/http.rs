//! HTTP resource source

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use super::{FetchError, ResourceSource};
use crate::config::Credentials;

/// Hard cap on a single download.
pub const DEFAULT_MAX_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub enum HttpAuth {
    #[default]
    None,
    Basic(Credentials),
    /// Token sent as a query parameter, e.g. `auth=<token>`.
    Query { param: String, value: String },
}

pub struct HttpSource {
    client: Client,
    auth: HttpAuth,
    max_bytes: u64,
}

impl HttpSource {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(30)))
            .user_agent(user_agent)
            .build()?;

        Ok(Self {
            client,
            auth: HttpAuth::None,
            max_bytes: DEFAULT_MAX_BYTES,
        })
    }

    pub fn with_auth(mut self, auth: HttpAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

#[async_trait]
impl ResourceSource for HttpSource {
    fn scheme(&self) -> &str {
        "http"
    }

    async fn retrieve(&self, location: &str) -> Result<Vec<u8>, FetchError> {
        debug!(url = %location, "HTTP GET");

        let mut request = self.client.get(location);
        match &self.auth {
            HttpAuth::None => {},
            HttpAuth::Basic(creds) => {
                request = request.basic_auth(&creds.username, Some(&creds.password));
            },
            HttpAuth::Query { param, value } => {
                request = request.query(&[(param.as_str(), value.as_str())]);
            },
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(location.to_string()));
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                location: location.to_string(),
                status: status.as_u16(),
            });
        }

        if response.content_length().is_some_and(|len| len > self.max_bytes) {
            return Err(FetchError::TooLarge { limit: self.max_bytes });
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(FetchError::TooLarge { limit: self.max_bytes });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source() -> HttpSource {
        HttpSource::new("dataqs-test", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_retrieve_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.geojson"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"features\":[]}"))
            .mount(&server)
            .await;

        let body = source()
            .retrieve(&format!("{}/feed.geojson", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, b"{\"features\":[]}");
    }

    #[tokio::test]
    async fn test_not_found_and_server_error() {
        let server = MockServer::start().await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/broken"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let src = source();
        let missing = src.retrieve(&format!("{}/missing", server.uri())).await;
        assert!(matches!(missing, Err(FetchError::NotFound(_))));

        let broken = src.retrieve(&format!("{}/broken", server.uri())).await;
        assert!(matches!(broken, Err(FetchError::Status { status: 503, .. })));
    }

    #[tokio::test]
    async fn test_query_token_auth() {
        let server = MockServer::start().await;
        Mock::given(path("/HMapi.php"))
            .and(query_param("auth", "tok123"))
            .and(query_param("striphtml", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let src = source().with_auth(HttpAuth::Query {
            param: "auth".to_string(),
            value: "tok123".to_string(),
        });
        let body = src
            .retrieve(&format!("{}/HMapi.php?striphtml=1", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, b"[]");
    }

    #[tokio::test]
    async fn test_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(path("/secure"))
            .and(header("authorization", "Basic YWxpY2U6c2VjcmV0"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let src = source().with_auth(HttpAuth::Basic(Credentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
        }));
        assert_eq!(src.retrieve(&format!("{}/secure", server.uri())).await.unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_size_cap() {
        let server = MockServer::start().await;
        Mock::given(path("/big"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 2048]))
            .mount(&server)
            .await;

        let src = source().max_bytes(1024);
        let result = src.retrieve(&format!("{}/big", server.uri())).await;
        assert!(matches!(result, Err(FetchError::TooLarge { limit: 1024 })));
    }
}
