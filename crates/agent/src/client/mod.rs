use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

mod error;

pub use error::ApiError;

/// Plain HTTP side of the coordinator: token endpoints, manifest,
/// configuration and file content.
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    pub remote: Url,
    client: Client,
}

/// A decoded response body plus the headers the caller may care about.
#[derive(Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl CoordinatorClient {
    pub fn new(remote: &Url) -> Result<Self, ApiError> {
        let mut default_headers = HeaderMap::new();
        // user agent is built from crate constants and always valid ascii
        if let Ok(agent) = HeaderValue::from_str(&common::version::user_agent()) {
            default_headers.insert(USER_AGENT, agent);
        }
        let client = Client::builder().default_headers(default_headers).build()?;

        Ok(Self {
            remote: remote.clone(),
            client,
        })
    }

    /// Coordinator paths are absolute (`/openbmclapi/files`), and the base
    /// may carry a path prefix, so join by concatenation.
    pub fn url(&self, path: &str) -> Result<Url, ApiError> {
        let base = self.remote.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{}{}", base, path))?)
    }

    fn authorized(&self, builder: RequestBuilder, token: Option<&str>) -> RequestBuilder {
        match token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(ApiError::HttpStatus(status, response.text().await?))
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        token: Option<&str>,
    ) -> Result<T, ApiError> {
        let request = self.authorized(self.client.get(self.url(path)?).query(query), token);
        let response = Self::check(request.send().await?).await?;
        Ok(response.json::<T>().await?)
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        token: Option<&str>,
    ) -> Result<T, ApiError> {
        let request = self.authorized(self.client.post(self.url(path)?).json(body), token);
        let response = Self::check(request.send().await?).await?;
        Ok(response.json::<T>().await?)
    }

    /// GET returning the undecoded body, for binary manifests and file content.
    pub async fn get_bytes(
        &self,
        path: &str,
        query: &[(&str, String)],
        token: Option<&str>,
    ) -> Result<RawResponse, ApiError> {
        let request = self.authorized(self.client.get(self.url(path)?).query(query), token);
        let response = Self::check(request.send().await?).await?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;

        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }

    /// Get the underlying HTTP client for custom requests
    pub fn http_client(&self) -> &Client {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_keeps_base_prefix() {
        let client = CoordinatorClient::new(&Url::parse("http://center.test/prefix/").unwrap()).unwrap();
        assert_eq!(
            client.url("/openbmclapi/files").unwrap().as_str(),
            "http://center.test/prefix/openbmclapi/files"
        );

        let bare = CoordinatorClient::new(&Url::parse("http://center.test").unwrap()).unwrap();
        assert_eq!(
            bare.url("/a/b.jar").unwrap().as_str(),
            "http://center.test/a/b.jar"
        );
    }
}
