//! HTTP response handling.
//!
//! [`Response`] buffers the whole body as [`Bytes`], which makes its `Clone`
//! implementation the replay contract the pipeline relies on: every clone is
//! an independently consumable copy, so the dedup coalescer and response
//! cache can hand the same logical response to many callers without a
//! second fetch. `Bytes` clones share the underlying buffer, so this is
//! cheap.

use std::collections::HashMap;

use bytes::Bytes;

/// HTTP response with status, headers, body, and the URL it came from.
#[derive(Debug, Clone)]
pub struct Response<B = Bytes> {
    status: u16,
    headers: HashMap<String, String>,
    body: B,
    url: Option<url::Url>,
}

impl<B> Response<B> {
    /// Creates a new response.
    #[must_use]
    pub fn new(status: u16, headers: HashMap<String, String>, body: B) -> Self {
        Self {
            status,
            headers,
            body,
            url: None,
        }
    }

    /// Attaches the origin URL this response was fetched from.
    #[must_use]
    pub fn with_url(mut self, url: url::Url) -> Self {
        self.url = Some(url);
        self
    }

    /// HTTP status code.
    #[must_use]
    pub const fn status(&self) -> u16 {
        self.status
    }

    /// Response headers.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Single header value by name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// URL this response was fetched from, if the transport recorded it.
    #[must_use]
    pub const fn url(&self) -> Option<&url::Url> {
        self.url.as_ref()
    }

    /// Response body.
    #[must_use]
    pub const fn body(&self) -> &B {
        &self.body
    }

    /// Consume into body.
    #[must_use]
    pub fn into_body(self) -> B {
        self.body
    }

    /// Consume into (status, headers, body).
    #[must_use]
    pub fn into_parts(self) -> (u16, HashMap<String, String>, B) {
        (self.status, self.headers, self.body)
    }

    /// Status is 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Status is 3xx.
    #[must_use]
    pub const fn is_redirection(&self) -> bool {
        self.status >= 300 && self.status < 400
    }

    /// Status is 4xx.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        self.status >= 400 && self.status < 500
    }

    /// Status is 5xx.
    #[must_use]
    pub const fn is_server_error(&self) -> bool {
        self.status >= 500 && self.status < 600
    }

    /// Transform the body with a function.
    pub fn map_body<F, B2>(self, f: F) -> Response<B2>
    where
        F: FnOnce(B) -> B2,
    {
        Response {
            status: self.status,
            headers: self.headers,
            body: f(self.body),
            url: self.url,
        }
    }
}

impl Response<Bytes> {
    /// Deserialize the response body as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn json<T: serde::de::DeserializeOwned>(self) -> crate::Result<T> {
        crate::from_json(&self.body)
    }

    /// Get the response body as text.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid UTF-8.
    pub fn text(self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_basic() {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        let response = Response::new(200, headers, Bytes::from(r#"{"id":1}"#));

        assert_eq!(response.status(), 200);
        assert_eq!(response.header("Content-Type"), Some("application/json"));
        assert!(response.is_success());
        assert!(!response.is_client_error());
        assert!(!response.is_server_error());
        assert!(response.url().is_none());
    }

    #[test]
    fn response_with_url() {
        let url = url::Url::parse("https://api.example.com/users/1").expect("valid URL");
        let response = Response::new(200, HashMap::new(), Bytes::new()).with_url(url.clone());
        assert_eq!(response.url(), Some(&url));
    }

    #[test]
    fn response_status_checks() {
        let response = Response::new(301, HashMap::new(), Bytes::new());
        assert!(response.is_redirection());

        let response = Response::new(404, HashMap::new(), Bytes::new());
        assert!(response.is_client_error());

        let response = Response::new(500, HashMap::new(), Bytes::new());
        assert!(response.is_server_error());
    }

    #[test]
    fn response_clone_is_independently_consumable() {
        let response = Response::new(200, HashMap::new(), Bytes::from("payload"));
        let cloned = response.clone();

        let first = response.into_body();
        let second = cloned.into_body();
        assert_eq!(first, second);
        assert_eq!(first.as_ref(), b"payload");
    }

    #[test]
    fn response_json() {
        #[derive(Debug, PartialEq, serde::Deserialize)]
        struct User {
            id: u64,
            name: String,
        }

        let body = Bytes::from(r#"{"id":1,"name":"test"}"#);
        let response = Response::new(200, HashMap::new(), body);

        let user: User = response.json().expect("deserialize");
        assert_eq!(
            user,
            User {
                id: 1,
                name: "test".to_string()
            }
        );
    }

    #[test]
    fn response_text() {
        let body = Bytes::from("Hello, World!");
        let response = Response::new(200, HashMap::new(), body);

        let text = response.text().expect("text");
        assert_eq!(text, "Hello, World!");
    }

    #[test]
    fn response_map_body() {
        let response = Response::new(200, HashMap::new(), Bytes::from("test"));
        let mapped = response.map_body(|b| b.len());

        assert_eq!(mapped.status(), 200);
        assert_eq!(*mapped.body(), 4);
    }
}
