//! Outbound HTTP capability backing `httpClient.request`.
//!
//! Only constructed when the sandbox config allows network access. When it
//! is absent from the op state the guest binding is a stub with no path to
//! the host op at all.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::bridge::{guest_string, guest_type_name};

/// An outbound request was denied or failed.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Network access is not granted to this execution.
    #[error("network access is disabled")]
    Disabled,

    /// The request options were malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Only `http` and `https` URLs are allowed.
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// The request did not complete within the client timeout.
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The response body exceeded the configured cap.
    #[error("response body exceeds maximum size of {max} bytes")]
    ResponseTooLarge {
        /// Configured cap.
        max: usize,
    },

    /// Connection, TLS or protocol failure.
    #[error("request failed: {0}")]
    Transport(String),
}

/// Text of a network failure as the guest sees it.
pub(crate) fn guest_error_message(detail: &str) -> String {
    format!("httpClient error: {detail}")
}

/// Request options as supplied by the guest.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Upper-cased method, `GET` when omitted.
    pub method: String,
    /// Absolute `http`/`https` URL.
    pub url: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Raw body bytes, if any.
    pub body: Option<String>,
}

impl HttpRequest {
    /// Decode the single options argument of `httpClient.request`.
    ///
    /// A string body is sent verbatim. Any other body is JSON-encoded and
    /// `Content-Type: application/json` is added unless the guest set one.
    pub fn from_guest(options: &Value) -> Result<Self, NetworkError> {
        let obj = options.as_object().ok_or_else(|| {
            NetworkError::InvalidRequest(format!(
                "options must be an object, got {}",
                guest_type_name(options)
            ))
        })?;

        let url = match obj.get("url") {
            Some(Value::String(u)) if !u.is_empty() => u.clone(),
            _ => return Err(NetworkError::InvalidRequest("url is required".into())),
        };

        let method = match obj.get("method") {
            None | Some(Value::Null) => "GET".to_string(),
            Some(m) => guest_string(m).to_ascii_uppercase(),
        };

        let mut headers = HashMap::new();
        match obj.get("headers") {
            None | Some(Value::Null) => {}
            Some(Value::Object(h)) => {
                for (k, v) in h {
                    headers.insert(k.clone(), guest_string(v));
                }
            }
            Some(other) => {
                return Err(NetworkError::InvalidRequest(format!(
                    "headers must be an object, got {}",
                    guest_type_name(other)
                )))
            }
        }

        let body = match obj.get("body") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                    headers.insert("Content-Type".into(), "application/json".into());
                }
                Some(other.to_string())
            }
        };

        Ok(Self {
            method,
            url,
            headers,
            body,
        })
    }
}

/// Response object handed back to the guest.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    /// Numeric status code.
    pub status: u16,
    /// Canonical reason phrase.
    pub status_text: String,
    /// Response headers; a name may repeat.
    pub headers: BTreeMap<String, Vec<String>>,
    /// Body decoded as UTF-8 (lossy).
    pub body: String,
    /// Parsed body when the response declares a JSON content type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
}

/// HTTP client handle placed in the op state when network access is granted.
#[derive(Debug, Clone)]
pub struct HttpCapability {
    client: reqwest::Client,
    timeout: Duration,
    max_response_size: usize,
}

impl HttpCapability {
    /// Build a client with a fixed per-request timeout and response cap.
    pub fn new(timeout: Duration, max_response_size: usize) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("funcbox/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NetworkError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            timeout,
            max_response_size,
        })
    }

    /// Perform one request.
    pub async fn request(&self, req: HttpRequest) -> Result<HttpResponse, NetworkError> {
        let url = reqwest::Url::parse(&req.url)
            .map_err(|e| NetworkError::InvalidRequest(format!("invalid url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(NetworkError::UnsupportedScheme(url.scheme().to_string()));
        }
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|_| NetworkError::InvalidRequest(format!("invalid method: {}", req.method)))?;

        let mut builder = self.client.request(method, url);
        for (k, v) in &req.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let mut resp = builder.send().await.map_err(|e| self.classify(e))?;

        if resp
            .content_length()
            .is_some_and(|len| len > self.max_response_size as u64)
        {
            return Err(NetworkError::ResponseTooLarge {
                max: self.max_response_size,
            });
        }

        let status = resp.status();
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in resp.headers() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        let is_json = headers.get("content-type").is_some_and(|values| {
            values
                .iter()
                .any(|ct| ct.contains("application/json") || ct.contains("text/json"))
        });

        let mut raw = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| self.classify(e))? {
            if raw.len() + chunk.len() > self.max_response_size {
                return Err(NetworkError::ResponseTooLarge {
                    max: self.max_response_size,
                });
            }
            raw.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&raw).into_owned();
        let json = if is_json {
            serde_json::from_str(&body).ok()
        } else {
            None
        };

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
            json,
        })
    }

    fn classify(&self, err: reqwest::Error) -> NetworkError {
        if err.is_timeout() {
            NetworkError::Timeout(self.timeout)
        } else {
            NetworkError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response and hand back the raw request text.
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(pos) = text.find("\r\n\r\n") {
                    let content_length = text[..pos]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if buf.len() >= pos + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            sock.write_all(response.as_bytes()).await.unwrap();
            sock.shutdown().await.ok();
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn disabled_message_is_prefixed() {
        assert_eq!(
            guest_error_message(&NetworkError::Disabled.to_string()),
            "httpClient error: network access is disabled"
        );
    }

    fn capability() -> HttpCapability {
        HttpCapability::new(Duration::from_secs(5), 1024).unwrap()
    }

    #[test]
    fn options_require_url() {
        let err = HttpRequest::from_guest(&json!({"method": "POST"})).unwrap_err();
        assert_eq!(err.to_string(), "invalid request: url is required");
        assert!(HttpRequest::from_guest(&json!("http://x")).is_err());
    }

    #[test]
    fn method_defaults_to_get() {
        let req = HttpRequest::from_guest(&json!({"url": "http://x"})).unwrap();
        assert_eq!(req.method, "GET");
        let req = HttpRequest::from_guest(&json!({"url": "http://x", "method": "put"})).unwrap();
        assert_eq!(req.method, "PUT");
    }

    #[test]
    fn structured_body_is_json_encoded() {
        let req =
            HttpRequest::from_guest(&json!({"url": "http://x", "body": {"a": 1}})).unwrap();
        assert_eq!(req.body.as_deref(), Some(r#"{"a":1}"#));
        assert_eq!(req.headers["Content-Type"], "application/json");
    }

    #[test]
    fn explicit_content_type_wins() {
        let req = HttpRequest::from_guest(&json!({
            "url": "http://x",
            "headers": {"content-type": "application/vnd.api+json"},
            "body": [1, 2]
        }))
        .unwrap();
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.headers["content-type"], "application/vnd.api+json");
    }

    #[test]
    fn string_body_is_verbatim() {
        let req = HttpRequest::from_guest(&json!({"url": "http://x", "body": "a=b"})).unwrap();
        assert_eq!(req.body.as_deref(), Some("a=b"));
        assert!(req.headers.is_empty());
    }

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        let req = HttpRequest::from_guest(&json!({"url": "file:///etc/passwd"})).unwrap();
        let err = capability().request(req).await.unwrap_err();
        assert!(matches!(err, NetworkError::UnsupportedScheme(ref s) if s == "file"));
    }

    #[tokio::test]
    async fn json_response_is_parsed() {
        let (base, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 11\r\nConnection: close\r\n\r\n{\"ok\":true}",
        )
        .await;
        let req = HttpRequest::from_guest(&json!({
            "url": format!("{base}/price"),
            "method": "POST",
            "body": {"pair": "NEO/USD"}
        }))
        .unwrap();
        let resp = capability().request(req).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.status_text, "OK");
        assert_eq!(resp.json, Some(json!({"ok": true})));
        assert_eq!(resp.headers["content-type"], vec!["application/json"]);

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /price HTTP/1.1"), "{raw}");
        assert!(raw.to_ascii_lowercase().contains("content-type: application/json"));
        assert!(raw.ends_with(r#"{"pair":"NEO/USD"}"#));
    }

    #[tokio::test]
    async fn text_response_has_no_json() {
        let (base, _server) = serve_once(
            "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 4\r\nConnection: close\r\n\r\nnope",
        )
        .await;
        let req = HttpRequest::from_guest(&json!({"url": base})).unwrap();
        let resp = capability().request(req).await.unwrap();
        assert_eq!(resp.status, 404);
        assert_eq!(resp.body, "nope");
        assert!(resp.json.is_none());
        let v = serde_json::to_value(&resp).unwrap();
        assert!(v.get("json").is_none());
        assert_eq!(v["statusText"], "Not Found");
    }

    #[tokio::test]
    async fn oversized_response_is_rejected() {
        let (base, _server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 2048\r\nConnection: close\r\n\r\n",
        )
        .await;
        let req = HttpRequest::from_guest(&json!({"url": base})).unwrap();
        let err = capability().request(req).await.unwrap_err();
        assert!(matches!(err, NetworkError::ResponseTooLarge { max: 1024 }));
    }
}
