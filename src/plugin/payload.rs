//! Hook payloads exchanged with the proxy.
//!
//! Field names are PascalCase on the wire and bodies are base64 strings, which
//! is how the proxy encodes raw byte slices in JSON.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::http::{Headers, Method};

/// The request as seen by the proxy, plus the origin's answer once it exists.
///
/// `response_*` fields are only meaningful in the after-hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HookRequest {
    #[serde(rename = "URL", default)]
    pub url: String,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub host: String,
    /// Routing key the proxy assigned to the matched request.
    #[serde(default)]
    pub route: String,
    pub method: Method,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub response_code: u16,
    #[serde(default, with = "base64_body")]
    pub response_body: Bytes,
    #[serde(default)]
    pub response_headers: Headers,
}

impl HookRequest {
    /// Creates a request for `method` on `route` with no origin response yet.
    pub fn new(method: Method, route: impl Into<String>) -> Self {
        Self {
            url: String::new(),
            remote_addr: String::new(),
            host: String::new(),
            route: route.into(),
            method,
            headers: Headers::new(),
            response_code: 0,
            response_body: Bytes::new(),
            response_headers: Headers::new(),
        }
    }

    /// Attaches the origin's response, as the proxy does before the after-hook.
    #[must_use]
    pub fn with_origin_response(
        mut self,
        status: u16,
        body: impl Into<Bytes>,
        headers: Headers,
    ) -> Self {
        self.response_code = status;
        self.response_body = body.into();
        self.response_headers = headers;
        self
    }
}

/// Mutations a hook asks the proxy to apply to the in-flight response.
///
/// The default value means "change nothing".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HookResponse {
    #[serde(default)]
    pub status_code: u16,
    #[serde(default, with = "base64_body")]
    pub body: Bytes,
    #[serde(default)]
    pub headers_out: Headers,
    /// Use `headers_out` verbatim instead of merging with the proxy's own headers.
    #[serde(default)]
    pub override_headers_out: bool,
    /// Serve this response without contacting the origin.
    #[serde(rename = "Break", default)]
    pub short_circuit: bool,
}

impl HookResponse {
    /// Returns `true` if the hook left the response untouched.
    pub fn is_pass_through(&self) -> bool {
        *self == Self::default()
    }
}

mod base64_body {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            None => Ok(Bytes::new()),
            Some(s) => STANDARD
                .decode(s.as_bytes())
                .map(Bytes::from)
                .map_err(serde::de::Error::custom),
        }
    }
}
