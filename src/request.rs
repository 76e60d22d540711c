//! Request descriptors and canonical request signatures.
//!
//! A [`RequestDescriptor`] names the upstream call (method, url, params)
//! without performing it. Its [`signature`](RequestDescriptor::signature) is
//! independent of object key order, so two descriptors built from the same
//! logical parameters always coalesce and share cache entries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// HTTP method of the upstream call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// Read.
    #[default]
    Get,
    /// Create.
    Post,
    /// Replace.
    Put,
    /// Partial update.
    Patch,
    /// Remove.
    Delete,
}

impl Method {
    /// Upper-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of one upstream call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// HTTP method.
    pub method: Method,
    /// Target url (path or absolute).
    pub url: String,
    /// Query parameters or body. `Null` when there are none.
    #[serde(default)]
    pub params: Value,
    /// Explicit rate-limit category. When absent the scheduler classifies by url.
    #[serde(default)]
    pub category: Option<String>,
}

impl RequestDescriptor {
    /// Create a descriptor with no params.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            params: Value::Null,
            category: None,
        }
    }

    /// Shorthand for a `GET`.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// Shorthand for a `POST`.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    /// Attach params or a body.
    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Pin the rate-limit category.
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Canonical signature: `"{METHOD} {url}#{hash}"`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use serde_json::json;
    /// use tokio_upstream_orchestrator::RequestDescriptor;
    ///
    /// let a = RequestDescriptor::get("/items").params(json!({"page": 1, "q": "x"}));
    /// let b = RequestDescriptor::get("/items").params(json!({"q": "x", "page": 1}));
    /// assert_eq!(a.signature(), b.signature());
    /// ```
    pub fn signature(&self) -> String {
        format!("{} {}#{}", self.method, self.url, params_hash(&self.params))
    }
}

/// Encode a JSON value with object keys sorted at every depth.
///
/// Arrays keep their order; `null` and `{}` encode differently here but hash
/// identically through [`params_hash`].
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Short stable hash of the canonical params encoding.
pub fn params_hash(params: &Value) -> String {
    let encoded = match params {
        Value::Null => String::from("{}"),
        Value::Object(map) if map.is_empty() => String::from("{}"),
        other => canonical_json(other),
    };
    let digest = Sha256::digest(encoded.as_bytes());
    hex::encode(&digest[..12])
}
