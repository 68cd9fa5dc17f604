//! Legacy header map → standards-based header collection.
//!
//! The response bridge records headers the way push-style response objects
//! do: one entry per name, holding either a single value or a list. When the
//! head is handed to the caller it is converted with [`convert_headers`]:
//!
//! - absent values are skipped
//! - list values are **appended** one by one (multiplicity preserved, e.g.
//!   repeated `set-cookie`)
//! - scalar values are **set** (overwrite semantics)

use std::collections::BTreeMap;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

/// A header value as recorded by a push-style response object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LegacyHeaderValue {
    /// One value; overwrites on conversion.
    Scalar(String),
    /// Several values; each is appended on conversion.
    List(Vec<String>),
}

/// Header name → optional value. `None` models an explicitly absent value.
pub type LegacyHeaders = BTreeMap<String, Option<LegacyHeaderValue>>;

impl From<&str> for LegacyHeaderValue {
    fn from(v: &str) -> Self {
        Self::Scalar(v.to_owned())
    }
}

impl From<String> for LegacyHeaderValue {
    fn from(v: String) -> Self {
        Self::Scalar(v)
    }
}

impl From<u64> for LegacyHeaderValue {
    fn from(v: u64) -> Self {
        Self::Scalar(v.to_string())
    }
}

impl From<Vec<String>> for LegacyHeaderValue {
    fn from(v: Vec<String>) -> Self {
        Self::List(v)
    }
}

impl From<Vec<&str>> for LegacyHeaderValue {
    fn from(v: Vec<&str>) -> Self {
        Self::List(v.into_iter().map(str::to_owned).collect())
    }
}

/// Convert a legacy header map into an [`http::HeaderMap`].
///
/// Names or values that are not valid HTTP tokens are dropped with a warning.
pub fn convert_headers(legacy: &LegacyHeaders) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in legacy {
        let Some(value) = value else { continue };
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(header = %name, "dropping header with invalid name");
            continue;
        };
        match value {
            LegacyHeaderValue::List(values) => {
                for v in values {
                    if let Some(hv) = header_value(&header_name, v) {
                        let _ = out.append(header_name.clone(), hv);
                    }
                }
            }
            LegacyHeaderValue::Scalar(v) => {
                if let Some(hv) = header_value(&header_name, v) {
                    let _ = out.insert(header_name, hv);
                }
            }
        }
    }
    out
}

fn header_value(name: &HeaderName, value: &str) -> Option<HeaderValue> {
    match HeaderValue::from_str(value) {
        Ok(hv) => Some(hv),
        Err(_) => {
            warn!(header = %name, "dropping header with invalid value");
            None
        }
    }
}
