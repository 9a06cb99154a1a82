//! String collations used by GroupBy key equality and OrderBy key ordering.
//!
//! The pipeline is agnostic to collation rules; it resolves a URI against the
//! registry and delegates comparison entirely.

use crate::runtime::{Error, ErrorCode, QueryContext};
use std::collections::HashMap;
use std::sync::Arc;

/// Codepoint collation URI (the default).
pub const CODEPOINT_URI: &str = "http://www.w3.org/2005/xpath-functions/collation/codepoint";
/// Case-insensitive collation URI.
pub const SIMPLE_CASE_URI: &str = "urn:flwor:collation:case-insensitive";

pub trait Collation: Send + Sync {
    fn uri(&self) -> &str;
    fn compare(&self, a: &str, b: &str) -> core::cmp::Ordering;
    fn key(&self, s: &str) -> String {
        s.to_string()
    }
}

pub struct CodepointCollation;

impl Collation for CodepointCollation {
    fn uri(&self) -> &str {
        CODEPOINT_URI
    }
    fn compare(&self, a: &str, b: &str) -> core::cmp::Ordering {
        a.cmp(b)
    }
}

/// Simple case-insensitive collation.
pub struct SimpleCaseCollation;

impl Collation for SimpleCaseCollation {
    fn uri(&self) -> &str {
        SIMPLE_CASE_URI
    }
    fn compare(&self, a: &str, b: &str) -> core::cmp::Ordering {
        self.key(a).cmp(&self.key(b))
    }
    fn key(&self, s: &str) -> String {
        s.to_lowercase()
    }
}

/// Registry of available collations, keyed by their URI.
pub struct CollationRegistry {
    by_uri: HashMap<String, Arc<dyn Collation>>,
}

impl Default for CollationRegistry {
    fn default() -> Self {
        let mut reg = Self { by_uri: HashMap::new() };
        let def: Arc<dyn Collation> = Arc::new(CodepointCollation);
        reg.by_uri.insert(def.uri().to_string(), def);
        reg.by_uri.insert(SIMPLE_CASE_URI.to_string(), Arc::new(SimpleCaseCollation));
        reg
    }
}

impl CollationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uri: &str) -> Option<Arc<dyn Collation>> {
        self.by_uri.get(uri).cloned()
    }

    pub fn insert(&mut self, collation: Arc<dyn Collation>) {
        self.by_uri.insert(collation.uri().to_string(), collation);
    }
}

/// Resolves an explicit collation URI, falling back to the context default
/// and then to codepoint order.
pub fn resolve_collation(qc: &QueryContext, uri: Option<&str>) -> Result<Arc<dyn Collation>, Error> {
    let effective = uri.or(qc.default_collation.as_deref());
    match effective {
        Some(u) => qc
            .collations
            .get(u)
            .ok_or_else(|| Error::from_code(ErrorCode::FOCH0002, format!("unknown collation URI: {u}"))),
        None => Ok(qc.collations.get(CODEPOINT_URI).expect("codepoint collation registered")),
    }
}
