use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// The key of a cached response.
///
/// Cached responses and in-flight requests share one keyspace, so the same key that names a
/// cache entry also names the pending request that will produce it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Creates a [`CacheKey`] from an arbitrary string.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// Creates a [`CacheKey`] for a request to `endpoint` with the given query `params`.
    ///
    /// The params are serialized as JSON and appended to the endpoint, so two requests to the
    /// same endpoint with equal params share a key. Missing params are treated as `{}`.
    pub fn for_endpoint<P: Serialize + ?Sized>(
        endpoint: &str,
        params: Option<&P>,
    ) -> Result<Self, serde_json::Error> {
        let params = match params {
            Some(params) => serde_json::to_string(params)?,
            None => "{}".to_owned(),
        };
        Ok(Self::new(format!("{endpoint}_{params}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_endpoint_keys() {
        let mut params = BTreeMap::new();
        params.insert("page", 1);
        params.insert("limit", 20);

        let key = CacheKey::for_endpoint("/jobs/", Some(&params)).unwrap();
        insta::assert_snapshot!(key, @r#"/jobs/_{"limit":20,"page":1}"#);

        let key = CacheKey::for_endpoint::<()>("/jobs/", None).unwrap();
        assert_eq!(key.as_str(), "/jobs/_{}");
    }

    #[test]
    fn test_equal_params_share_key() {
        let a = CacheKey::for_endpoint("/jobs/", Some(&[("page", 1)])).unwrap();
        let b = CacheKey::for_endpoint("/jobs/", Some(&[("page", 1)])).unwrap();
        let c = CacheKey::for_endpoint("/jobs/", Some(&[("page", 2)])).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
