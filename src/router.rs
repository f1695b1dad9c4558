//! Path-prefix routing from inbound requests to backend targets
//!
//! Matching is plain string-prefix matching on the request path. When several
//! prefixes match, the longest one wins; prefixes of equal length are ordered
//! lexicographically so the result never depends on map iteration order.

use crate::error::{Error, Result};
use http::uri::{Authority, PathAndQuery, Scheme};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Uri};
use std::cmp::Ordering;

/// A configured backend: requests under `prefix` go to `scheme://authority/base_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    prefix: String,
    scheme: Scheme,
    authority: Authority,
    /// Backend base path without a trailing slash ("" for the root)
    base_path: String,
}

impl Target {
    /// Parse a target from its path prefix and backend base URL.
    pub fn new(prefix: &str, url: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidTarget {
            prefix: prefix.to_string(),
            url: url.to_string(),
            reason: reason.to_string(),
        };

        if !prefix.starts_with('/') {
            return Err(invalid("prefix must start with '/'"));
        }

        let uri: Uri = url.parse().map_err(|e| invalid(&format!("{}", e)))?;
        let scheme = uri.scheme().cloned().ok_or_else(|| invalid("missing scheme"))?;
        if scheme != Scheme::HTTP {
            return Err(invalid("only http backends are supported"));
        }
        let authority = uri.authority().cloned().ok_or_else(|| invalid("missing host"))?;
        if uri.query().is_some() {
            return Err(invalid("backend URL must not carry a query"));
        }

        Ok(Self {
            prefix: prefix.to_string(),
            scheme,
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Backend path for a request path this target matched.
    ///
    /// The prefix is stripped and the remainder appended to the base path with
    /// exactly one slash between them. A path equal to the prefix maps to the
    /// base path itself (`/` when the base path is empty).
    pub fn backend_path(&self, path: &str) -> String {
        let remainder = path.strip_prefix(self.prefix.as_str()).unwrap_or(path);
        if remainder.is_empty() {
            return if self.base_path.is_empty() {
                "/".to_string()
            } else {
                self.base_path.clone()
            };
        }

        let remainder = remainder.trim_start_matches('/');
        let mut joined = String::with_capacity(self.base_path.len() + remainder.len() + 1);
        joined.push_str(&self.base_path);
        joined.push('/');
        joined.push_str(remainder);
        joined
    }

    /// Absolute backend URI for an inbound URI, keeping its query string.
    pub fn backend_uri(&self, uri: &Uri) -> Result<Uri, http::Error> {
        let mut path_and_query = self.backend_path(uri.path());
        if let Some(query) = uri.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        let path_and_query: PathAndQuery = path_and_query.parse()?;
        Ok(Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()?)
    }

    /// Point a request at this target: absolute backend URI and backend Host header.
    ///
    /// Method, body and all other headers are left untouched.
    pub fn rewrite_request<B>(&self, req: &mut Request<B>) -> Result<(), http::Error> {
        let uri = self.backend_uri(req.uri())?;
        *req.uri_mut() = uri;
        let host = HeaderValue::from_str(self.authority.as_str())?;
        req.headers_mut().insert(HOST, host);
        Ok(())
    }
}

/// Ordered set of targets with deterministic longest-prefix matching.
#[derive(Debug, Clone, Default)]
pub struct Router {
    /// Sorted by prefix length (longest first), then lexicographically
    targets: Vec<Target>,
}

impl Router {
    /// Build a router from a prefix → backend URL mapping.
    pub fn from_map<'a, I>(targets: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let targets = targets
            .into_iter()
            .map(|(prefix, url)| Target::new(prefix, url))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(targets))
    }

    pub fn new(mut targets: Vec<Target>) -> Self {
        targets.sort_by(|a, b| match b.prefix.len().cmp(&a.prefix.len()) {
            Ordering::Equal => a.prefix.cmp(&b.prefix),
            other => other,
        });
        targets.dedup_by(|a, b| a.prefix == b.prefix);
        Self { targets }
    }

    /// Find the target for a request path, if any.
    pub fn route(&self, path: &str) -> Option<&Target> {
        self.targets.iter().find(|t| path.starts_with(t.prefix.as_str()))
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn router(entries: &[(&str, &str)]) -> Router {
        let map = entries
            .iter()
            .map(|(p, u)| (p.to_string(), u.to_string()))
            .collect::<HashMap<_, _>>();
        Router::from_map(&map).unwrap()
    }

    #[test]
    fn test_no_match() {
        let router = router(&[("/api", "http://localhost:4000")]);
        assert!(router.route("/").is_none());
        assert!(router.route("/other/api").is_none());
    }

    #[test]
    fn test_empty_router_matches_nothing() {
        let router = Router::default();
        assert!(router.is_empty());
        assert!(router.route("/").is_none());
    }

    #[test]
    fn test_longest_prefix_wins() {
        // Repeat with fresh HashMaps so differing iteration orders are exercised
        for _ in 0..50 {
            let router = router(&[
                ("/", "http://localhost:3000/"),
                ("/api", "http://localhost:4000/"),
                ("/api/v2", "http://localhost:5000/"),
            ]);

            assert_eq!(router.route("/api/x").unwrap().prefix(), "/api");
            assert_eq!(router.route("/api/v2/users").unwrap().prefix(), "/api/v2");
            assert_eq!(router.route("/index.html").unwrap().prefix(), "/");
        }
    }

    #[test]
    fn test_equal_length_prefixes_sorted_lexicographically() {
        let router = router(&[
            ("/b", "http://localhost:3001"),
            ("/a", "http://localhost:3000"),
            ("/", "http://localhost:3002"),
        ]);

        let prefixes: Vec<&str> = router.targets().iter().map(|t| t.prefix()).collect();
        assert_eq!(prefixes, vec!["/a", "/b", "/"]);
    }

    #[test]
    fn test_prefix_is_string_prefix() {
        let router = router(&[("/api", "http://localhost:4000")]);
        assert_eq!(router.route("/apidocs").unwrap().prefix(), "/api");
    }

    #[test]
    fn test_backend_path_root_target() {
        let target = Target::new("/", "http://localhost:3000/").unwrap();
        assert_eq!(target.backend_path("/"), "/");
        assert_eq!(target.backend_path("/api/x"), "/api/x");
    }

    #[test]
    fn test_backend_path_strips_prefix() {
        let target = Target::new("/api", "http://localhost:4000").unwrap();
        assert_eq!(target.backend_path("/api"), "/");
        assert_eq!(target.backend_path("/api/users"), "/users");

        let target = Target::new("/api", "http://localhost:4000/v1/").unwrap();
        assert_eq!(target.backend_path("/api/users"), "/v1/users");
        assert_eq!(target.backend_path("/api//users"), "/v1/users");
    }

    #[test]
    fn test_backend_path_exact_prefix_adds_no_slash() {
        let target = Target::new("/api", "http://localhost:4000/v1").unwrap();
        assert_eq!(target.backend_path("/api"), "/v1");
        assert_eq!(target.backend_path("/api/"), "/v1/");

        let target = Target::new("/api/", "http://localhost:4000/v1").unwrap();
        assert_eq!(target.backend_path("/api/"), "/v1");
        assert_eq!(target.backend_path("/api/users"), "/v1/users");
    }

    #[test]
    fn test_rewrite_request() {
        let target = Target::new("/api", "http://localhost:4000/v1").unwrap();
        let mut req = Request::builder()
            .method("POST")
            .uri("/api/users?id=1")
            .header(HOST, "localhost:8080")
            .header("x-custom", "kept")
            .body(())
            .unwrap();

        target.rewrite_request(&mut req).unwrap();

        assert_eq!(req.method(), "POST");
        assert_eq!(req.uri().scheme_str(), Some("http"));
        assert_eq!(req.uri().authority().unwrap().as_str(), "localhost:4000");
        assert_eq!(req.uri().path(), "/v1/users");
        assert_eq!(req.uri().query(), Some("id=1"));
        assert_eq!(req.headers().get(HOST).unwrap(), "localhost:4000");
        assert_eq!(req.headers().get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn test_invalid_targets() {
        assert!(Target::new("api", "http://localhost:4000").is_err());
        assert!(Target::new("/api", "localhost:4000").is_err());
        assert!(Target::new("/api", "https://localhost:4000").is_err());
        assert!(Target::new("/api", "not a url").is_err());
    }
}
