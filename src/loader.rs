//! Document loading from files, URLs and memory.
//!
//! Loaders are tried in registration order; the first one whose `validate`
//! accepts a source string fetches it. The [`ResolutionCache`] makes sure each
//! location is fetched at most once per bundling session, however many nodes
//! reference it and however many of those are in flight at the same time.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{FutureExt, LocalBoxFuture, Shared};
use serde_json::Value;
use tracing::debug;

use crate::error::{BundleError, LoaderError};
use crate::pointer::{is_local_ref, is_remote_url};

#[cfg(feature = "remote")]
use std::time::Duration;

/// Default timeout for HTTP requests (10 seconds).
#[cfg(feature = "remote")]
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// A pluggable source of documents.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str {
        "custom"
    }

    /// Whether this loader handles `source`.
    fn validate(&self, source: &str) -> bool;

    /// Fetch and parse the document at `source`.
    async fn exec(&self, source: &str) -> Result<Value, LoaderError>;

    /// True when `source` is the document itself rather than where to find
    /// it. Such sources never serve as an origin for relative references.
    fn inline(&self) -> bool {
        false
    }
}

/// Reads JSON or YAML documents from the local filesystem.
///
/// Accepts anything that is neither a remote URL nor a local `#` reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadFiles;

#[async_trait]
impl Loader for ReadFiles {
    fn name(&self) -> &str {
        "files"
    }

    fn validate(&self, source: &str) -> bool {
        !source.is_empty() && !is_remote_url(source) && !is_local_ref(source)
    }

    async fn exec(&self, source: &str) -> Result<Value, LoaderError> {
        let path = Path::new(source);
        let content = tokio::fs::read_to_string(path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                LoaderError::FileNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                LoaderError::Read {
                    path: path.to_path_buf(),
                    message: err.to_string(),
                }
            }
        })?;
        parse_document(source, &content)
    }
}

/// Fetches JSON or YAML documents over HTTP(S).
///
/// Requires the `remote` feature (enabled by default).
#[cfg(feature = "remote")]
#[derive(Debug, Clone, Default)]
pub struct FetchUrls {
    client: reqwest::Client,
}

#[cfg(feature = "remote")]
impl FetchUrls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured client (proxies, headers).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "remote")]
#[async_trait]
impl Loader for FetchUrls {
    fn name(&self) -> &str {
        "urls"
    }

    fn validate(&self, source: &str) -> bool {
        is_remote_url(source)
    }

    async fn exec(&self, url: &str) -> Result<Value, LoaderError> {
        let network = |err: reqwest::Error| LoaderError::Network {
            url: url.to_string(),
            message: err.to_string(),
        };

        let response = self
            .client
            .get(url)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .map_err(network)?;

        // Check for HTTP errors before parsing
        let status = response.status();
        if !status.is_success() {
            return Err(LoaderError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(network)?;
        parse_document(url, &body)
    }
}

/// Serves documents from a fixed map of `source → document`.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    documents: HashMap<String, Value>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document, replacing any previous one under the same source.
    pub fn with(mut self, source: impl Into<String>, document: Value) -> Self {
        self.insert(source, document);
        self
    }

    pub fn insert(&mut self, source: impl Into<String>, document: Value) {
        self.documents.insert(source.into(), document);
    }
}

#[async_trait]
impl Loader for MemoryLoader {
    fn name(&self) -> &str {
        "memory"
    }

    fn validate(&self, source: &str) -> bool {
        self.documents.contains_key(source)
    }

    async fn exec(&self, source: &str) -> Result<Value, LoaderError> {
        self.documents
            .get(source)
            .cloned()
            .ok_or_else(|| LoaderError::exec(format!("no document registered for {}", source)))
    }
}

/// Parses its source string as a YAML document.
///
/// Only accepts inline content: a source with a line break, a `key: value`
/// pair, or a leading `{` or `[`. Remote URLs are left to [`FetchUrls`] even
/// when this loader is registered first.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseYaml;

#[async_trait]
impl Loader for ParseYaml {
    fn name(&self) -> &str {
        "yaml"
    }

    fn validate(&self, source: &str) -> bool {
        if is_remote_url(source) {
            return false;
        }
        let trimmed = source.trim_start();
        source.contains('\n')
            || source.contains(": ")
            || trimmed.starts_with('{')
            || trimmed.starts_with('[')
    }

    async fn exec(&self, source: &str) -> Result<Value, LoaderError> {
        parse_document("inline document", source)
    }

    fn inline(&self) -> bool {
        true
    }
}

/// JSON first, YAML when that fails.
///
/// YAML goes through `serde_yaml::Value` so that non-string keys such as
/// status codes become JSON strings.
pub(crate) fn parse_document(source: &str, content: &str) -> Result<Value, LoaderError> {
    let json_error = match serde_json::from_str(content) {
        Ok(document) => return Ok(document),
        Err(err) => err,
    };
    let invalid = |message: String| LoaderError::InvalidDocument {
        source_ref: source.to_string(),
        message,
    };
    if content.trim_start().starts_with(['{', '[']) {
        // flow-style YAML is rare; keep the JSON diagnostics
        if let Ok(document) = serde_yaml::from_str::<serde_yaml::Value>(content) {
            return serde_json::to_value(document).map_err(|err| invalid(err.to_string()));
        }
        return Err(invalid(json_error.to_string()));
    }
    let document: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|err| invalid(err.to_string()))?;
    serde_json::to_value(document).map_err(|err| invalid(err.to_string()))
}

/// Ordered set of loaders.
#[derive(Clone, Default)]
pub struct LoaderRegistry {
    loaders: Vec<Arc<dyn Loader>>,
}

impl LoaderRegistry {
    /// An empty registry; nothing can be loaded until loaders are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Files, plus URLs when the `remote` feature is enabled.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        #[cfg(feature = "remote")]
        let registry = registry.with(FetchUrls::new());
        registry.with(ReadFiles)
    }

    /// Append a loader; it is tried after every loader added before it.
    pub fn with(mut self, loader: impl Loader + 'static) -> Self {
        self.loaders.push(Arc::new(loader));
        self
    }

    pub fn register(&mut self, loader: Arc<dyn Loader>) {
        self.loaders.push(loader);
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    /// The first loader that accepts `source`.
    pub fn find(&self, source: &str) -> Option<Arc<dyn Loader>> {
        self.loaders.iter().find(|l| l.validate(source)).cloned()
    }

    /// Load a document directly, outside any bundling session.
    pub async fn load(&self, source: &str) -> Result<Value, BundleError> {
        let loader = self.find(source).ok_or_else(|| BundleError::NoMatchingLoader {
            source_ref: source.to_string(),
        })?;
        debug!(source, loader = loader.name(), "loading document");
        loader.exec(source).await.map_err(|error| BundleError::Load {
            source_ref: source.to_string(),
            error,
        })
    }
}

impl fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.loaders.iter().map(|l| l.name()))
            .finish()
    }
}

/// A fetch whose result every waiter shares.
pub type SharedFetch = Shared<LocalBoxFuture<'static, Result<Value, LoaderError>>>;

/// Session-scoped memo of in-flight and finished fetches, keyed by location.
///
/// Not `Sync`: a session runs on one task, and concurrency comes from awaiting
/// several shared fetches together, not from threads.
#[derive(Default)]
pub struct ResolutionCache {
    entries: RefCell<HashMap<String, SharedFetch>>,
    fetches: Cell<usize>,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The fetch for `location`, started with `loader` if this is the first request.
    pub fn fetch(&self, location: &str, loader: Arc<dyn Loader>) -> SharedFetch {
        if let Some(existing) = self.entries.borrow().get(location) {
            debug!(location, "resolution cache hit");
            return existing.clone();
        }

        debug!(location, loader = loader.name(), "fetching");
        self.fetches.set(self.fetches.get() + 1);
        let owned = location.to_string();
        let fetch = async move { loader.exec(&owned).await }
            .boxed_local()
            .shared();
        self.entries
            .borrow_mut()
            .insert(location.to_string(), fetch.clone());
        fetch
    }

    pub fn contains(&self, location: &str) -> bool {
        self.entries.borrow().contains_key(location)
    }

    /// Drop the entry for `location` so the next request fetches it again.
    pub fn forget(&self, location: &str) -> bool {
        self.entries.borrow_mut().remove(location).is_some()
    }

    /// Every location requested so far.
    pub fn locations(&self) -> Vec<String> {
        self.entries.borrow().keys().cloned().collect()
    }

    /// Number of fetches started (cache misses).
    pub fn fetch_count(&self) -> usize {
        self.fetches.get()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl fmt::Debug for ResolutionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionCache")
            .field("locations", &self.entries.borrow().keys().collect::<Vec<_>>())
            .field("fetches", &self.fetches.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Loader for Counting {
        fn validate(&self, _source: &str) -> bool {
            true
        }

        async fn exec(&self, source: &str) -> Result<Value, LoaderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(json!({ "source": source }))
        }
    }

    #[test]
    fn read_files_rejects_urls_and_local_refs() {
        assert!(ReadFiles.validate("schemas/user.json"));
        assert!(ReadFiles.validate("/abs/user.json"));
        assert!(!ReadFiles.validate("https://example.com/a.json"));
        assert!(!ReadFiles.validate("#/components"));
        assert!(!ReadFiles.validate(""));
    }

    #[test]
    fn parse_yaml_takes_content_not_locations() {
        assert!(ParseYaml.validate("openapi: 3.1.0"));
        assert!(ParseYaml.validate("a:\n  b: 1\n"));
        assert!(ParseYaml.validate("{\"a\": 1}"));
        assert!(!ParseYaml.validate("schemas/user.yaml"));
        assert!(!ParseYaml.validate("https://example.com/a.yaml"));
        assert!(ParseYaml.inline());
        assert!(!ReadFiles.inline());
    }

    #[test]
    fn documents_fall_back_to_yaml() {
        let yaml = "paths:\n  /pets:\n    get:\n      responses:\n        200:\n          description: ok\n";
        let document = parse_document("api.yaml", yaml).unwrap();
        assert_eq!(
            document["paths"]["/pets"]["get"]["responses"]["200"]["description"],
            "ok"
        );

        assert_eq!(parse_document("a.json", "{\"a\": 1}").unwrap(), json!({ "a": 1 }));
        let err = parse_document("a.json", "{\"a\": ").unwrap_err();
        assert!(matches!(err, LoaderError::InvalidDocument { ref source_ref, .. } if source_ref == "a.json"));
    }

    #[tokio::test]
    async fn yaml_files_are_read() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pet.yaml");
        std::fs::write(&path, "type: object\nrequired:\n  - name\n").unwrap();

        let document = ReadFiles.exec(path.to_str().unwrap()).await.unwrap();
        assert_eq!(document, json!({ "type": "object", "required": ["name"] }));
    }

    #[test]
    fn registry_first_match_wins() {
        let registry = LoaderRegistry::new()
            .with(MemoryLoader::new().with("a.json", json!({ "from": "memory" })))
            .with(ReadFiles);

        assert_eq!(registry.find("a.json").map(|l| l.name().to_string()), Some("memory".into()));
        assert_eq!(registry.find("b.json").map(|l| l.name().to_string()), Some("files".into()));
        assert!(registry.find("#/a").is_none());
        assert_eq!(format!("{:?}", registry), "[\"memory\", \"files\"]");
    }

    #[tokio::test]
    async fn registry_load_errors() {
        let registry = LoaderRegistry::new().with(ReadFiles);
        assert!(matches!(
            registry.load("#/a").await,
            Err(BundleError::NoMatchingLoader { .. })
        ));
        assert!(matches!(
            registry.load("/nonexistent/schema.json").await,
            Err(BundleError::Load {
                error: LoaderError::FileNotFound { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn cache_is_single_flight() {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader: Arc<dyn Loader> = Arc::new(Counting {
            calls: calls.clone(),
        });
        let cache = ResolutionCache::new();

        let pending: Vec<_> = (0..10).map(|_| cache.fetch("a.json", loader.clone())).collect();
        let results = futures::future::join_all(pending).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.fetch_count(), 1);
        assert!(results
            .iter()
            .all(|r| r.as_ref().ok() == Some(&json!({ "source": "a.json" }))));

        // finished fetches are still shared
        cache.fetch("a.json", loader.clone()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.locations(), vec!["a.json".to_string()]);

        assert!(cache.forget("a.json"));
        cache.fetch("a.json", loader.clone()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!cache.forget("b.json"));
    }
}
