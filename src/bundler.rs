//! Bundling external references into a single document.
//!
//! External `$ref`s are fetched through the [`LoaderRegistry`], stored once under
//! `x-ext/<hash>` at the document root, and rewritten to point there. Documents
//! brought in this way are traversed in turn, so chains of external references
//! resolve in a single call to [`Bundler::bundle`].
//!
//! Each node goes through the status protocol: `$status: "loading"` while its
//! fetch is pending, removed on success, `"error"` on failure. A failure never
//! stops the bundle; the original `$ref` is kept so a later call can retry it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::error::{BundleError, LoaderError, NodeError};
use crate::loader::{Loader, LoaderRegistry, ResolutionCache};
use crate::pointer::{parse_pointer, prefix_internal_ref, resolve_reference_path, split_ref, to_pointer};
use crate::resolver::{navigate, ReferenceResolver, SchemaIndexer};
use crate::types::{
    schema_id, BundleOptions, ResolutionContext, EXTERNAL_KEY, EXTERNAL_URLS_KEY, GLOBAL_KEY,
    REF_KEY, STATUS_KEY,
};

const EXTERNAL_VALUE_KEY: &str = "externalValue";
const VALUE_KEY: &str = "value";

/// Key under `x-ext` for a document location: the first 7 hex digits of its
/// SHA-256.
pub fn location_hash(location: &str) -> String {
    let digest = hex::encode(Sha256::digest(location.as_bytes()));
    digest[..7].to_string()
}

/// Where a lifecycle hook fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    ResolveStart,
    ResolveError,
    ResolveSuccess,
    BeforeNodeProcess,
    AfterNodeProcess,
}

/// The node a hook is called for, within the document being bundled.
///
/// Hooks get the whole document: the node, its parent and the root are all
/// reachable, addressed by `path`.
pub struct NodeContext<'a> {
    root: &'a mut Value,
    /// Raw segments from the bundle root to the node.
    pub path: &'a [String],
    /// Nodes at or above this depth report no parent. Non-zero for the entry
    /// of a partial bundle.
    detached: usize,
    /// Location relative references of this node resolve against.
    pub origin: Option<&'a str>,
    /// Nearest enclosing `$id`.
    pub context: &'a str,
    pub resolution_cache: &'a ResolutionCache,
    pub loaders: &'a LoaderRegistry,
}

static NULL: Value = Value::Null;

impl NodeContext<'_> {
    /// The node, or `null` when an earlier hook removed it.
    pub fn node(&self) -> &Value {
        node_at(self.root, self.path).unwrap_or(&NULL)
    }

    pub fn node_mut(&mut self) -> Option<&mut Value> {
        node_at_mut(self.root, self.path)
    }

    /// The node holding this one. `None` at the bundle root and at the entry
    /// of a partial bundle.
    pub fn parent(&self) -> Option<&Value> {
        if self.path.len() <= self.detached {
            return None;
        }
        node_at(self.root, self.parent_path())
    }

    /// The document being bundled.
    pub fn root(&self) -> &Value {
        self.root
    }

    pub fn parent_path(&self) -> &[String] {
        match self.path.split_last() {
            Some((_, parent)) => parent,
            None => &[],
        }
    }

    pub fn pointer(&self) -> String {
        crate::pointer::to_pointer(self.path)
    }
}

/// Hooks into the bundling pipeline. Every method defaults to doing nothing.
///
/// Hooks may mutate the node they are called for but cannot change traversal
/// order.
pub trait LifecyclePlugin {
    /// After the node is tagged `loading`, before its fetch starts.
    fn on_resolve_start(&self, _ctx: &mut NodeContext<'_>) {}

    fn on_resolve_error(&self, _ctx: &mut NodeContext<'_>, _error: &NodeError) {}

    fn on_resolve_success(&self, _ctx: &mut NodeContext<'_>) {}

    /// Before the node's `$ref` is inspected and before its children.
    fn on_before_node_process(&self, _ctx: &mut NodeContext<'_>) {}

    /// Once the node's subtree has been visited and the node's own `$ref` or
    /// `externalValue` has been resolved (or has failed).
    fn on_after_node_process(&self, _ctx: &mut NodeContext<'_>) {}
}

/// A closure bound to one lifecycle event. See [`hook`].
pub struct Hook<F> {
    event: LifecycleEvent,
    f: F,
}

/// Turn a closure into a plugin that fires on a single event.
pub fn hook<F>(event: LifecycleEvent, f: F) -> Hook<F>
where
    F: Fn(&mut NodeContext<'_>),
{
    Hook { event, f }
}

impl<F> Hook<F>
where
    F: Fn(&mut NodeContext<'_>),
{
    fn fire(&self, event: LifecycleEvent, ctx: &mut NodeContext<'_>) {
        if self.event == event {
            (self.f)(ctx);
        }
    }
}

impl<F> LifecyclePlugin for Hook<F>
where
    F: Fn(&mut NodeContext<'_>),
{
    fn on_resolve_start(&self, ctx: &mut NodeContext<'_>) {
        self.fire(LifecycleEvent::ResolveStart, ctx);
    }

    fn on_resolve_error(&self, ctx: &mut NodeContext<'_>, _error: &NodeError) {
        self.fire(LifecycleEvent::ResolveError, ctx);
    }

    fn on_resolve_success(&self, ctx: &mut NodeContext<'_>) {
        self.fire(LifecycleEvent::ResolveSuccess, ctx);
    }

    fn on_before_node_process(&self, ctx: &mut NodeContext<'_>) {
        self.fire(LifecycleEvent::BeforeNodeProcess, ctx);
    }

    fn on_after_node_process(&self, ctx: &mut NodeContext<'_>) {
        self.fire(LifecycleEvent::AfterNodeProcess, ctx);
    }
}

/// A node that could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFailure {
    /// Pointer of the node within the bundled document.
    pub pointer: String,
    /// The reference as written.
    pub reference: String,
    pub message: String,
}

/// Outcome of a bundling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleReport {
    /// Nodes successfully resolved.
    pub resolved: usize,
    /// Loader executions (one per distinct location).
    pub fetched: usize,
    pub failures: Vec<BundleFailure>,
    /// References no loader accepted; left untouched.
    pub unmatched: Vec<String>,
    /// Pointers of references not followed because of `max_depth`.
    pub depth_limited: Vec<String>,
}

impl BundleReport {
    /// True when every external reference was resolved.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.unmatched.is_empty() && self.depth_limited.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Ref,
    ExternalValue,
}

impl RequestKind {
    fn target_key(self) -> &'static str {
        match self {
            RequestKind::Ref => REF_KEY,
            RequestKind::ExternalValue => VALUE_KEY,
        }
    }
}

/// Where a node sits, as hooks see it.
#[derive(Clone, Copy)]
struct Site<'a> {
    path: &'a [String],
    origin: Option<&'a str>,
    context: &'a str,
    detached: usize,
}

/// A visited node whose after-hook waits for the round's fetches.
struct Visited {
    path: Vec<String>,
    origin: Option<String>,
    context: String,
    detached: usize,
}

impl Visited {
    fn site(&self) -> Site<'_> {
        Site {
            path: &self.path,
            origin: self.origin.as_deref(),
            context: &self.context,
            detached: self.detached,
        }
    }
}

/// A node waiting on a fetch.
struct Request {
    kind: RequestKind,
    path: Vec<String>,
    reference: String,
    location: String,
    fragment: String,
    loader: Arc<dyn Loader>,
    depth: usize,
    /// The node carries `$global: true`.
    global: bool,
    visited: Visited,
}

/// A subtree traversed in one round: the root document, the entry of a
/// partial bundle, a subtree it depends on, or a document mounted under
/// `x-ext`.
struct Scope {
    segments: Vec<String>,
    origin: Option<String>,
    depth: usize,
    /// Set for freshly mounted documents, whose local refs must be moved under
    /// their mount point.
    prefix: Option<String>,
    anchors: ReferenceResolver,
    detached: usize,
    /// Reached through a local `$ref`; skipped when already traversed.
    dependency: bool,
}

impl Scope {
    fn root(origin: Option<String>) -> Self {
        Self::entry(Vec::new(), origin)
    }

    fn entry(segments: Vec<String>, origin: Option<String>) -> Self {
        Self {
            detached: segments.len(),
            segments,
            origin,
            depth: 0,
            prefix: None,
            anchors: ReferenceResolver::default(),
            dependency: false,
        }
    }

    fn dependency(segments: Vec<String>, origin: Option<String>) -> Self {
        Self {
            detached: 0,
            dependency: true,
            ..Self::entry(segments, origin)
        }
    }

    fn mounted(hash: &str, location: &str, depth: usize, document: &Value, global: bool) -> Self {
        let prefix = (!global).then(|| format!("#/{}/{}", EXTERNAL_KEY, hash));
        Self {
            segments: vec![EXTERNAL_KEY.to_string(), hash.to_string()],
            origin: Some(location.to_string()),
            depth,
            anchors: match prefix {
                Some(_) => index_document(document, location),
                None => ReferenceResolver::default(),
            },
            prefix,
            detached: 0,
            dependency: false,
        }
    }

    fn start(&self) -> ResolutionContext {
        ResolutionContext {
            path: self.segments.clone(),
            context: self.origin.clone().unwrap_or_default(),
        }
    }

    fn site<'a>(&'a self, rc: &'a ResolutionContext) -> Site<'a> {
        Site {
            path: &rc.path,
            origin: self.origin.as_deref(),
            context: &rc.context,
            detached: self.detached,
        }
    }

    fn visited(&self, rc: &ResolutionContext) -> Visited {
        Visited {
            path: rc.path.clone(),
            origin: self.origin.clone(),
            context: rc.context.clone(),
            detached: self.detached,
        }
    }

    /// Rewrite a local reference of a mounted document to its bundled location.
    fn localize(&self, reference: &str, context: &str) -> Option<String> {
        let prefix = self.prefix.as_deref()?;
        let (_, fragment) = split_ref(reference);
        if fragment.is_empty() || fragment.starts_with('/') {
            return prefix_internal_ref(reference, prefix).ok();
        }
        let path = self.anchors.canonicalize(reference, context).ok()?;
        Some(join_mount(prefix, &path))
    }
}

fn join_mount(prefix: &str, path: &str) -> String {
    if path.is_empty() {
        prefix.to_string()
    } else {
        format!("{}/{}", prefix, path)
    }
}

fn index_document(document: &Value, location: &str) -> ReferenceResolver {
    let mut indexer = SchemaIndexer::new();
    indexer.register(location, "").index(document, location);
    indexer.finish()
}

fn mounted_document<'v>(root: &'v Value, hash: &str) -> Option<&'v Value> {
    root.get(EXTERNAL_KEY).and_then(|ext| ext.get(hash))
}

fn node_at<'v>(root: &'v Value, path: &[String]) -> Option<&'v Value> {
    path.iter().try_fold(root, |node, segment| match node {
        Value::Object(members) => members.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get(index)),
        _ => None,
    })
}

fn node_at_mut<'v>(root: &'v mut Value, path: &[String]) -> Option<&'v mut Value> {
    path.iter().try_fold(root, |node, segment| match node {
        Value::Object(members) => members.get_mut(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(move |index| items.get_mut(index)),
        _ => None,
    })
}

/// Store `document` under `x-ext/<hash>` (and its location under `x-ext-urls`).
fn mount(root: &mut Value, hash: &str, document: Value, location: &str, url_map: bool) -> Result<(), NodeError> {
    let root = root.as_object_mut().ok_or(NodeError::NoMountPoint)?;
    let mut insert = |key: &str, value: Value| -> Result<(), NodeError> {
        root.entry(key)
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or(NodeError::NoMountPoint)?
            .insert(hash.to_string(), value);
        Ok(())
    };
    insert(EXTERNAL_KEY, document)?;
    if url_map {
        insert(EXTERNAL_URLS_KEY, Value::String(location.to_string()))?;
    }
    Ok(())
}

/// Per-round traversal state.
struct Pass<'s> {
    cache: &'s ResolutionCache,
    requests: Vec<Request>,
    /// Post-order, so children come before their parent.
    visited: Vec<Visited>,
    /// Targets of local pointer refs, in the order they were seen.
    dependencies: Vec<Vec<String>>,
    report: &'s mut BundleReport,
}

impl<'s> Pass<'s> {
    fn new(cache: &'s ResolutionCache, report: &'s mut BundleReport) -> Self {
        Self {
            cache,
            requests: Vec::new(),
            visited: Vec::new(),
            dependencies: Vec::new(),
            report,
        }
    }

    /// Queue the target of a local pointer ref. Anchors and refs into `x-ext`
    /// are not followed.
    fn follow(&mut self, reference: &str) {
        let (_, fragment) = split_ref(reference);
        if !fragment.is_empty() && !fragment.starts_with('/') {
            return;
        }
        let segments = parse_pointer(fragment);
        if segments.first().map(String::as_str) != Some(EXTERNAL_KEY) {
            self.dependencies.push(segments);
        }
    }
}

/// Resolves external references of a document through a [`LoaderRegistry`].
pub struct Bundler {
    loaders: LoaderRegistry,
    plugins: Vec<Box<dyn LifecyclePlugin>>,
    options: BundleOptions,
}

impl Bundler {
    pub fn new(loaders: LoaderRegistry) -> Self {
        Self {
            loaders,
            plugins: Vec::new(),
            options: BundleOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BundleOptions) -> Self {
        self.options = options;
        self
    }

    /// Add a lifecycle plugin. Plugins run in registration order.
    pub fn plugin(mut self, plugin: impl LifecyclePlugin + 'static) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    pub fn options(&self) -> &BundleOptions {
        &self.options
    }

    pub fn loaders(&self) -> &LoaderRegistry {
        &self.loaders
    }

    /// Bundle `root` in place.
    ///
    /// Never fails as a whole: nodes that cannot be resolved are tagged
    /// `$status: "error"` and listed in the report. Calling `bundle` again on
    /// the same document retries them with a fresh cache.
    #[instrument(skip_all, fields(origin = ?self.options.origin))]
    pub async fn bundle(&self, root: &mut Value) -> BundleReport {
        self.bundle_with_cache(root, &ResolutionCache::new()).await
    }

    /// Bundle `root` in place, sharing `cache` with other calls.
    ///
    /// Locations fetched by an earlier call are not fetched again, and failed
    /// fetches are dropped from the cache so they can be retried.
    #[instrument(skip_all, fields(origin = ?self.options.origin))]
    pub async fn bundle_with_cache(&self, root: &mut Value, cache: &ResolutionCache) -> BundleReport {
        self.run(root, self.options.origin.clone(), None, cache).await
    }

    /// Bundle only the subtree at `pointer` (`#/a/b` or `/a/b`), mounting what
    /// it references at the root of `root`.
    ///
    /// Local refs reached from the subtree are bundled too. Other parts of the
    /// document are left alone. `x-ext-urls` is always written so that later
    /// partial calls know where each mounted document came from.
    #[instrument(skip(self, root, cache))]
    pub async fn bundle_partial(&self, root: &mut Value, pointer: &str, cache: &ResolutionCache) -> BundleReport {
        let entry = parse_pointer(pointer);
        if node_at(root, &entry).is_none() {
            warn!(pointer, "nothing to bundle at pointer");
            return BundleReport::default();
        }
        self.run(root, self.options.origin.clone(), Some(entry), cache).await
    }

    /// Load `source` through the registry and bundle it, with `source` as the
    /// origin for relative references unless it is inline content.
    #[instrument(skip(self))]
    pub async fn bundle_source(&self, source: &str) -> Result<(Value, BundleReport), BundleError> {
        let mut document = self.loaders.load(source).await?;
        let inline = self.loaders.find(source).is_some_and(|loader| loader.inline());
        let origin = match &self.options.origin {
            Some(origin) => Some(origin.clone()),
            None if inline => None,
            None => Some(source.to_string()),
        };
        let report = self.run(&mut document, origin, None, &ResolutionCache::new()).await;
        Ok((document, report))
    }

    async fn run(
        &self,
        root: &mut Value,
        origin: Option<String>,
        entry: Option<Vec<String>>,
        cache: &ResolutionCache,
    ) -> BundleReport {
        let started = cache.fetch_count();
        let mut report = BundleReport::default();
        let url_map = self.options.url_map || entry.is_some();

        let mut scopes = match entry {
            Some(segments) => vec![Scope::entry(segments, origin.clone())],
            None => {
                let mut scopes = vec![Scope::root(origin.clone())];
                scopes.extend(existing_mounts(root, origin.as_deref(), cache));
                scopes
            }
        };
        let mut traversed: Vec<Vec<String>> = Vec::new();

        while !scopes.is_empty() {
            let mut pass = Pass::new(cache, &mut report);
            for scope in &scopes {
                if scope.dependency && traversed.iter().any(|done| scope.segments.starts_with(done)) {
                    continue;
                }
                traversed.push(scope.segments.clone());
                self.visit(root, &scope.start(), scope, &mut pass);
            }
            let Pass {
                requests,
                visited,
                dependencies,
                ..
            } = pass;

            let results = fetch_all(root, &requests, cache).await;
            let mut next = self.apply(root, requests, &results, cache, url_map, &mut report);
            for node in &visited {
                self.fire(root, node.site(), cache, |plugin, ctx| plugin.on_after_node_process(ctx));
            }

            next.extend(
                dependencies
                    .into_iter()
                    .map(|segments| Scope::dependency(segments, origin.clone())),
            );
            scopes = next;
        }

        if self.options.tree_shake {
            tree_shake(root);
        }

        report.fetched = cache.fetch_count() - started;
        debug!(
            resolved = report.resolved,
            fetched = report.fetched,
            failures = report.failures.len(),
            "bundle finished"
        );
        report
    }

    /// Run every plugin's hook for the node at `site`, if it still exists.
    fn fire<F>(&self, root: &mut Value, site: Site<'_>, cache: &ResolutionCache, event: F)
    where
        F: Fn(&dyn LifecyclePlugin, &mut NodeContext<'_>),
    {
        if self.plugins.is_empty() || node_at(root, site.path).is_none() {
            return;
        }
        let mut ctx = NodeContext {
            root,
            path: site.path,
            detached: site.detached,
            origin: site.origin,
            context: site.context,
            resolution_cache: cache,
            loaders: &self.loaders,
        };
        for plugin in &self.plugins {
            event(plugin.as_ref(), &mut ctx);
        }
    }

    fn visit(&self, root: &mut Value, rc: &ResolutionContext, scope: &Scope, pass: &mut Pass<'_>) {
        match node_at(root, &rc.path) {
            Some(Value::Object(_)) => self.visit_object(root, rc, scope, pass),
            Some(Value::Array(items)) => {
                for index in 0..items.len() {
                    self.visit(root, &rc.child(index.to_string()), scope, pass);
                }
            }
            _ => {}
        }
    }

    fn visit_object(&self, root: &mut Value, parent: &ResolutionContext, scope: &Scope, pass: &mut Pass<'_>) {
        let rc = match node_at(root, &parent.path) {
            Some(node) => parent.enter(node),
            None => return,
        };
        self.fire(root, scope.site(&rc), pass.cache, |plugin, ctx| {
            plugin.on_before_node_process(ctx)
        });

        let Some(node) = node_at_mut(root, &rc.path) else {
            return;
        };
        if let Some(reference) = node.get(REF_KEY).and_then(Value::as_str).map(str::to_string) {
            let (base, _) = split_ref(&reference);
            if base.is_empty() {
                match scope.localize(&reference, &rc.context) {
                    Some(rewritten) => {
                        pass.follow(&rewritten);
                        node[REF_KEY] = Value::String(rewritten);
                    }
                    None => pass.follow(&reference),
                }
            } else {
                self.schedule(root, RequestKind::Ref, &reference, &rc, scope, pass);
            }
        }

        let keys: Vec<String> = match node_at(root, &rc.path) {
            Some(Value::Object(members)) => members
                .keys()
                // earlier bundles are traversed as their own scopes
                .filter(|key| !(rc.path.is_empty() && (*key == EXTERNAL_KEY || *key == EXTERNAL_URLS_KEY)))
                .cloned()
                .collect(),
            _ => Vec::new(),
        };
        for key in keys {
            self.visit(root, &rc.child(key), scope, pass);
        }

        if self.options.external_values {
            let reference = node_at(root, &rc.path)
                .filter(|node| node.get(VALUE_KEY).is_none())
                .and_then(|node| node.get(EXTERNAL_VALUE_KEY))
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(reference) = reference {
                self.schedule(root, RequestKind::ExternalValue, &reference, &rc, scope, pass);
            }
        }

        if !self.plugins.is_empty() {
            pass.visited.push(scope.visited(&rc));
        }
    }

    /// Tag the node as loading and queue its fetch.
    fn schedule(
        &self,
        root: &mut Value,
        kind: RequestKind,
        reference: &str,
        rc: &ResolutionContext,
        scope: &Scope,
        pass: &mut Pass<'_>,
    ) {
        if scope.depth >= self.options.max_depth {
            let pointer = rc.pointer();
            warn!(%pointer, reference, depth = scope.depth, "external documents nested too deep, not following");
            pass.report.depth_limited.push(pointer);
            return;
        }

        let (base, fragment) = split_ref(reference);
        let location = resolve_reference_path(scope.origin.as_deref(), base);
        let Some(loader) = self.loaders.find(&location) else {
            debug!(pointer = %rc.pointer(), reference, "no loader accepts reference, leaving it as is");
            pass.report.unmatched.push(reference.to_string());
            return;
        };

        let Some(Value::Object(members)) = node_at_mut(root, &rc.path) else {
            return;
        };
        let global = kind == RequestKind::Ref && members.get(GLOBAL_KEY) == Some(&Value::Bool(true));
        members.insert(STATUS_KEY.to_string(), Value::String("loading".to_string()));
        self.fire(root, scope.site(rc), pass.cache, |plugin, ctx| plugin.on_resolve_start(ctx));

        pass.requests.push(Request {
            kind,
            path: rc.path.clone(),
            reference: reference.to_string(),
            location,
            fragment: fragment.to_string(),
            loader,
            depth: scope.depth,
            global,
            visited: scope.visited(rc),
        });
    }

    /// Write fetched results back into their nodes. Returns the scopes of
    /// documents mounted in this round.
    fn apply(
        &self,
        root: &mut Value,
        requests: Vec<Request>,
        results: &HashMap<String, Result<Value, LoaderError>>,
        cache: &ResolutionCache,
        url_map: bool,
        report: &mut BundleReport,
    ) -> Vec<Scope> {
        let mut mounted = Vec::new();

        for request in requests {
            let outcome = match request.kind {
                RequestKind::Ref => self.merge(root, &request, results, url_map, &mut mounted),
                RequestKind::ExternalValue => fetched(results, &request.location)
                    .and_then(|document| extract(document, &request.fragment)),
            };

            let Some(Value::Object(members)) = node_at_mut(root, &request.path) else {
                continue;
            };
            let site = request.visited.site();
            match outcome {
                Ok(value) => {
                    members.insert(request.kind.target_key().to_string(), value);
                    members.shift_remove(STATUS_KEY);
                    report.resolved += 1;
                    self.fire(root, site, cache, |plugin, ctx| plugin.on_resolve_success(ctx));
                }
                Err(error) => {
                    let pointer = to_pointer(&request.path);
                    warn!(%pointer, reference = %request.reference, %error, "failed to resolve");
                    members.insert(STATUS_KEY.to_string(), Value::String("error".to_string()));
                    self.fire(root, site, cache, |plugin, ctx| plugin.on_resolve_error(ctx, &error));
                    report.failures.push(BundleFailure {
                        pointer,
                        reference: request.reference.clone(),
                        message: error.to_string(),
                    });
                }
            }
        }

        mounted
    }

    /// Mount the referenced document (once) and compute the rewritten `$ref`.
    fn merge(
        &self,
        root: &mut Value,
        request: &Request,
        results: &HashMap<String, Result<Value, LoaderError>>,
        url_map: bool,
        mounted: &mut Vec<Scope>,
    ) -> Result<Value, NodeError> {
        let hash = location_hash(&request.location);
        if mounted_document(root, &hash).is_none() {
            let document = fetched(results, &request.location)?;
            let scope = Scope::mounted(&hash, &request.location, request.depth + 1, &document, request.global);
            mount(root, &hash, document, &request.location, url_map)?;
            mounted.push(scope);
        }

        let prefix = format!("#/{}/{}", EXTERNAL_KEY, hash);
        let fragment = request.fragment.as_str();
        if fragment.is_empty() || fragment.starts_with('/') {
            return Ok(Value::String(format!("{}{}", prefix, fragment)));
        }

        // bare anchor: find it in the mounted document
        let document = mounted_document(root, &hash).ok_or(NodeError::NoMountPoint)?;
        let anchors = index_document(document, &request.location);
        let scope_id = schema_id(document).unwrap_or(&request.location);
        let path = anchors.canonicalize(&format!("#{}", fragment), scope_id)?;
        Ok(Value::String(join_mount(&prefix, &path)))
    }
}

impl fmt::Debug for Bundler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundler")
            .field("loaders", &self.loaders)
            .field("plugins", &self.plugins.len())
            .field("options", &self.options)
            .finish()
    }
}

fn fetched(results: &HashMap<String, Result<Value, LoaderError>>, location: &str) -> Result<Value, NodeError> {
    match results.get(location) {
        Some(Ok(document)) => Ok(document.clone()),
        Some(Err(error)) => Err(error.clone().into()),
        None => Err(LoaderError::exec(format!("no result for {}", location)).into()),
    }
}

fn extract(document: Value, fragment: &str) -> Result<Value, NodeError> {
    if !fragment.starts_with('/') {
        return Ok(document);
    }
    navigate(&document, fragment)
        .cloned()
        .ok_or_else(|| crate::error::ReferenceError::PointerNotFound {
            pointer: fragment.to_string(),
        }
        .into())
}

/// Start every fetch of a round at once; each location at most once.
///
/// Failed locations are dropped from the cache afterwards so a later call
/// sharing it retries them.
async fn fetch_all(
    root: &Value,
    requests: &[Request],
    cache: &ResolutionCache,
) -> HashMap<String, Result<Value, LoaderError>> {
    let mut seen = HashSet::new();
    let mut pending = Vec::new();

    for request in requests {
        if request.kind == RequestKind::Ref
            && mounted_document(root, &location_hash(&request.location)).is_some()
        {
            continue;
        }
        if seen.insert(request.location.as_str()) {
            let fetch = cache.fetch(&request.location, request.loader.clone());
            let location = request.location.clone();
            pending.push(async move { (location, fetch.await) });
        }
    }

    let results: HashMap<_, _> = join_all(pending).await.into_iter().collect();
    for (location, result) in &results {
        if result.is_err() {
            cache.forget(location);
        }
    }
    results
}

/// Scopes for documents mounted by an earlier bundle of the same root.
///
/// Their local refs were already moved under the mount point, so they are not
/// prefixed again. Their origin comes from `x-ext-urls`, then from a cached
/// location with the same hash. Failing both, the root origin is used and a
/// warning is logged, since relative refs inside may then resolve wrongly.
fn existing_mounts(root: &Value, origin: Option<&str>, cache: &ResolutionCache) -> Vec<Scope> {
    let Some(Value::Object(ext)) = root.get(EXTERNAL_KEY) else {
        return Vec::new();
    };
    let urls = root.get(EXTERNAL_URLS_KEY);
    let cached = cache.locations();

    ext.keys()
        .map(|hash| {
            let recorded = urls
                .and_then(|u| u.get(hash))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| cached.iter().find(|location| location_hash(location) == *hash).cloned());
            let origin = recorded.or_else(|| {
                warn!(hash = %hash, "no recorded location for mounted document, resolving its refs against the root origin");
                origin.map(str::to_string)
            });
            Scope {
                depth: 1,
                detached: 0,
                ..Scope::entry(vec![EXTERNAL_KEY.to_string(), hash.clone()], origin)
            }
        })
        .collect()
}

/// Which parts of a mounted document are referenced.
#[derive(Debug, Default)]
struct Keep {
    all: bool,
    children: HashMap<String, Keep>,
}

impl Keep {
    /// Mark `path` as kept. False when it already was.
    fn insert(&mut self, path: &[String]) -> bool {
        if self.all {
            return false;
        }
        match path.split_first() {
            None => {
                self.all = true;
                self.children.clear();
                true
            }
            Some((first, rest)) => self.children.entry(first.clone()).or_default().insert(rest),
        }
    }

    fn prune(&self, value: &mut Value) {
        if self.all {
            return;
        }
        // array indices are referenced positionally, so arrays stay whole
        if let Value::Object(members) = value {
            members.retain(|key, _| self.children.contains_key(key));
            for (key, child) in members.iter_mut() {
                if let Some(keep) = self.children.get(key) {
                    keep.prune(child);
                }
            }
        }
    }
}

/// Segments of every `#/x-ext/...` ref in `value`.
fn collect_mount_refs(value: &Value, found: &mut Vec<Vec<String>>) {
    match value {
        Value::Object(members) => {
            if let Some(reference) = members.get(REF_KEY).and_then(Value::as_str) {
                let (base, fragment) = split_ref(reference);
                let segments = parse_pointer(fragment);
                if base.is_empty() && segments.len() >= 2 && segments[0] == EXTERNAL_KEY {
                    found.push(segments);
                }
            }
            for child in members.values() {
                collect_mount_refs(child, found);
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_mount_refs(item, found)),
        _ => {}
    }
}

/// Remove whatever no ref reaches from the documents under `x-ext`, starting
/// from the refs in the rest of the document. Unreferenced documents go
/// entirely, along with their `x-ext-urls` entries.
fn tree_shake(root: &mut Value) {
    let Value::Object(members) = &*root else {
        return;
    };
    let mut pending = Vec::new();
    for (key, child) in members {
        if key != EXTERNAL_KEY && key != EXTERNAL_URLS_KEY {
            collect_mount_refs(child, &mut pending);
        }
    }

    let mut keep: HashMap<String, Keep> = HashMap::new();
    while let Some(segments) = pending.pop() {
        let hash = &segments[1];
        if !keep.entry(hash.clone()).or_default().insert(&segments[2..]) {
            continue;
        }
        if let Some(target) = node_at(root, &segments) {
            collect_mount_refs(target, &mut pending);
        }
    }

    if let Some(Value::Object(ext)) = root.get_mut(EXTERNAL_KEY) {
        ext.retain(|hash, _| keep.contains_key(hash));
        for (hash, document) in ext.iter_mut() {
            if let Some(keep) = keep.get(hash) {
                keep.prune(document);
            }
        }
        debug!(kept = ext.len(), "tree shaken");
    }
    if let Some(Value::Object(urls)) = root.get_mut(EXTERNAL_URLS_KEY) {
        urls.retain(|hash, _| keep.contains_key(hash));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemoryLoader;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn bundler(loader: MemoryLoader) -> Bundler {
        Bundler::new(LoaderRegistry::new().with(loader))
    }

    #[test]
    fn location_hash_is_short_and_stable() {
        let hash = location_hash("https://example.com/a.json");
        assert_eq!(hash.len(), 7);
        assert_eq!(hash, location_hash("https://example.com/a.json"));
        assert_ne!(hash, location_hash("https://example.com/b.json"));
    }

    #[test]
    fn node_context_reaches_parent_and_root() {
        let cache = ResolutionCache::new();
        let loaders = LoaderRegistry::new();
        let mut root = json!({ "a": { "b/c": { "x": 1 } } });
        let path = vec!["a".to_string(), "b/c".to_string()];
        let mut ctx = NodeContext {
            root: &mut root,
            path: &path,
            detached: 0,
            origin: None,
            context: "",
            resolution_cache: &cache,
            loaders: &loaders,
        };
        assert_eq!(ctx.parent_path(), ["a".to_string()]);
        assert_eq!(ctx.pointer(), "/a/b~1c");
        assert_eq!(ctx.node(), &json!({ "x": 1 }));
        assert_eq!(ctx.parent(), Some(&json!({ "b/c": { "x": 1 } })));

        ctx.node_mut().unwrap()["x"] = json!(2);
        assert_eq!(ctx.root()["a"]["b/c"]["x"], 2);

        ctx.detached = 2;
        assert!(ctx.parent().is_none());
    }

    #[test]
    fn localize_moves_refs_under_mount() {
        let document = json!({ "defs": { "a": { "$anchor": "a" } } });
        let scope = Scope::mounted("abc1234", "other.json", 1, &document, false);
        assert_eq!(
            scope.localize("#/defs/a", "other.json").as_deref(),
            Some("#/x-ext/abc1234/defs/a")
        );
        assert_eq!(scope.localize("#", "other.json").as_deref(), Some("#/x-ext/abc1234"));
        assert_eq!(
            scope.localize("#a", "other.json").as_deref(),
            Some("#/x-ext/abc1234/defs/a")
        );
        assert!(Scope::root(None).localize("#/a", "").is_none());

        let global = Scope::mounted("abc1234", "other.json", 1, &document, true);
        assert!(global.localize("#/defs/a", "other.json").is_none());
    }

    #[test]
    fn keep_prunes_unreferenced_members() {
        let path = |p: &str| parse_pointer(p);
        let mut keep = Keep::default();
        assert!(keep.insert(&path("/a/b")));
        assert!(keep.insert(&path("/d")));
        assert!(!keep.insert(&path("/d/e")));
        assert!(!keep.insert(&path("/a/b")));

        let mut document = json!({
            "a": { "b": { "c": 1 }, "c": 2 },
            "d": { "e": 3, "f": 4 },
            "g": [1, 2],
        });
        keep.prune(&mut document);
        assert_eq!(document, json!({ "a": { "b": { "c": 1 } }, "d": { "e": 3, "f": 4 } }));
    }

    #[test]
    fn tree_shake_follows_refs_between_mounts() {
        let mut root = json!({
            "schema": { "$ref": "#/x-ext/aaaaaaa/a" },
            "x-ext": {
                "aaaaaaa": {
                    "a": { "$ref": "#/x-ext/bbbbbbb/b/c" },
                    "unused": true
                },
                "bbbbbbb": { "b": { "c": { "$ref": "#/x-ext/bbbbbbb/b" }, "d": 1 }, "e": 2 },
                "ccccccc": { "never": "referenced" }
            },
            "x-ext-urls": { "aaaaaaa": "a.json", "bbbbbbb": "b.json", "ccccccc": "c.json" }
        });
        tree_shake(&mut root);

        assert_eq!(
            root["x-ext"],
            json!({
                "aaaaaaa": { "a": { "$ref": "#/x-ext/bbbbbbb/b/c" } },
                "bbbbbbb": { "b": { "c": { "$ref": "#/x-ext/bbbbbbb/b" }, "d": 1 } }
            })
        );
        assert_eq!(root["x-ext-urls"], json!({ "aaaaaaa": "a.json", "bbbbbbb": "b.json" }));
    }

    #[tokio::test]
    async fn rewrites_ref_to_mounted_document() {
        let loader = MemoryLoader::new().with("user.json", json!({ "type": "object" }));
        let mut doc = json!({ "schema": { "$ref": "user.json#/type" } });

        let report = bundler(loader).bundle(&mut doc).await;
        let hash = location_hash("user.json");

        assert_eq!(report.resolved, 1);
        assert_eq!(report.fetched, 1);
        assert_eq!(doc["schema"], json!({ "$ref": format!("#/x-ext/{}/type", hash) }));
        assert_eq!(doc["x-ext"][&hash], json!({ "type": "object" }));
    }

    #[tokio::test]
    async fn hooks_see_loading_status() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let record = seen.clone();
        let loader = MemoryLoader::new().with("a.json", json!({}));
        let bundler = bundler(loader).plugin(hook(LifecycleEvent::ResolveStart, move |ctx| {
            record
                .borrow_mut()
                .push((ctx.pointer(), ctx.node()[STATUS_KEY].clone()));
        }));

        let mut doc = json!({ "a": { "$ref": "a.json" } });
        bundler.bundle(&mut doc).await;

        assert_eq!(*seen.borrow(), vec![("/a".to_string(), json!("loading"))]);
        assert!(doc["a"].get(STATUS_KEY).is_none());
    }
}
