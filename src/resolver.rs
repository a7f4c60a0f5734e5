//! Two-phase reference resolution.
//!
//! Phase 1 indexes every `$id` and `$anchor` reachable from the loaded documents
//! into a [`LocationMap`]. Phase 2 canonicalizes and dereferences `$ref`s against
//! that map. The phases are separate types: a [`ReferenceResolver`] only exists
//! once its [`SchemaIndexer`] has been consumed, so references cannot be resolved
//! against a half-built index.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::ReferenceError;
use crate::graph::{Graph, Node, NodeId};
use crate::pointer::{self, escape};
use crate::types::ResolutionContext;
use crate::walker::{GraphWalker, Key, Member, Visitor};

/// Map from schema identifier (`baseURI` or `baseURI#anchor`) to the local path
/// of the node it names.
///
/// Paths have no leading `/`; the document root is `""`. Entries are never
/// overwritten: the first registration of an identifier wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationMap {
    entries: HashMap<String, String>,
}

impl LocationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identifier: &str) -> Option<&str> {
        self.entries.get(identifier).map(String::as_str)
    }

    /// Register an identifier. Returns false if it was already known.
    pub fn insert(&mut self, identifier: impl Into<String>, path: impl Into<String>) -> bool {
        let identifier = identifier.into();
        if self.entries.contains_key(&identifier) {
            return false;
        }
        self.entries.insert(identifier, path.into());
        true
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Phase 1: collects schema locations from every document of a session.
#[derive(Debug, Default)]
pub struct SchemaIndexer {
    locations: LocationMap,
}

impl SchemaIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from locations registered elsewhere (e.g. where external
    /// documents were mounted).
    pub fn with_locations(locations: LocationMap) -> Self {
        Self { locations }
    }

    /// Register the location of a whole document, typically an external file
    /// mounted inside the bundle.
    pub fn register(&mut self, identifier: impl Into<String>, path: impl Into<String>) -> &mut Self {
        self.locations.insert(identifier, path);
        self
    }

    /// Index a document tree.
    ///
    /// `base` is the context for nodes outside any `$id` scope; anchors found
    /// there are registered as `base#anchor`.
    pub fn index(&mut self, document: &Value, base: &str) -> &mut Self {
        self.index_at(document, base, &[])
    }

    /// Index a subtree that lives at `segments` within the final document.
    pub fn index_at(&mut self, node: &Value, base: &str, segments: &[&str]) -> &mut Self {
        let path: Vec<String> = segments.iter().map(|s| s.to_string()).collect();
        let scope = ResolutionContext {
            path,
            context: base.to_string(),
        };
        self.index_value(node, &scope);
        self
    }

    fn index_value(&mut self, node: &Value, scope: &ResolutionContext) {
        match node {
            Value::Object(map) => {
                let scope = scope.enter(node);
                let path = local_path(&scope.path);
                if let Some(id) = crate::types::schema_id(node) {
                    self.locations.insert(id, path.clone());
                }
                if let Some(anchor) = crate::types::schema_anchor(node) {
                    self.locations
                        .insert(format!("{}#{}", scope.context, anchor), path);
                }
                for (key, child) in map {
                    self.index_value(child, &scope.child(key.as_str()));
                }
            }
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    self.index_value(item, &scope.child(index.to_string()));
                }
            }
            _ => {}
        }
    }

    /// Index a graph that may contain cycles and shared nodes.
    ///
    /// Shared nodes are indexed once, at the first path the walk reaches them.
    pub fn index_graph(&mut self, graph: &Graph, root: &Node, base: &str) -> &mut Self {
        let mut visitor = GraphIndexVisitor {
            graph,
            base,
            locations: &mut self.locations,
        };
        GraphWalker::new(graph).walk(root, &mut visitor);
        self
    }

    /// The locations collected so far.
    pub fn locations(&self) -> &LocationMap {
        &self.locations
    }

    /// End phase 1.
    pub fn finish(self) -> ReferenceResolver {
        ReferenceResolver {
            locations: self.locations,
        }
    }
}

fn local_path(segments: &[String]) -> String {
    segments
        .iter()
        .map(|s| escape(s))
        .collect::<Vec<_>>()
        .join("/")
}

struct GraphIndexVisitor<'a> {
    graph: &'a Graph,
    base: &'a str,
    locations: &'a mut LocationMap,
}

impl GraphIndexVisitor<'_> {
    fn string_member(&self, id: NodeId, key: &str) -> Option<String> {
        self.graph
            .get(id, key)
            .map(|node| self.graph.resolve(node))
            .and_then(|node| node.as_str().map(str::to_string))
    }

    /// Records the node's `$id`/`$anchor` and returns its scope. The path is
    /// only built for nodes that carry one of them.
    fn record(&mut self, id: NodeId, path: impl FnOnce() -> String, inherited: &str) -> String {
        let schema_id = self.string_member(id, "$id");
        let anchor = self.string_member(id, "$anchor").filter(|a| !a.is_empty());
        if schema_id.is_none() && anchor.is_none() {
            return inherited.to_string();
        }

        let pointer = path();
        let path = pointer.strip_prefix('/').unwrap_or(&pointer);
        let context = match schema_id {
            Some(schema_id) => {
                self.locations.insert(schema_id.clone(), path);
                schema_id
            }
            None => inherited.to_string(),
        };
        if let Some(anchor) = anchor {
            self.locations.insert(format!("{}#{}", context, anchor), path);
        }
        context
    }
}

impl Visitor for GraphIndexVisitor<'_> {
    /// Scope (`$id` context) of the container.
    type Shell = String;

    fn root(&mut self, target: NodeId, path: &str) -> String {
        let base = self.base;
        self.record(target, || path.to_string(), base)
    }

    fn scalar(&mut self, _parent: &String, _key: Key<'_>, _original: &Node, _value: &Node) {}

    fn revisit(&mut self, _parent: &String, _key: Key<'_>, _member: &Member<'_>) {}

    fn enter(&mut self, parent: &String, _key: Key<'_>, member: &Member<'_>) -> String {
        self.record(member.target, || member.path(), parent)
    }
}

/// Phase 2: canonicalizes and dereferences `$ref`s.
///
/// A resolver built with `default()` knows no locations, so every external or
/// anchor reference fails loudly rather than resolving to nothing.
#[derive(Debug, Clone, Default)]
pub struct ReferenceResolver {
    locations: LocationMap,
}

impl ReferenceResolver {
    pub fn locations(&self) -> &LocationMap {
        &self.locations
    }

    /// Canonicalize `reference` to a local path, given the `$id` scope of the
    /// node that holds it.
    pub fn canonicalize(&self, reference: &str, context: &str) -> Result<String, ReferenceError> {
        pointer::canonicalize(reference, context, &self.locations)
    }

    /// Canonicalize and then dereference within `root`.
    pub fn resolve<'v>(
        &self,
        root: &'v Value,
        reference: &str,
        context: &str,
    ) -> Result<&'v Value, ReferenceError> {
        let path = self.canonicalize(reference, context)?;
        navigate(root, &path).ok_or(ReferenceError::PointerNotFound { pointer: path })
    }
}

/// Follow a pointer (with or without leading `/` or `#`) through a JSON tree.
pub fn navigate<'v>(root: &'v Value, pointer: &str) -> Option<&'v Value> {
    let mut current = root;
    for segment in pointer::parse_pointer(pointer) {
        current = match current {
            Value::Object(map) => map.get(&segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
