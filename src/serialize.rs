//! Circular-safe rendering of a [`Graph`] to JSON.
//!
//! The first occurrence of a container (breadth-first) is expanded in full; every
//! later occurrence, whether a cycle or a second path to a shared node, becomes
//! `{ "$ref": "#<path of first occurrence>" }`. [`inflate`] reverses the process.

use serde_json::{Map, Value};

use crate::graph::{Graph, Node, NodeId, Slot};
use crate::pointer::parse_pointer;
use crate::types::{SerializeOptions, REF_KEY};
use crate::walker::{GraphWalker, Key, Member, OwnedKey, Visitor};

/// A rendered, acyclic copy of a graph.
///
/// Kept as a graph so array holes survive; [`Rendered::into_value`] turns it
/// into JSON.
#[derive(Debug, Clone)]
pub struct Rendered {
    graph: Graph,
    root: Node,
}

impl Rendered {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Convert to JSON. Holes become `null`, the only way JSON can spell them.
    pub fn into_value(self) -> Value {
        let root = self.root;
        let slots = self.graph.into_slots();

        // Children are always allocated after their parent, so building from the
        // last slot backwards finishes every child before it is needed.
        let mut built: Vec<Option<Value>> = vec![None; slots.len()];
        for (index, slot) in slots.iter().enumerate().rev() {
            let value = match slot {
                Slot::Array(items) => Value::Array(
                    items
                        .iter()
                        .map(|item| match item {
                            Some(node) => take_built(&mut built, node),
                            None => Value::Null,
                        })
                        .collect(),
                ),
                Slot::Object(members) => Value::Object(
                    members
                        .iter()
                        .map(|(key, node)| (key.clone(), take_built(&mut built, node)))
                        .collect::<Map<String, Value>>(),
                ),
                Slot::Wrapped { .. } => Value::Null,
            };
            built[index] = Some(value);
        }

        take_built(&mut built, &root)
    }
}

fn take_built(built: &mut [Option<Value>], node: &Node) -> Value {
    match node {
        Node::Handle(id) => built
            .get_mut(id.index())
            .and_then(Option::take)
            .unwrap_or(Value::Null),
        other => other.to_scalar_value().unwrap_or(Value::Null),
    }
}

struct Renderer<'g> {
    source: &'g Graph,
    out: Graph,
}

impl Renderer<'_> {
    fn shell_for(&mut self, target: NodeId) -> NodeId {
        match self.source.slot(target) {
            Some(Slot::Array(items)) => self.out.array_with_holes(items.len()),
            _ => self.out.object(),
        }
    }

    fn write(&mut self, parent: NodeId, key: Key<'_>, value: Node) {
        match key {
            Key::Index(index) => self.out.set_item(parent, index, Some(value)),
            Key::Name(name) => {
                self.out.set(parent, name, value);
            }
        }
    }
}

impl Visitor for Renderer<'_> {
    type Shell = NodeId;

    fn root(&mut self, target: NodeId, _path: &str) -> NodeId {
        self.shell_for(target)
    }

    fn scalar(&mut self, parent: &NodeId, key: Key<'_>, _original: &Node, value: &Node) {
        if !matches!(value, Node::Opaque(_)) {
            self.write(*parent, key, value.clone());
        }
    }

    fn revisit(&mut self, parent: &NodeId, key: Key<'_>, member: &Member<'_>) {
        let marker = self.out.object();
        self.out.set(marker, REF_KEY, format!("#{}", member.path()));
        self.write(*parent, key, Node::Handle(marker));
    }

    fn enter(&mut self, parent: &NodeId, key: Key<'_>, member: &Member<'_>) -> NodeId {
        let shell = self.shell_for(member.target);
        // written before its members so later back-references have a target
        self.write(*parent, key, Node::Handle(shell));
        shell
    }
}

/// Render the graph reachable from `root` without cycles or duplication.
///
/// Opaque values are dropped: the member disappears from objects and leaves a
/// hole in arrays. An opaque root renders as `null`.
pub fn serialize(graph: &Graph, root: &Node, options: &SerializeOptions) -> Rendered {
    let mut renderer = Renderer {
        source: graph,
        out: Graph::new(),
    };
    let shell = GraphWalker::new(graph)
        .prefix(options.prefix.clone())
        .walk(root, &mut renderer);

    let root = match shell {
        Some(id) => Node::Handle(id),
        None => match graph.resolve(root) {
            Node::Opaque(_) => Node::Null,
            scalar => scalar,
        },
    };
    Rendered {
        graph: renderer.out,
        root,
    }
}

/// Shorthand for `serialize(..).into_value()`.
pub fn serialize_to_value(graph: &Graph, root: &Node, options: &SerializeOptions) -> Value {
    serialize(graph, root, options).into_value()
}

/// Whether an object slot is exactly `{ "$ref": "#..." }`.
fn marker_target(graph: &Graph, id: NodeId) -> Option<String> {
    match graph.slot(id) {
        Some(Slot::Object(members)) if members.len() == 1 => members
            .get(REF_KEY)
            .and_then(Node::as_str)
            .and_then(|r| r.strip_prefix('#'))
            .map(str::to_string),
        _ => None,
    }
}

/// Container at `pointer` (prefix included) below `root`, unless it is
/// itself a marker.
fn locate(graph: &Graph, root: &Node, pointer: &str, prefix: &str) -> Option<NodeId> {
    let rest = pointer.strip_prefix(prefix)?;
    if !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }
    let mut current = root.handle()?;
    for segment in parse_pointer(rest) {
        let next = match graph.slot(current)? {
            Slot::Array(_) => graph.item(current, segment.parse().ok()?)?,
            Slot::Object(_) => graph.get(current, &segment)?,
            _ => return None,
        };
        current = next.handle()?;
    }
    marker_target(graph, current).is_none().then_some(current)
}

struct MarkerCollector<'g> {
    graph: &'g Graph,
    markers: Vec<(NodeId, OwnedKey, String)>,
}

impl Visitor for MarkerCollector<'_> {
    type Shell = NodeId;

    fn root(&mut self, target: NodeId, _path: &str) -> NodeId {
        target
    }

    fn scalar(&mut self, _parent: &NodeId, _key: Key<'_>, _original: &Node, _value: &Node) {}

    fn revisit(&mut self, _parent: &NodeId, _key: Key<'_>, _member: &Member<'_>) {}

    fn enter(&mut self, parent: &NodeId, key: Key<'_>, member: &Member<'_>) -> NodeId {
        if let Some(pointer) = marker_target(self.graph, member.target) {
            self.markers.push((*parent, key.to_owned_key(), pointer));
        }
        member.target
    }
}

/// Rebuild a graph from rendered JSON, turning `$ref` markers back into aliases.
///
/// Markers whose pointer does not name an expanded location in the same value
/// are kept as ordinary objects. `options.prefix` must match the prefix used
/// when rendering.
pub fn inflate(value: &Value, options: &SerializeOptions) -> (Graph, Node) {
    let mut graph = Graph::new();
    let root = graph.from_value(value);

    let mut collector = MarkerCollector {
        graph: &graph,
        markers: Vec::new(),
    };
    GraphWalker::new(&graph).walk(&root, &mut collector);
    let markers = collector.markers;

    // every target is looked up in the tree as parsed, before any aliasing
    let links: Vec<(NodeId, OwnedKey, NodeId)> = markers
        .into_iter()
        .filter_map(|(parent, key, pointer)| {
            locate(&graph, &root, &pointer, &options.prefix).map(|target| (parent, key, target))
        })
        .collect();
    for (parent, key, target) in links {
        graph.replace_member(parent, &key, Node::Handle(target));
    }

    (graph, root)
}
