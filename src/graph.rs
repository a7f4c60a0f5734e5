//! Arena-backed document graph.
//!
//! `serde_json::Value` is a tree and cannot express two paths to the same node,
//! let alone a cycle. The graph stores containers in slots and links them through
//! [`NodeId`] handles, so identity is explicit: the same handle reached through two
//! members is aliasing, not duplication.

use indexmap::IndexMap;
use serde_json::{Number, Value};

/// Handle to a container slot in a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A value in the graph: a scalar, or a handle to a container slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// A value with no JSON representation (a callable, a host object).
    /// Rendering drops it.
    Opaque(String),
    Handle(NodeId),
}

impl Node {
    pub fn handle(&self) -> Option<NodeId> {
        match self {
            Node::Handle(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::String(s) => Some(s),
            _ => None,
        }
    }

    fn from_scalar(value: &Value) -> Self {
        match value {
            Value::Null => Node::Null,
            Value::Bool(b) => Node::Bool(*b),
            Value::Number(n) => Node::Number(n.clone()),
            Value::String(s) => Node::String(s.clone()),
            // containers are allocated by the caller
            Value::Array(_) | Value::Object(_) => Node::Null,
        }
    }

    /// JSON form of a scalar. Handles and opaque values have none.
    pub fn to_scalar_value(&self) -> Option<Value> {
        match self {
            Node::Null => Some(Value::Null),
            Node::Bool(b) => Some(Value::Bool(*b)),
            Node::Number(n) => Some(Value::Number(n.clone())),
            Node::String(s) => Some(Value::String(s.clone())),
            Node::Opaque(_) | Node::Handle(_) => None,
        }
    }
}

impl From<NodeId> for Node {
    fn from(id: NodeId) -> Self {
        Node::Handle(id)
    }
}

impl From<&str> for Node {
    fn from(s: &str) -> Self {
        Node::String(s.to_string())
    }
}

impl From<String> for Node {
    fn from(s: String) -> Self {
        Node::String(s)
    }
}

impl From<bool> for Node {
    fn from(b: bool) -> Self {
        Node::Bool(b)
    }
}

impl From<i64> for Node {
    fn from(n: i64) -> Self {
        Node::Number(n.into())
    }
}

/// Transparent layers a value can be wrapped in.
///
/// Each layer intercepts access to the value it wraps while keeping its shape;
/// readers of the graph look straight through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapperKind {
    /// Reactivity tracking for a UI store.
    Reactive,
    /// Change detection feeding persistence.
    ChangeTracking,
    /// Per-user overrides merged over the stored value.
    Overrides,
    /// Lazy `$ref` resolution on access.
    LazyRef,
}

/// Contents of a container slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    /// Array members; `None` is a hole.
    Array(Vec<Option<Node>>),
    /// Object members in insertion order.
    Object(IndexMap<String, Node>),
    Wrapped { kind: WrapperKind, inner: Node },
}

/// Arena of container slots.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    slots: Vec<Slot>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of allocated slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn alloc(&mut self, slot: Slot) -> NodeId {
        self.slots.push(slot);
        NodeId(self.slots.len() - 1)
    }

    /// Allocate an empty object.
    pub fn object(&mut self) -> NodeId {
        self.alloc(Slot::Object(IndexMap::new()))
    }

    /// Allocate an empty array.
    pub fn array(&mut self) -> NodeId {
        self.alloc(Slot::Array(Vec::new()))
    }

    /// Allocate an array of `len` holes.
    pub fn array_with_holes(&mut self, len: usize) -> NodeId {
        self.alloc(Slot::Array(vec![None; len]))
    }

    /// Wrap `inner` in a transparent layer.
    pub fn wrap(&mut self, kind: WrapperKind, inner: impl Into<Node>) -> NodeId {
        self.alloc(Slot::Wrapped {
            kind,
            inner: inner.into(),
        })
    }

    pub fn slot(&self, id: NodeId) -> Option<&Slot> {
        self.slots.get(id.0)
    }

    pub fn is_wrapped(&self, id: NodeId) -> bool {
        matches!(self.slot(id), Some(Slot::Wrapped { .. }))
    }

    /// Follow wrapper layers down to the innermost value.
    ///
    /// Wrappers are immutable once allocated and can only wrap earlier slots, so
    /// the chain always ends.
    pub fn resolve(&self, node: &Node) -> Node {
        let mut current = node.clone();
        while let Node::Handle(id) = current {
            match self.slot(id) {
                Some(Slot::Wrapped { inner, .. }) => current = inner.clone(),
                _ => break,
            }
        }
        current
    }

    /// Set an object member, returning the previous value.
    ///
    /// Writes to anything other than an object slot are ignored.
    pub fn set(&mut self, object: NodeId, key: impl Into<String>, value: impl Into<Node>) -> Option<Node> {
        match self.slots.get_mut(object.0) {
            Some(Slot::Object(members)) => members.insert(key.into(), value.into()),
            _ => None,
        }
    }

    /// Read an object member.
    pub fn get(&self, object: NodeId, key: &str) -> Option<&Node> {
        match self.slot(object) {
            Some(Slot::Object(members)) => members.get(key),
            _ => None,
        }
    }

    /// Append to an array.
    pub fn push(&mut self, array: NodeId, value: impl Into<Node>) {
        if let Some(Slot::Array(items)) = self.slots.get_mut(array.0) {
            items.push(Some(value.into()));
        }
    }

    /// Write an array index, growing the array with holes when needed.
    /// `None` punches a hole.
    pub fn set_item(&mut self, array: NodeId, index: usize, value: Option<Node>) {
        if let Some(Slot::Array(items)) = self.slots.get_mut(array.0) {
            if items.len() <= index {
                items.resize(index + 1, None);
            }
            items[index] = value;
        }
    }

    /// Read an array index; holes and out-of-range indices give `None`.
    pub fn item(&self, array: NodeId, index: usize) -> Option<&Node> {
        match self.slot(array) {
            Some(Slot::Array(items)) => items.get(index).and_then(Option::as_ref),
            _ => None,
        }
    }

    /// Replace a member of an object (by key) or an array (by index).
    pub(crate) fn replace_member(&mut self, container: NodeId, key: &crate::walker::OwnedKey, value: Node) {
        use crate::walker::OwnedKey;
        match (self.slots.get_mut(container.0), key) {
            (Some(Slot::Object(members)), OwnedKey::Name(name)) => {
                if let Some(slot) = members.get_mut(name) {
                    *slot = value;
                }
            }
            (Some(Slot::Array(items)), OwnedKey::Index(index)) => {
                if let Some(slot) = items.get_mut(*index) {
                    *slot = Some(value);
                }
            }
            _ => {}
        }
    }

    pub(crate) fn into_slots(self) -> Vec<Slot> {
        self.slots
    }

    /// Copy a JSON tree into the graph. Every container gets a fresh slot.
    pub fn from_value(&mut self, value: &Value) -> Node {
        let Some(root) = self.alloc_container(value) else {
            return Node::from_scalar(value);
        };

        let mut stack = vec![(value, root)];
        while let Some((value, id)) = stack.pop() {
            match value {
                Value::Array(items) => {
                    for (index, item) in items.iter().enumerate() {
                        let child = self.adopt(item, &mut stack);
                        self.set_item(id, index, Some(child));
                    }
                }
                Value::Object(members) => {
                    for (key, member) in members {
                        let child = self.adopt(member, &mut stack);
                        self.set(id, key.clone(), child);
                    }
                }
                _ => {}
            }
        }
        Node::Handle(root)
    }

    fn alloc_container(&mut self, value: &Value) -> Option<NodeId> {
        match value {
            Value::Array(_) => Some(self.array()),
            Value::Object(_) => Some(self.object()),
            _ => None,
        }
    }

    fn adopt<'v>(&mut self, value: &'v Value, stack: &mut Vec<(&'v Value, NodeId)>) -> Node {
        match self.alloc_container(value) {
            Some(id) => {
                stack.push((value, id));
                Node::Handle(id)
            }
            None => Node::from_scalar(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn self_reference_is_one_slot() {
        let mut graph = Graph::new();
        let obj = graph.object();
        graph.set(obj, "self", obj);

        assert_eq!(graph.len(), 1);
        assert_eq!(graph.get(obj, "self"), Some(&Node::Handle(obj)));
    }

    #[test]
    fn set_item_grows_with_holes() {
        let mut graph = Graph::new();
        let arr = graph.array();
        graph.set_item(arr, 1, Some(Node::from("b")));

        assert_eq!(graph.item(arr, 0), None);
        assert_eq!(graph.item(arr, 1), Some(&Node::from("b")));
        match graph.slot(arr) {
            Some(Slot::Array(items)) => assert_eq!(items.len(), 2),
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn resolve_sees_through_wrapper_stack() {
        let mut graph = Graph::new();
        let raw = graph.object();
        let reactive = graph.wrap(WrapperKind::Reactive, raw);
        let tracked = graph.wrap(WrapperKind::ChangeTracking, reactive);

        assert!(graph.is_wrapped(tracked));
        assert_eq!(graph.resolve(&Node::Handle(tracked)), Node::Handle(raw));
        assert_eq!(graph.resolve(&Node::from("x")), Node::from("x"));
    }

    #[test]
    fn from_value_keeps_order() {
        let mut graph = Graph::new();
        let root = graph.from_value(&json!({ "z": 1, "a": [true, null], "m": { "k": "v" } }));
        let id = root.handle().unwrap();

        match graph.slot(id) {
            Some(Slot::Object(members)) => {
                let keys: Vec<&str> = members.keys().map(String::as_str).collect();
                assert_eq!(keys, ["z", "a", "m"]);
            }
            other => panic!("expected object, got {:?}", other),
        }
        let arr = graph.get(id, "a").and_then(Node::handle).unwrap();
        assert_eq!(graph.item(arr, 0), Some(&Node::Bool(true)));
        assert_eq!(graph.item(arr, 1), Some(&Node::Null));
    }

    #[test]
    fn from_value_scalar_root() {
        let mut graph = Graph::new();
        assert_eq!(graph.from_value(&json!("x")), Node::from("x"));
        assert!(graph.is_empty());
    }
}
