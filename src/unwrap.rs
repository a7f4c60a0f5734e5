//! Stripping transparent wrapper layers.

use crate::graph::{Graph, Node, NodeId};
use crate::types::UnwrapOptions;
use crate::walker::{GraphWalker, Key, Member, OwnedKey, Visitor};

/// Collects members that are stored behind wrappers.
struct WrappedMembers {
    replacements: Vec<(NodeId, OwnedKey, Node)>,
}

impl Visitor for WrappedMembers {
    type Shell = NodeId;

    fn root(&mut self, target: NodeId, _path: &str) -> NodeId {
        target
    }

    fn scalar(&mut self, parent: &NodeId, key: Key<'_>, original: &Node, value: &Node) {
        if original != value {
            self.replacements.push((*parent, key.to_owned_key(), value.clone()));
        }
    }

    fn revisit(&mut self, parent: &NodeId, key: Key<'_>, member: &Member<'_>) {
        self.record(*parent, key, member);
    }

    fn enter(&mut self, parent: &NodeId, key: Key<'_>, member: &Member<'_>) -> NodeId {
        self.record(*parent, key, member);
        member.target
    }
}

impl WrappedMembers {
    fn record(&mut self, parent: NodeId, key: Key<'_>, member: &Member<'_>) {
        if member.original.handle() != Some(member.target) {
            self.replacements
                .push((parent, key.to_owned_key(), Node::Handle(member.target)));
        }
    }
}

/// Return the raw value behind any stack of wrappers and replace wrapped
/// members with their raw values, in place, down to `options.depth`.
///
/// Shared and cyclic wrapped structures collapse onto a single raw instance.
/// Unwrapping a raw value returns the same handle and changes nothing.
pub fn unwrap(graph: &mut Graph, node: &Node, options: UnwrapOptions) -> Node {
    let raw = graph.resolve(node);
    if raw.handle().is_none() || options.depth == Some(0) {
        return raw;
    }

    let mut members = WrappedMembers {
        replacements: Vec::new(),
    };
    GraphWalker::new(graph)
        .max_depth(options.depth)
        .walk(&raw, &mut members);

    for (container, key, value) in members.replacements {
        graph.replace_member(container, &key, value);
    }
    raw
}
