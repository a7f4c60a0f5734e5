//! Cycle-safe breadth-first traversal over a [`Graph`].
//!
//! The walker owns the worklist and the identity cache; a [`Visitor`] decides what
//! to do with each member. The first time a container is reached it is entered
//! and its path is cached; every later arrival (a cycle or a shared reference)
//! is reported as a revisit with the cached path instead. No recursion is
//! involved, so arbitrarily deep documents cannot overflow the stack.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::graph::{Graph, Node, NodeId, Slot};
use crate::pointer::escape;

/// Position of a member within its parent container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key<'a> {
    Index(usize),
    Name(&'a str),
}

impl Key<'_> {
    pub fn to_owned_key(&self) -> OwnedKey {
        match self {
            Key::Index(index) => OwnedKey::Index(*index),
            Key::Name(name) => OwnedKey::Name((*name).to_string()),
        }
    }
}

impl fmt::Display for Key<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Index(index) => write!(f, "{}", index),
            Key::Name(name) => f.write_str(name),
        }
    }
}

/// Owned form of [`Key`], for visitors that record positions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnedKey {
    Index(usize),
    Name(String),
}

/// First-seen position of every container reached by a walk.
///
/// Each entry is a link to the parent container and the key under it, so the
/// index grows with the number of nodes, not with their depth. Pointers are
/// built on request.
#[derive(Debug)]
pub struct PathIndex {
    prefix: String,
    links: HashMap<NodeId, Option<(NodeId, OwnedKey)>>,
}

impl PathIndex {
    fn new(prefix: String, root: NodeId) -> Self {
        let mut links = HashMap::new();
        links.insert(root, None);
        Self { prefix, links }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.links.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Pointer of the first path the walk reached `id` by, including the prefix.
    pub fn pointer(&self, id: NodeId) -> Option<String> {
        let mut keys = Vec::new();
        let mut current = id;
        while let Some((parent, key)) = self.links.get(&current)?.as_ref() {
            keys.push(key);
            current = *parent;
        }

        let mut pointer = self.prefix.clone();
        for key in keys.iter().rev() {
            pointer.push('/');
            match key {
                OwnedKey::Index(index) => pointer.push_str(&index.to_string()),
                OwnedKey::Name(name) => pointer.push_str(&escape(name)),
            }
        }
        Some(pointer)
    }
}

/// A container member reached during a walk.
#[derive(Debug)]
pub struct Member<'a> {
    /// The member as stored, possibly a wrapper handle.
    pub original: &'a Node,
    /// Innermost raw container behind `original`.
    pub target: NodeId,
    paths: &'a PathIndex,
}

impl Member<'_> {
    /// Pointer of the member (for revisits: where it was first seen).
    pub fn path(&self) -> String {
        self.paths.pointer(self.target).unwrap_or_default()
    }
}

/// Callbacks driven by [`GraphWalker::walk`].
pub trait Visitor {
    /// Per-container state handed back for each of its members.
    type Shell: Clone;

    /// The root container, after wrapper layers are stripped.
    fn root(&mut self, target: NodeId, path: &str) -> Self::Shell;

    /// A scalar member. `original` differs from `value` when the scalar was wrapped.
    fn scalar(&mut self, parent: &Self::Shell, key: Key<'_>, original: &Node, value: &Node);

    /// A container member whose identity was already visited.
    fn revisit(&mut self, parent: &Self::Shell, key: Key<'_>, member: &Member<'_>);

    /// A container member seen for the first time. Its members are visited later,
    /// breadth-first, with the returned shell.
    fn enter(&mut self, parent: &Self::Shell, key: Key<'_>, member: &Member<'_>) -> Self::Shell;
}

struct Frame<S> {
    id: NodeId,
    shell: S,
    depth: usize,
}

/// Breadth-first walker with a per-call identity cache.
pub struct GraphWalker<'g> {
    graph: &'g Graph,
    prefix: String,
    max_depth: Option<usize>,
}

impl<'g> GraphWalker<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self {
            graph,
            prefix: String::new(),
            max_depth: None,
        }
    }

    /// Pointer assigned to the root; member paths extend it.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Containers at `depth` or deeper are entered but their members are not
    /// visited. The root is at depth 0.
    pub fn max_depth(mut self, max_depth: Option<usize>) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Walk everything reachable from `root`.
    ///
    /// Returns the root shell, or `None` when `root` is not a container.
    pub fn walk<V: Visitor>(&self, root: &Node, visitor: &mut V) -> Option<V::Shell> {
        self.walk_indexed(root, visitor).map(|(shell, _)| shell)
    }

    /// Like [`walk`](Self::walk), also returning where each container was
    /// first reached.
    pub fn walk_indexed<V: Visitor>(&self, root: &Node, visitor: &mut V) -> Option<(V::Shell, PathIndex)> {
        let Node::Handle(root_id) = self.graph.resolve(root) else {
            return None;
        };

        let mut paths = PathIndex::new(self.prefix.clone(), root_id);
        let root_shell = visitor.root(root_id, &self.prefix);
        let mut queue = VecDeque::new();
        queue.push_back(Frame {
            id: root_id,
            shell: root_shell.clone(),
            depth: 0,
        });

        while let Some(frame) = queue.pop_front() {
            if self.max_depth.is_some_and(|max| frame.depth >= max) {
                continue;
            }
            match self.graph.slot(frame.id) {
                Some(Slot::Array(items)) => {
                    for (index, item) in items.iter().enumerate() {
                        if let Some(item) = item {
                            self.visit_member(&frame, Key::Index(index), item, &mut paths, &mut queue, visitor);
                        }
                    }
                }
                Some(Slot::Object(members)) => {
                    for (name, member) in members {
                        self.visit_member(&frame, Key::Name(name), member, &mut paths, &mut queue, visitor);
                    }
                }
                _ => {}
            }
        }

        Some((root_shell, paths))
    }

    fn visit_member<V: Visitor>(
        &self,
        frame: &Frame<V::Shell>,
        key: Key<'_>,
        original: &Node,
        paths: &mut PathIndex,
        queue: &mut VecDeque<Frame<V::Shell>>,
        visitor: &mut V,
    ) {
        let resolved = self.graph.resolve(original);
        let Node::Handle(target) = resolved else {
            visitor.scalar(&frame.shell, key, original, &resolved);
            return;
        };

        if paths.contains(target) {
            visitor.revisit(&frame.shell, key, &Member { original, target, paths });
            return;
        }

        paths.links.insert(target, Some((frame.id, key.to_owned_key())));
        let shell = visitor.enter(&frame.shell, key, &Member { original, target, paths });
        queue.push_back(Frame {
            id: target,
            shell,
            depth: frame.depth + 1,
        });
    }
}
