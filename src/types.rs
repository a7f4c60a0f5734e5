//! Core types shared across resolution, bundling and export.

use serde::Deserialize;
use serde_json::Value;

/// Key holding a JSON Reference.
pub const REF_KEY: &str = "$ref";

/// Key used by the bundler to tag a node's resolution status.
pub const STATUS_KEY: &str = "$status";

/// Root key under which external documents are stored once bundled.
pub const EXTERNAL_KEY: &str = "x-ext";

/// Root key mapping each bundled document hash back to its source location.
pub const EXTERNAL_URLS_KEY: &str = "x-ext-urls";

/// Flag on a `$ref` node: the referenced document's local refs point into the
/// bundle root instead of into the mounted document.
pub const GLOBAL_KEY: &str = "$global";

/// HTTP methods that make up the operations of an OpenAPI path item.
pub const HTTP_METHODS: &[&str] = &[
    "get", "put", "post", "delete", "options", "head", "patch", "trace",
];

/// Whether `key` names an operation inside a path item (case-insensitive).
pub fn is_http_method(key: &str) -> bool {
    HTTP_METHODS.iter().any(|m| m.eq_ignore_ascii_case(key))
}

/// Returns the `$id` of a node when it is a string, including `""`.
///
/// Any other `$id` value is ignored, so scope is inherited unchanged.
pub fn schema_id(node: &Value) -> Option<&str> {
    node.get("$id").and_then(Value::as_str)
}

/// Returns the `$anchor` of a node when it is a non-empty string.
pub fn schema_anchor(node: &Value) -> Option<&str> {
    node.get("$anchor")
        .and_then(Value::as_str)
        .filter(|anchor| !anchor.is_empty())
}

/// Position of a node during a top-down descent.
///
/// `context` is the nearest enclosing `$id`; references found below a node
/// resolve against it rather than against the document root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionContext {
    /// Raw (unescaped) segments from the root to this node.
    pub path: Vec<String>,
    /// Nearest enclosing `$id`, or the caller's base when there is none.
    pub context: String,
}

impl ResolutionContext {
    /// Start a descent at the root with the given base context.
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            path: Vec::new(),
            context: context.into(),
        }
    }

    /// Scope for a node that may carry its own `$id`.
    pub fn with_id(&self, id: Option<&str>) -> Self {
        match id {
            Some(id) => Self {
                path: self.path.clone(),
                context: id.to_string(),
            },
            None => self.clone(),
        }
    }

    /// Scope for a JSON node, picking up its `$id` if it has one.
    pub fn enter(&self, node: &Value) -> Self {
        self.with_id(schema_id(node))
    }

    /// Context of the member `key` of the current node.
    pub fn child(&self, key: impl Into<String>) -> Self {
        let mut path = self.path.clone();
        path.push(key.into());
        Self {
            path,
            context: self.context.clone(),
        }
    }

    /// The current path as a `/`-prefixed JSON Pointer.
    pub fn pointer(&self) -> String {
        crate::pointer::to_pointer(&self.path)
    }
}

/// Options for a bundling session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BundleOptions {
    /// Location of the document being bundled. Relative external references
    /// resolve against it.
    pub origin: Option<String>,
    /// When true, records `x-ext-urls/<hash>` → source location for every
    /// bundled document.
    pub url_map: bool,
    /// How many levels of nested external documents are followed in one pass.
    pub max_depth: usize,
    /// Inline the content behind `externalValue` into `value`.
    pub external_values: bool,
    /// Drop the parts of mounted documents that no reference reaches.
    pub tree_shake: bool,
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            origin: None,
            url_map: false,
            max_depth: 32,
            external_values: true,
            tree_shake: false,
        }
    }
}

impl BundleOptions {
    /// Create options with defaults (no origin, no url map, depth 32).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the origin relative references resolve against.
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Toggle the `x-ext-urls` mapping.
    pub fn url_map(mut self, url_map: bool) -> Self {
        self.url_map = url_map;
        self
    }

    /// Limit nesting of external documents.
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Toggle `externalValue` inlining.
    pub fn external_values(mut self, external_values: bool) -> Self {
        self.external_values = external_values;
        self
    }

    pub fn tree_shake(mut self, tree_shake: bool) -> Self {
        self.tree_shake = tree_shake;
        self
    }
}

/// Options for rendering a graph to JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializeOptions {
    /// Pointer the rendered root lives at, e.g. `/components/schemas`.
    /// A leading `#` is accepted and dropped.
    pub prefix: String,
}

impl SerializeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root all emitted `$ref` markers under `prefix`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.prefix = prefix.strip_prefix('#').unwrap_or(&prefix).to_string();
        self
    }
}

/// Options for stripping wrapper layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnwrapOptions {
    /// `Some(0)` unwraps only the top value; `None` descends without limit.
    pub depth: Option<usize>,
}

impl UnwrapOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn http_methods_case_insensitive() {
        assert!(is_http_method("get"));
        assert!(is_http_method("PATCH"));
        assert!(!is_http_method("x-internal"));
        assert!(!is_http_method("parameters"));
    }

    #[test]
    fn schema_id_ignores_non_strings() {
        assert_eq!(schema_id(&json!({ "$id": "https://a" })), Some("https://a"));
        assert_eq!(schema_id(&json!({ "$id": 123 })), None);
        assert_eq!(schema_id(&json!({ "$id": null })), None);
        assert_eq!(schema_id(&json!({ "$id": "" })), Some(""));
        assert_eq!(schema_id(&json!("string")), None);
    }

    #[test]
    fn context_inherits_unless_id() {
        let root = ResolutionContext::new("https://root");
        let child = root.child("definitions").child("user");
        assert_eq!(child.context, "https://root");
        assert_eq!(child.pointer(), "/definitions/user");

        let scoped = child.enter(&json!({ "$id": "https://user" }));
        assert_eq!(scoped.context, "https://user");
        assert_eq!(scoped.child("a").context, "https://user");

        let ignored = child.enter(&json!({ "$id": 42 }));
        assert_eq!(ignored.context, "https://root");

        let emptied = child.enter(&json!({ "$id": "" }));
        assert_eq!(emptied.context, "");
    }

    #[test]
    fn bundle_options_from_config() {
        let options: BundleOptions =
            serde_json::from_value(json!({ "urlMap": true, "origin": "api.json", "treeShake": true })).unwrap();
        assert!(options.url_map);
        assert!(options.tree_shake);
        assert_eq!(options.origin.as_deref(), Some("api.json"));
        assert_eq!(options.max_depth, 32);
        assert!(options.external_values);
    }

    #[test]
    fn serialize_prefix_strips_hash() {
        assert_eq!(
            SerializeOptions::new().prefix("#/components/schemas").prefix,
            "/components/schemas"
        );
    }
}
