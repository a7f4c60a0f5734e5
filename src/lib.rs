//! JSON reference resolution and bundling
//!
//! Resolves `$ref`s in large, possibly circular, JSON API description documents
//! (OpenAPI, JSON Schema) and turns them into self-contained artifacts.
//!
//! - [`Bundler`] fetches external references through pluggable loaders (JSON
//!   or YAML) and stores each referenced document once under `x-ext`, for a
//!   whole document or one subtree of it.
//! - [`serialize`] renders an object graph with cycles and shared nodes as plain
//!   JSON, replacing repeats with `$ref` markers; [`inflate`] reverses it.
//! - [`SchemaIndexer`] and [`ReferenceResolver`] canonicalize references against
//!   `$id` and `$anchor` locations.
//! - [`ChunkExporter`] and [`Workspace`] split bundled documents into
//!   per-component and per-operation chunks.
//! - [`unwrap`] strips transparent wrapper layers from a graph.
//!
//! # Example
//!
//! ```
//! use json_bundle::{location_hash, Bundler, LoaderRegistry, MemoryLoader};
//! use serde_json::json;
//!
//! let loaders = LoaderRegistry::new().with(
//!     MemoryLoader::new().with("schemas/user.json", json!({ "definitions": { "User": { "type": "object" } } })),
//! );
//! let mut document = json!({
//!     "components": {
//!         "schemas": { "User": { "$ref": "schemas/user.json#/definitions/User" } }
//!     }
//! });
//!
//! let report = futures::executor::block_on(Bundler::new(loaders).bundle(&mut document));
//! assert!(report.is_complete());
//!
//! let hash = location_hash("schemas/user.json");
//! assert_eq!(
//!     document["components"]["schemas"]["User"]["$ref"],
//!     format!("#/x-ext/{}/definitions/User", hash)
//! );
//! ```
//!
//! # Circular graphs
//!
//! ```
//! use json_bundle::{serialize_to_value, Graph, Node, SerializeOptions};
//! use serde_json::json;
//!
//! let mut graph = Graph::new();
//! let user = graph.object();
//! graph.set(user, "type", "object");
//! graph.set(user, "parent", user);
//!
//! let rendered = serialize_to_value(&graph, &Node::Handle(user), &SerializeOptions::default());
//! assert_eq!(rendered, json!({ "type": "object", "parent": { "$ref": "#" } }));
//! ```

mod bundler;
mod chunks;
mod error;
mod graph;
mod loader;
mod pointer;
mod resolver;
mod serialize;
mod types;
mod unwrap;
mod walker;

pub use bundler::{
    hook, location_hash, BundleFailure, BundleReport, Bundler, Hook, LifecycleEvent,
    LifecyclePlugin, NodeContext,
};
pub use chunks::{
    Chunk, ChunkExporter, ExportMode, ExportedDocument, Section, Workspace, DEFAULT_ASSETS_DIR,
    WORKSPACE_FILE,
};
pub use error::{BundleError, ExportError, LoaderError, NodeError, ReferenceError};
pub use graph::{Graph, Node, NodeId, Slot, WrapperKind};
pub use loader::{
    Loader, LoaderRegistry, MemoryLoader, ParseYaml, ReadFiles, ResolutionCache, SharedFetch,
};
pub use pointer::{
    canonicalize, escape, is_local_ref, is_remote_url, join_pointer, parse_pointer,
    prefix_internal_ref, resolve_reference_path, split_ref, to_pointer, unescape,
};
pub use resolver::{navigate, LocationMap, ReferenceResolver, SchemaIndexer};
pub use serialize::{inflate, serialize, serialize_to_value, Rendered};
pub use types::{
    is_http_method, schema_anchor, schema_id, BundleOptions, ResolutionContext, SerializeOptions,
    UnwrapOptions, EXTERNAL_KEY, EXTERNAL_URLS_KEY, GLOBAL_KEY, HTTP_METHODS, REF_KEY, STATUS_KEY,
};
pub use unwrap::unwrap;
pub use walker::{GraphWalker, Key, Member, OwnedKey, PathIndex, Visitor};

#[cfg(feature = "remote")]
pub use loader::FetchUrls;
