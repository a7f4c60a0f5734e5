//! Integration tests for reference canonicalization and resolution.

use json_bundle::{
    canonicalize, escape, parse_pointer, to_pointer, unescape, Graph, LocationMap, Node,
    ReferenceError, ReferenceResolver, SchemaIndexer,
};
use serde_json::{json, Value};

fn petstore() -> Value {
    json!({
        "$id": "https://example.com/petstore",
        "components": {
            "schemas": {
                "Pet": {
                    "$anchor": "pet",
                    "type": "object",
                    "properties": { "owner": { "$ref": "#owner" } }
                },
                "Owner": { "$anchor": "owner", "type": "object" },
                "Schema1": {
                    "$id": "schema.json",
                    "definitions": {
                        "User": { "$anchor": "user", "type": "object" }
                    }
                }
            }
        },
        "paths": {
            "/pets/{id}": { "get": { "operationId": "getPet" } }
        }
    })
}

// === Pointer Escaping Tests ===

mod escaping {
    use super::*;

    #[test]
    fn tilde_and_slash_round_trip() {
        assert_eq!(escape("a~/b"), "a~0~1b");
        assert_eq!(unescape(&escape("a~/b")), "a~/b");
    }

    #[test]
    fn openapi_paths_are_single_segments() {
        let pointer = to_pointer(&["paths", "/pets/{id}", "get"]);
        assert_eq!(pointer, "/paths/~1pets~1{id}/get");
        assert_eq!(parse_pointer(&pointer), vec!["paths", "/pets/{id}", "get"]);
        assert_eq!(petstore().pointer(&pointer), Some(&json!({ "operationId": "getPet" })));
    }
}

// === Two-Phase Protocol Tests ===

mod two_phase {
    use super::*;

    #[test]
    fn external_ref_needs_index() {
        let mut map = LocationMap::new();
        let reference = "schema.json#/definitions/User";
        assert_eq!(
            canonicalize(reference, "", &map),
            Err(ReferenceError::UnknownExternalReference {
                reference: reference.to_string()
            })
        );

        map.insert("schema.json", "/components/schemas/Schema1");
        assert_eq!(
            canonicalize(reference, "", &map).unwrap(),
            "/components/schemas/Schema1/definitions/User"
        );
    }

    #[test]
    fn default_resolver_never_silently_misses() {
        let resolver = ReferenceResolver::default();
        let doc = petstore();
        assert!(resolver.resolve(&doc, "schema.json#/definitions/User", "").is_err());
        assert!(resolver.resolve(&doc, "#pet", "https://example.com/petstore").is_err());
        assert_eq!(resolver.resolve(&doc, "", ""), Err(ReferenceError::EmptyReference));
    }

    #[test]
    fn indexed_document_resolves() {
        let doc = petstore();
        let mut indexer = SchemaIndexer::new();
        indexer.index(&doc, "");
        let resolver = indexer.finish();

        assert_eq!(
            resolver.resolve(&doc, "schema.json#/definitions/User", "").unwrap(),
            &json!({ "$anchor": "user", "type": "object" })
        );
        assert_eq!(
            resolver.resolve(&doc, "#owner", "https://example.com/petstore").unwrap()["$anchor"],
            "owner"
        );
        assert_eq!(
            resolver.canonicalize("#user", "schema.json").unwrap(),
            "components/schemas/Schema1/definitions/User"
        );
        // anchors are scoped to their nearest $id
        assert!(matches!(
            resolver.canonicalize("#user", "https://example.com/petstore"),
            Err(ReferenceError::UnknownAnchor { .. })
        ));
    }

    #[test]
    fn multiple_documents_share_one_index() {
        let root = json!({ "components": { "schemas": {} } });
        let external = json!({ "definitions": { "Tag": { "$anchor": "tag" } } });

        let mut indexer = SchemaIndexer::new();
        indexer
            .index(&root, "")
            .register("tags.json", "x-ext/abc1234")
            .index_at(&external, "tags.json", &["x-ext", "abc1234"]);
        let resolver = indexer.finish();

        assert_eq!(
            resolver.canonicalize("tags.json#tag", "").unwrap(),
            "x-ext/abc1234/definitions/Tag"
        );
        assert_eq!(
            resolver.canonicalize("tags.json#/definitions", "").unwrap(),
            "x-ext/abc1234/definitions"
        );
    }

    #[test]
    fn first_registration_wins() {
        let doc = json!({
            "a": { "$id": "dup.json" },
            "b": { "$id": "dup.json" }
        });
        let mut indexer = SchemaIndexer::new();
        indexer.index(&doc, "");
        assert_eq!(indexer.locations().get("dup.json"), Some("a"));
    }
}

// === Graph Indexing Tests ===

mod graph_index {
    use super::*;

    #[test]
    fn cyclic_graph_indexes_each_node_once() {
        let mut graph = Graph::new();
        let root = graph.object();
        let schemas = graph.object();
        let user = graph.object();
        graph.set(root, "$id", "https://example.com/root");
        graph.set(root, "schemas", schemas);
        graph.set(schemas, "User", user);
        graph.set(user, "$id", "https://example.com/user");
        graph.set(user, "$anchor", "user");
        graph.set(user, "friends", user);
        graph.set(user, "root", root);

        let mut indexer = SchemaIndexer::new();
        indexer.index_graph(&graph, &Node::Handle(root), "");
        let resolver = indexer.finish();

        assert_eq!(resolver.locations().len(), 3);
        assert_eq!(
            resolver.canonicalize("https://example.com/user#user", "").unwrap(),
            "schemas/User"
        );
        assert_eq!(resolver.canonicalize("https://example.com/root", "").unwrap(), "");
    }
}
