//! Integration tests for chunk export and workspaces.

use std::collections::HashSet;
use std::fs;
use std::path::Component;

use json_bundle::{
    ChunkExporter, ExportMode, LoaderRegistry, MemoryLoader, Section, Workspace, WORKSPACE_FILE,
};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

fn petstore() -> Value {
    json!({
        "openapi": "3.1.0",
        "info": { "title": "Petstore", "version": "1.0.0" },
        "paths": {
            "/pets": {
                "summary": "Pets",
                "get": { "operationId": "listPets" },
                "post": { "operationId": "createPet" }
            },
            "/pets/{id}": {
                "parameters": [{ "name": "id", "in": "path" }],
                "get": { "operationId": "getPet" },
                "x-internal": true
            }
        },
        "components": {
            "schemas": {
                "Pet": { "type": "object", "properties": { "owner": { "$ref": "#/components/schemas/Owner" } } },
                "Owner": { "type": "object" },
                "a/b": { "type": "string" }
            },
            "responses": {
                "NotFound": { "description": "not found" }
            }
        }
    })
}

mod export {
    use super::*;

    #[test]
    fn shell_holds_only_refs() {
        let exporter = ChunkExporter::new(ExportMode::ssr("docs.example.com"));
        let exported = exporter.export("petstore", &petstore());

        assert_eq!(exported.chunks.len(), 7);
        assert_eq!(
            exported.shell["paths"]["/pets/{id}"]["get"],
            json!({ "$ref": "https://docs.example.com#/petstore/operations/~1pets~1{id}/get" })
        );
        assert_eq!(
            exported.shell["components"]["schemas"]["a/b"],
            json!({ "$ref": "https://docs.example.com#/petstore/components/schemas/a~1b" })
        );
        assert_eq!(exported.shell["paths"]["/pets"]["summary"], "Pets");
        assert_eq!(exported.shell["paths"]["/pets/{id}"]["x-internal"], true);
        assert_eq!(exported.shell["info"]["title"], "Petstore");
    }

    #[test]
    fn round_trip_reproduces_document() {
        for mode in [ExportMode::ssr("example.com"), ExportMode::static_dir("/srv/docs")] {
            let exported = ChunkExporter::new(mode).export("petstore", &petstore());
            let reassembled = exported.reassemble().unwrap();
            assert_eq!(reassembled, petstore());
            // key order survives too
            assert_eq!(
                serde_json::to_string(&reassembled).unwrap(),
                serde_json::to_string(&petstore()).unwrap()
            );
        }
    }

    #[test]
    fn chunk_pointers_address_the_original() {
        let exported = ChunkExporter::new(ExportMode::ssr("example.com")).export("petstore", &petstore());
        let original = petstore();
        for chunk in &exported.chunks {
            assert_eq!(original.pointer(&chunk.pointer), Some(&chunk.content), "{}", chunk.pointer);
        }
        let operations = exported
            .chunks
            .iter()
            .filter(|c| c.section == Section::Operations)
            .count();
        assert_eq!(operations, 3);
    }
}

mod workspace {
    use super::*;

    fn meta() -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert("title".into(), json!("Developer portal"));
        meta
    }

    #[test]
    fn workspace_document_lists_shells() {
        let mut workspace = Workspace::new(ExportMode::ssr("example.com")).with_meta(meta());
        workspace.add_document("petstore", &petstore());

        let document = workspace.workspace_document();
        assert_eq!(document["title"], "Developer portal");
        assert_eq!(
            document["documents"]["petstore"]["components"]["schemas"]["Owner"]["$ref"],
            "https://example.com#/petstore/components/schemas/Owner"
        );
    }

    #[test]
    fn get_reads_chunks_by_pointer() {
        let mut workspace = Workspace::new(ExportMode::ssr("example.com"));
        workspace.add_document("petstore", &petstore());

        assert_eq!(
            workspace.get("#/petstore/operations/~1pets~1{id}/get"),
            Some(&json!({ "operationId": "getPet" }))
        );
        assert_eq!(
            workspace.get("#/petstore/components/schemas/a~1b"),
            Some(&json!({ "type": "string" }))
        );
        assert_eq!(workspace.get("#/petstore/components/schemas/Missing"), None);
        assert_eq!(workspace.get("#/other/components/schemas/Pet"), None);
        assert_eq!(workspace.get("#/petstore/info"), None);
    }

    #[test]
    fn static_export_writes_layout() {
        let dir = TempDir::new().unwrap();
        let mut workspace = Workspace::new(ExportMode::static_dir(dir.path())).with_meta(meta());
        workspace.add_document("petstore", &petstore());
        workspace.write_chunks().unwrap();

        let index: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(WORKSPACE_FILE)).unwrap()).unwrap();
        assert_eq!(index["title"], "Developer portal");

        let chunk = dir.path().join("chunks/petstore/operations/~1pets/post.json");
        let content: Value = serde_json::from_str(&fs::read_to_string(&chunk).unwrap()).unwrap();
        assert_eq!(content, json!({ "operationId": "createPet" }));

        let target = index["documents"]["petstore"]["paths"]["/pets"]["post"]["$ref"]
            .as_str()
            .unwrap();
        assert_eq!(target, format!("{}#", chunk.display()));

        assert!(dir
            .path()
            .join("chunks/petstore/components/responses/NotFound.json")
            .exists());
    }

    #[test]
    fn static_export_is_rerunnable() {
        let dir = TempDir::new().unwrap();
        let mut workspace = Workspace::new(ExportMode::static_dir(dir.path()));
        workspace.add_document("petstore", &petstore());

        workspace.write_chunks().unwrap();
        let first = fs::read_to_string(dir.path().join(WORKSPACE_FILE)).unwrap();
        workspace.write_chunks().unwrap();
        let second = fs::read_to_string(dir.path().join(WORKSPACE_FILE)).unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn add_source_bundles_before_export() {
        let loaders = LoaderRegistry::new().with(
            MemoryLoader::new()
                .with("api.json", json!({ "components": { "schemas": { "Tag": { "$ref": "tag.json" } } } }))
                .with("tag.json", json!({ "type": "string" })),
        );
        let mut workspace = Workspace::new(ExportMode::ssr("example.com"));

        let exported = workspace.add_source("api", "api.json", &loaders).await.unwrap();
        assert!(exported.shell.get("x-ext").is_some());

        let tag = workspace.get("#/api/components/schemas/Tag").unwrap();
        assert!(tag["$ref"].as_str().unwrap().starts_with("#/x-ext/"));

        assert!(workspace.add_source("broken", "missing.json", &loaders).await.is_err());
        assert!(workspace.document("broken").is_none());
    }

    #[test]
    fn dot_keys_get_their_own_files() {
        let dir = TempDir::new().unwrap();
        let document = json!({
            "paths": {
                "..": { "get": { "operationId": "up" } },
                ".": { "get": { "operationId": "here" } }
            },
            "components": {
                "..": { "get": { "type": "string" } }
            }
        });
        let mut workspace = Workspace::new(ExportMode::static_dir(dir.path()));
        workspace.add_document("api", &document);
        workspace.write_chunks().unwrap();

        let exported = workspace.document("api").unwrap();
        let files: Vec<_> = exported.chunks.iter().filter_map(|c| c.file.clone()).collect();
        assert_eq!(files.len(), 3);
        for file in &files {
            let relative = file.strip_prefix(dir.path()).unwrap();
            assert!(
                relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_))),
                "{}",
                file.display()
            );
            assert!(file.exists(), "{}", file.display());
        }
        assert_eq!(files.iter().collect::<HashSet<_>>().len(), 3);
        // the workspace index is not clobbered by a chunk
        let index: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(WORKSPACE_FILE)).unwrap()).unwrap();
        assert!(index["documents"]["api"].is_object());

        for chunk in &exported.chunks {
            let on_disk: Value =
                serde_json::from_str(&fs::read_to_string(chunk.file.as_ref().unwrap()).unwrap()).unwrap();
            assert_eq!(on_disk, chunk.content);
        }
        assert_eq!(exported.reassemble().unwrap(), document);
    }

    #[test]
    fn asyncapi_operations_are_served_by_id() {
        let document = json!({
            "asyncapi": "3.0.0",
            "channels": { "user": { "address": "users.{id}" } },
            "operations": { "onUserSignup": { "action": "receive" } },
            "components": { "messages": { "UserSignedUp": { "payload": { "type": "object" } } } }
        });

        let mut ssr = Workspace::new(ExportMode::ssr("example.com"));
        ssr.add_document("events", &document);
        assert_eq!(
            ssr.get("#/events/operations/onUserSignup"),
            Some(&json!({ "action": "receive" }))
        );
        assert!(ssr.get("#/events/components/messages/UserSignedUp").is_some());
        assert_eq!(ssr.get("#/events/operations/onUserSignup/get"), None);

        let dir = TempDir::new().unwrap();
        let mut on_disk = Workspace::new(ExportMode::static_dir(dir.path()));
        on_disk.add_document("events", &document);
        on_disk.write_chunks().unwrap();
        let chunk = dir.path().join("chunks/events/operations/onUserSignup.json");
        let content: Value = serde_json::from_str(&fs::read_to_string(&chunk).unwrap()).unwrap();
        assert_eq!(content, json!({ "action": "receive" }));
        assert_eq!(
            on_disk.workspace_document()["documents"]["events"]["operations"]["onUserSignup"]["$ref"],
            format!("{}#", chunk.display())
        );
    }
}
