//! Splitting bundled documents into independently fetchable chunks.
//!
//! Every `components.<type>.<name>` entry and every operation is moved out of
//! the document into a chunk and replaced by `{ "$ref": target }`. OpenAPI
//! operations live at `paths.<path>.<method>`, AsyncAPI ones at
//! `operations.<id>`. What remains is the shell. Targets are either fragments
//! of one server-rendered workspace document (SSR) or JSON files on disk
//! (static).

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::bundler::Bundler;
use crate::error::{BundleError, ExportError};
use crate::loader::LoaderRegistry;
use crate::pointer::{escape, parse_pointer, to_pointer};
use crate::types::{is_http_method, REF_KEY};

/// Name of the workspace index written next to the chunks in static mode.
pub const WORKSPACE_FILE: &str = "scalar-workspace.json";

/// Static export directory when none is given.
pub const DEFAULT_ASSETS_DIR: &str = "assets";

/// Where chunk targets point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportMode {
    /// Fragments of a workspace document served at `base_url`.
    Ssr { base_url: String },
    /// Files under `directory`.
    Static { directory: PathBuf },
}

impl ExportMode {
    /// SSR mode. `https://` is assumed when `base_url` has no scheme.
    pub fn ssr(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let base_url = if base_url.contains("://") {
            base_url
        } else {
            format!("https://{}", base_url)
        };
        ExportMode::Ssr {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn static_dir(directory: impl Into<PathBuf>) -> Self {
        ExportMode::Static {
            directory: directory.into(),
        }
    }

    /// Static mode writing to [`DEFAULT_ASSETS_DIR`].
    pub fn static_assets() -> Self {
        Self::static_dir(DEFAULT_ASSETS_DIR)
    }
}

/// Which part of a document a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Components,
    Operations,
}

impl Section {
    pub fn as_str(self) -> &'static str {
        match self {
            Section::Components => "components",
            Section::Operations => "operations",
        }
    }
}

/// One piece cut out of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Name of the document the chunk belongs to.
    pub document: String,
    pub section: Section,
    /// Component type (`schemas`, `responses`, ...), raw path (`/users/{id}`)
    /// or AsyncAPI operation id.
    pub group: String,
    /// Component name or HTTP method, as written in the document. `None` for
    /// AsyncAPI operations.
    pub key: Option<String>,
    /// Pointer of the entry within the original document.
    pub pointer: String,
    /// Synthetic `$ref` that replaces the entry in the shell.
    pub target: String,
    /// File the chunk is written to, in static mode.
    pub file: Option<PathBuf>,
    pub content: Value,
}

/// A document split into its shell and chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedDocument {
    pub name: String,
    pub shell: Value,
    pub chunks: Vec<Chunk>,
}

impl ExportedDocument {
    /// Rebuild the original document from the shell and its own chunks.
    pub fn reassemble(&self) -> Result<Value, ExportError> {
        let store: IndexMap<&str, &Value> = self
            .chunks
            .iter()
            .map(|chunk| (chunk.target.as_str(), &chunk.content))
            .collect();
        self.reassemble_with(|target| store.get(target).copied())
    }

    /// Rebuild the original document, fetching each chunk by its target.
    pub fn reassemble_with<'a, F>(&self, lookup: F) -> Result<Value, ExportError>
    where
        F: Fn(&str) -> Option<&'a Value>,
    {
        let mut document = self.shell.clone();
        for chunk in &self.chunks {
            let content = lookup(&chunk.target).ok_or_else(|| ExportError::MissingChunk {
                target: chunk.target.clone(),
            })?;
            if let Some(slot) = document.pointer_mut(&chunk.pointer) {
                *slot = content.clone();
            }
        }
        Ok(document)
    }
}

/// Cuts documents into chunks for one [`ExportMode`].
#[derive(Debug, Clone)]
pub struct ChunkExporter {
    mode: ExportMode,
}

impl ChunkExporter {
    pub fn new(mode: ExportMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> &ExportMode {
        &self.mode
    }

    /// Target `$ref` for an entry, plus the file it lives in for static mode.
    pub fn target(&self, document: &str, section: Section, group: &str, key: &str) -> (String, Option<PathBuf>) {
        self.target_of(document, section, &[group, key])
    }

    /// Target of an AsyncAPI operation, addressed by its id alone.
    pub fn operation_target(&self, document: &str, operation_id: &str) -> (String, Option<PathBuf>) {
        self.target_of(document, Section::Operations, &[operation_id])
    }

    fn target_of(&self, document: &str, section: Section, entry: &[&str]) -> (String, Option<PathBuf>) {
        let mut segments = vec![escape(document), section.as_str().to_string()];
        segments.extend(entry.iter().map(|segment| escape(segment)));
        match &self.mode {
            ExportMode::Ssr { base_url } => (format!("{}#/{}", base_url, segments.join("/")), None),
            ExportMode::Static { directory } => {
                let file = chunk_file(directory, &segments);
                (format!("{}#", file.display()), Some(file))
            }
        }
    }

    /// Split `document` into a shell and its chunks.
    ///
    /// Component groups that are not objects, and path-item members that are
    /// not HTTP methods, stay inline in the shell. A document with a string
    /// `asyncapi` field has its `operations` chunked instead of `paths`.
    pub fn export(&self, name: &str, document: &Value) -> ExportedDocument {
        let mut shell = document.clone();
        let mut chunks = Vec::new();

        if let Some(Value::Object(groups)) = shell.get_mut("components") {
            for (group, entries) in groups.iter_mut() {
                let Value::Object(entries) = entries else {
                    continue;
                };
                for (key, entry) in entries.iter_mut() {
                    let pointer = to_pointer(&["components", group.as_str(), key.as_str()]);
                    let entry_key = [group.as_str(), key.as_str()];
                    chunks.push(self.cut(name, Section::Components, &entry_key, pointer, entry));
                }
            }
        }

        if is_asyncapi(document) {
            if let Some(Value::Object(operations)) = shell.get_mut("operations") {
                for (id, operation) in operations.iter_mut() {
                    let pointer = to_pointer(&["operations", id.as_str()]);
                    chunks.push(self.cut(name, Section::Operations, &[id.as_str()], pointer, operation));
                }
            }
        } else if let Some(Value::Object(paths)) = shell.get_mut("paths") {
            for (path, item) in paths.iter_mut() {
                let Value::Object(item) = item else {
                    continue;
                };
                for (method, operation) in item.iter_mut() {
                    if !is_http_method(method) {
                        continue;
                    }
                    let pointer = to_pointer(&["paths", path.as_str(), method.as_str()]);
                    let entry_key = [path.as_str(), method.as_str()];
                    chunks.push(self.cut(name, Section::Operations, &entry_key, pointer, operation));
                }
            }
        }

        debug!(document = name, chunks = chunks.len(), "exported document");
        ExportedDocument {
            name: name.to_string(),
            shell,
            chunks,
        }
    }

    fn cut(&self, document: &str, section: Section, entry: &[&str], pointer: String, value: &mut Value) -> Chunk {
        let (target, file) = self.target_of(document, section, entry);
        let mut reference = Map::new();
        reference.insert(REF_KEY.to_string(), Value::String(target.clone()));
        let content = std::mem::replace(value, Value::Object(reference));
        Chunk {
            document: document.to_string(),
            section,
            group: entry.first().map(|group| group.to_string()).unwrap_or_default(),
            key: entry.get(1).map(|key| key.to_string()),
            pointer,
            target,
            file,
            content,
        }
    }
}

fn is_asyncapi(document: &Value) -> bool {
    document.get("asyncapi").is_some_and(Value::is_string)
}

/// `{directory}/chunks/{document}/{section}/.../{last}.json`.
fn chunk_file(directory: &Path, segments: &[String]) -> PathBuf {
    let mut file = directory.join("chunks");
    if let Some((last, dirs)) = segments.split_last() {
        for (index, segment) in dirs.iter().enumerate() {
            // the section name is ours and needs no encoding
            if index == 1 {
                file.push(segment);
            } else {
                file.push(file_segment(segment));
            }
        }
        file.push(format!("{}.json", file_segment(last)));
    }
    file
}

/// File-name form of an escaped pointer segment.
///
/// `.`, `..` and the empty segment would leave their directory level, so they
/// are spelled with `%` escapes. A literal `%` becomes `%25`, which keeps every
/// key on its own file.
fn file_segment(segment: &str) -> String {
    match segment {
        "" => "%00".to_string(),
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        other => other.replace('%', "%25"),
    }
}

/// A set of exported documents sharing one export mode.
#[derive(Debug, Clone)]
pub struct Workspace {
    exporter: ChunkExporter,
    meta: Map<String, Value>,
    documents: IndexMap<String, ExportedDocument>,
}

impl Workspace {
    pub fn new(mode: ExportMode) -> Self {
        Self {
            exporter: ChunkExporter::new(mode),
            meta: Map::new(),
            documents: IndexMap::new(),
        }
    }

    /// Top-level fields of the workspace document (title, theme, ...).
    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = meta;
        self
    }

    /// Export a document into the workspace, replacing any document of the
    /// same name.
    pub fn add_document(&mut self, name: &str, document: &Value) -> &ExportedDocument {
        let exported = self.exporter.export(name, document);
        self.documents.insert(name.to_string(), exported);
        &self.documents[name]
    }

    /// Load `source`, bundle its external references, and add it.
    pub async fn add_source(
        &mut self,
        name: &str,
        source: &str,
        loaders: &LoaderRegistry,
    ) -> Result<&ExportedDocument, BundleError> {
        let bundler = Bundler::new(loaders.clone());
        let (document, report) = match bundler.bundle_source(source).await {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(document = name, source, error = %err, "cannot load workspace document");
                return Err(err);
            }
        };
        if !report.failures.is_empty() {
            warn!(document = name, failures = report.failures.len(), "document has unresolved references");
        }
        Ok(self.add_document(name, &document))
    }

    pub fn document(&self, name: &str) -> Option<&ExportedDocument> {
        self.documents.get(name)
    }

    pub fn documents(&self) -> impl Iterator<Item = &ExportedDocument> {
        self.documents.values()
    }

    /// `{ ...meta, "documents": { name: shell } }`.
    pub fn workspace_document(&self) -> Value {
        let mut out = self.meta.clone();
        let shells: Map<String, Value> = self
            .documents
            .iter()
            .map(|(name, exported)| (name.clone(), exported.shell.clone()))
            .collect();
        out.insert("documents".to_string(), Value::Object(shells));
        Value::Object(out)
    }

    /// Look up a chunk by its workspace pointer:
    /// `#/{doc}/components/{type}/{name}`, `#/{doc}/operations/{path}/{method}`
    /// or, for AsyncAPI documents, `#/{doc}/operations/{id}`.
    pub fn get(&self, pointer: &str) -> Option<&Value> {
        let segments = parse_pointer(pointer);
        let (document, section, group, key) = match segments.as_slice() {
            [document, section, group, key] => (document, section, group, Some(key)),
            [document, section, group] => (document, section, group, None),
            _ => return None,
        };
        let section = match section.as_str() {
            "components" => Section::Components,
            "operations" => Section::Operations,
            _ => return None,
        };
        self.documents
            .get(document)?
            .chunks
            .iter()
            .find(|c| c.section == section && &c.group == group && c.key.as_ref() == key)
            .map(|c| &c.content)
    }

    /// Write the workspace document and every chunk to the static directory.
    ///
    /// Existing files are overwritten, so exporting twice gives the same tree.
    #[instrument(skip(self))]
    pub fn write_chunks(&self) -> Result<(), ExportError> {
        let ExportMode::Static { directory } = self.exporter.mode() else {
            return Err(ExportError::NotStatic);
        };

        write_json(&directory.join(WORKSPACE_FILE), &self.workspace_document())?;
        let mut written = 0;
        for chunk in self.documents.values().flat_map(|d| &d.chunks) {
            if let Some(file) = &chunk.file {
                write_json(file, &chunk.content)?;
                written += 1;
            }
        }
        debug!(directory = %directory.display(), chunks = written, "wrote chunks");
        Ok(())
    }
}

fn write_json(path: &Path, value: &Value) -> Result<(), ExportError> {
    let io = |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io)?;
    }
    let body = serde_json::to_vec_pretty(value).map_err(|source| ExportError::Serialize { source })?;
    fs::write(path, body).map_err(io)
}
