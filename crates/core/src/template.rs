//! Workflow template engine.
//!
//! Templates are worker job graphs in API JSON format with `{{name}}`
//! placeholders, described by a `manifest.yaml` naming each template's
//! supported model families, img2img/adapter flags, and parameter defaults.
//!
//! Substitution runs in two phases over a structural clone: whole-value
//! placeholders are replaced by the typed parameter value (numbers stay
//! numbers), placeholders embedded inside strings are spliced in textually.
//! Any placeholder without a value fails the build.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::types::{AdapterSpec, ModelFamily};

/// Graph node classes recognized as the base model loader during adapter
/// injection.
const MODEL_LOADER_CLASSES: &[&str] = &["CheckpointLoaderSimple", "CheckpointLoader", "UNETLoader"];

/// Graph node class inserted for each adapter.
const ADAPTER_LOADER_CLASS: &str = "LoraLoader";

/// One manifest entry describing a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub model_families: Vec<String>,
    #[serde(default)]
    pub supports_img2img: bool,
    #[serde(default)]
    pub supports_adapters: bool,
    #[serde(default)]
    pub default_params: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    templates: Vec<TemplateEntry>,
}

/// Loads and instantiates parameterized job-graph templates.
pub struct TemplateEngine {
    templates_dir: PathBuf,
    entries: Vec<TemplateEntry>,
    graphs: HashMap<String, Value>,
}

impl TemplateEngine {
    pub fn new(templates_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
            entries: Vec::new(),
            graphs: HashMap::new(),
        }
    }

    /// Read `manifest.yaml` and every template JSON it names.
    ///
    /// A manifest entry whose JSON file is missing is skipped with a warning;
    /// an unparsable manifest or template is a configuration error.
    pub fn load_all(&mut self) -> CoreResult<()> {
        let manifest_path = self.templates_dir.join("manifest.yaml");
        let raw = fs::read_to_string(&manifest_path).map_err(|e| {
            CoreError::Config(format!(
                "cannot read template manifest {}: {e}",
                manifest_path.display()
            ))
        })?;
        let manifest: Manifest = serde_yaml::from_str(&raw)
            .map_err(|e| CoreError::Config(format!("invalid template manifest: {e}")))?;

        for entry in manifest.templates {
            let json_path = self.templates_dir.join(format!("{}.json", entry.name));
            let raw = match fs::read_to_string(&json_path) {
                Ok(raw) => raw,
                Err(_) => {
                    tracing::warn!(
                        template = %entry.name,
                        path = %json_path.display(),
                        "Template named in manifest but file not found, skipping",
                    );
                    continue;
                }
            };
            let graph: Value = serde_json::from_str(&raw).map_err(|e| {
                CoreError::Config(format!("template '{}' is not valid JSON: {e}", entry.name))
            })?;
            tracing::info!(template = %entry.name, "Loaded workflow template");
            self.graphs.insert(entry.name.clone(), graph);
            self.entries.push(entry);
        }

        Ok(())
    }

    /// Manifest metadata for every loaded template, in manifest order.
    pub fn entries(&self) -> &[TemplateEntry] {
        &self.entries
    }

    /// Select a template by requirements: the first manifest entry matching
    /// the model family whose flags cover the request wins.
    pub fn select(
        &self,
        family: ModelFamily,
        needs_img2img: bool,
        needs_adapters: bool,
    ) -> CoreResult<&str> {
        let family_tag = family.capability_tag();
        for entry in &self.entries {
            let family_ok = entry
                .model_families
                .iter()
                .any(|f| f == family_tag || f == "any");
            if !family_ok {
                continue;
            }
            if needs_img2img && !entry.supports_img2img {
                continue;
            }
            if needs_adapters && !entry.supports_adapters {
                continue;
            }
            return Ok(&entry.name);
        }
        Err(CoreError::NotFound {
            entity: "template",
            id: format!("{family_tag} (img2img={needs_img2img}, adapters={needs_adapters})"),
        })
    }

    /// Build a concrete job graph from a template and parameter values.
    ///
    /// Manifest defaults fill in anything the caller omits. Unresolved
    /// placeholders fail with [`CoreError::MissingParameter`].
    pub fn build(&self, name: &str, params: &HashMap<String, Value>) -> CoreResult<Value> {
        let graph = self.graphs.get(name).ok_or_else(|| CoreError::NotFound {
            entity: "template",
            id: name.to_string(),
        })?;
        let entry = self
            .entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| CoreError::NotFound {
                entity: "template",
                id: name.to_string(),
            })?;

        let mut values = entry.default_params.clone();
        for (k, v) in params {
            values.insert(k.clone(), v.clone());
        }

        substitute(graph, &values)
    }

    /// Splice an adapter chain into a built graph.
    ///
    /// Each adapter becomes a loader node wired between the base model
    /// loader and its downstream consumers, in order. An empty adapter list
    /// is a no-op; a template whose manifest forbids adapters fails with
    /// [`CoreError::UnsupportedAdapter`].
    pub fn inject_adapters(
        &self,
        name: &str,
        graph: Value,
        adapters: &[AdapterSpec],
    ) -> CoreResult<Value> {
        if adapters.is_empty() {
            return Ok(graph);
        }
        let entry = self
            .entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| CoreError::NotFound {
                entity: "template",
                id: name.to_string(),
            })?;
        if !entry.supports_adapters {
            return Err(CoreError::UnsupportedAdapter(name.to_string()));
        }
        inject_adapter_chain(graph, adapters)
    }

    /// The default model filename for a family, used when a request names
    /// none.
    pub fn default_model(family: ModelFamily) -> &'static str {
        match family {
            ModelFamily::Sd15 => "v1-5-pruned-emaonly.safetensors",
            ModelFamily::Sdxl | ModelFamily::Pony | ModelFamily::Illustrious => {
                "sd_xl_base_1.0.safetensors"
            }
            ModelFamily::Flux => "flux1-dev-fp8.safetensors",
        }
    }

    /// Construct an engine directly from entries and graphs, for tests.
    pub fn from_parts(entries: Vec<TemplateEntry>, graphs: HashMap<String, Value>) -> Self {
        Self {
            templates_dir: Path::new(".").to_path_buf(),
            entries,
            graphs,
        }
    }
}

/// Phase 2: clone the graph, replacing placeholders with values.
fn substitute(graph: &Value, values: &HashMap<String, Value>) -> CoreResult<Value> {
    match graph {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute(v, values)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items.iter().map(|v| substitute(v, values)).collect(),
        Value::String(s) => substitute_string(s, values),
        other => Ok(other.clone()),
    }
}

/// Replace placeholders within a single string value.
///
/// A string that is exactly one placeholder takes the parameter's typed
/// value; otherwise each embedded placeholder is rendered into the text.
fn substitute_string(s: &str, values: &HashMap<String, Value>) -> CoreResult<Value> {
    if let Some(name) = full_placeholder(s) {
        return values
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::MissingParameter(name.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) if is_placeholder_name(&after[..end]) => {
                let name = &after[..end];
                let value = values
                    .get(name)
                    .ok_or_else(|| CoreError::MissingParameter(name.to_string()))?;
                out.push_str(&render_scalar(value));
                rest = &after[end + 2..];
            }
            _ => {
                // Not a placeholder; keep the braces as literal text.
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn full_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    is_placeholder_name(inner).then_some(inner)
}

fn is_placeholder_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Render a parameter value for embedding inside a string.
fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Insert adapter loader nodes between the model loader and its consumers.
fn inject_adapter_chain(mut graph: Value, adapters: &[AdapterSpec]) -> CoreResult<Value> {
    let obj = graph
        .as_object_mut()
        .ok_or_else(|| CoreError::Internal("job graph is not an object".to_string()))?;

    let loader_id = match obj.iter().find_map(|(id, node)| {
        node.get("class_type")
            .and_then(Value::as_str)
            .filter(|c| MODEL_LOADER_CLASSES.contains(c))
            .map(|_| id.clone())
    }) {
        Some(id) => id,
        None => {
            tracing::warn!("No model loader node in graph, skipping adapter injection");
            return Ok(graph);
        }
    };

    // Collect consumers of the loader's model (output 0) and clip (output 1)
    // edges before mutating the graph.
    let mut model_consumers: Vec<(String, String)> = Vec::new();
    let mut clip_consumers: Vec<(String, String)> = Vec::new();
    for (node_id, node) in obj.iter() {
        let Some(inputs) = node.get("inputs").and_then(Value::as_object) else {
            continue;
        };
        for (input_key, input_val) in inputs {
            let Some(edge) = input_val.as_array() else {
                continue;
            };
            if edge.len() != 2 || edge[0].as_str() != Some(loader_id.as_str()) {
                continue;
            }
            match edge[1].as_u64() {
                Some(0) => model_consumers.push((node_id.clone(), input_key.clone())),
                Some(1) => clip_consumers.push((node_id.clone(), input_key.clone())),
                _ => {}
            }
        }
    }

    // Allocate fresh ids well past the existing numeric range.
    let mut next_id = obj
        .keys()
        .filter_map(|k| k.parse::<u64>().ok())
        .max()
        .unwrap_or(0)
        + 100;

    let mut model_source = serde_json::json!([loader_id, 0]);
    let mut clip_source = serde_json::json!([loader_id, 1]);

    for adapter in adapters {
        let adapter_node_id = next_id.to_string();
        next_id += 1;

        obj.insert(
            adapter_node_id.clone(),
            serde_json::json!({
                "class_type": ADAPTER_LOADER_CLASS,
                "inputs": {
                    "lora_name": adapter.name,
                    "strength_model": adapter.strength_model,
                    "strength_clip": adapter.strength_clip,
                    "model": model_source,
                    "clip": clip_source,
                },
            }),
        );

        model_source = serde_json::json!([adapter_node_id, 0]);
        clip_source = serde_json::json!([adapter_node_id, 1]);
    }

    // Rewire original consumers to the tail of the adapter chain.
    for (node_id, input_key) in model_consumers {
        if let Some(inputs) = obj
            .get_mut(&node_id)
            .and_then(|n| n.get_mut("inputs"))
            .and_then(Value::as_object_mut)
        {
            inputs.insert(input_key, model_source.clone());
        }
    }
    for (node_id, input_key) in clip_consumers {
        if let Some(inputs) = obj
            .get_mut(&node_id)
            .and_then(|n| n.get_mut("inputs"))
            .and_then(Value::as_object_mut)
        {
            inputs.insert(input_key, clip_source.clone());
        }
    }

    tracing::debug!(count = adapters.len(), "Injected adapter chain");
    Ok(graph)
}
