//! Shared identifiers and domain types.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of a GPU worker node (from the inventory config).
pub type NodeId = String;
/// Identifier of a user session.
pub type SessionId = String;
/// Identifier of a single generation job.
pub type GenerationId = String;
/// Identifier of a batch of generations submitted together.
pub type BatchId = String;
/// Identifier assigned by a worker to a submitted job graph.
pub type WorkerJobId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Coarse capability/quality ranking of a node.
///
/// Ordering is significant: `draft < standard < quality < premium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Draft,
    Standard,
    Quality,
    Premium,
}

impl Tier {
    /// Numeric rank used by the router's sort keys.
    pub fn rank(self) -> u8 {
        match self {
            Tier::Draft => 0,
            Tier::Standard => 1,
            Tier::Quality => 2,
            Tier::Premium => 3,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tier::Draft => "draft",
            Tier::Standard => "standard",
            Tier::Quality => "quality",
            Tier::Premium => "premium",
        };
        f.write_str(s)
    }
}

/// Classes of generation work, used for routing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    Draft,
    Standard,
    Quality,
    Upscale,
    Flux,
    FluxQuality,
}

impl TaskClass {
    /// Whether the router should prefer high-tier nodes for this class.
    pub fn is_quality_class(self) -> bool {
        matches!(
            self,
            TaskClass::Quality | TaskClass::Upscale | TaskClass::FluxQuality
        )
    }
}

impl fmt::Display for TaskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskClass::Draft => "draft",
            TaskClass::Standard => "standard",
            TaskClass::Quality => "quality",
            TaskClass::Upscale => "upscale",
            TaskClass::Flux => "flux",
            TaskClass::FluxQuality => "flux_quality",
        };
        f.write_str(s)
    }
}

/// Base model families supported by the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Sd15,
    Sdxl,
    Pony,
    Illustrious,
    Flux,
}

impl ModelFamily {
    /// The capability tag a node must declare to run this family.
    pub fn capability_tag(self) -> &'static str {
        match self {
            ModelFamily::Sd15 => "sd15",
            ModelFamily::Sdxl => "sdxl",
            ModelFamily::Pony => "pony",
            ModelFamily::Illustrious => "illustrious",
            ModelFamily::Flux => "flux",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.capability_tag())
    }
}

/// The fixed vocabulary of capability tags a node may declare.
///
/// Inventory entries declaring anything outside this list are rejected at
/// load time.
pub const CAPABILITY_TAGS: &[&str] = &[
    "sd15",
    "sdxl",
    "pony",
    "illustrious",
    "flux",
    "flux_fp8",
    "upscale",
];

/// An adapter (auxiliary model) spliced into the base model's graph at load
/// time, with per-branch strengths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub name: String,
    #[serde(default = "default_adapter_strength")]
    pub strength_model: f64,
    #[serde(default = "default_adapter_strength")]
    pub strength_clip: f64,
}

fn default_adapter_strength() -> f64 {
    0.8
}

impl AdapterSpec {
    /// An adapter at the given uniform strength.
    pub fn at_strength(name: impl Into<String>, strength: f64) -> Self {
        Self {
            name: name.into(),
            strength_model: strength,
            strength_clip: strength,
        }
    }
}

/// Declarative description of one node from the inventory config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    pub name: String,
    pub vram_gb: u32,
    pub tier: Tier,
    pub host: String,
    pub port: u16,
    pub capabilities: BTreeSet<String>,
    #[serde(default = "default_max_resolution")]
    pub max_resolution: u32,
    #[serde(default = "default_max_batch")]
    pub max_batch: u32,
}

fn default_max_resolution() -> u32 {
    1024
}

fn default_max_batch() -> u32 {
    1
}

impl NodeConfig {
    /// Base HTTP URL of the worker, e.g. `http://host:8188`.
    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// WebSocket URL of the worker's event stream.
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.host, self.port)
    }
}

/// Point-in-time view of a node: inventory fields plus runtime state.
///
/// Snapshots are immutable copies; the registry guarantees all fields of one
/// node are read consistently.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub name: String,
    pub vram_gb: u32,
    pub tier: Tier,
    pub host: String,
    pub port: u16,
    pub capabilities: BTreeSet<String>,
    pub max_resolution: u32,
    pub max_batch: u32,
    pub healthy: bool,
    pub last_latency_ms: f64,
    pub queue_depth: u32,
    pub health_transitions: u64,
}

impl NodeSnapshot {
    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Lifecycle of a generation job. Transitions are strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Queued,
    Dispatched,
    Running,
    Complete,
    Failed,
}

impl GenerationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, GenerationStatus::Complete | GenerationStatus::Failed)
    }

    /// Position in the forward-only lifecycle, for transition guards.
    pub fn order(self) -> u8 {
        match self {
            GenerationStatus::Queued => 0,
            GenerationStatus::Dispatched => 1,
            GenerationStatus::Running => 2,
            GenerationStatus::Complete => 3,
            GenerationStatus::Failed => 3,
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GenerationStatus::Queued => "queued",
            GenerationStatus::Dispatched => "dispatched",
            GenerationStatus::Running => "running",
            GenerationStatus::Complete => "complete",
            GenerationStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Kind of user-facing workflow a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    ConceptBuilder,
    DraftGrid,
    Explorer,
}

/// Full parameter bundle for one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f64,
    #[serde(default = "default_sampler")]
    pub sampler: String,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    #[serde(default = "default_denoise")]
    pub denoise_strength: f64,
    /// `-1` means "pick a random seed at dispatch".
    #[serde(default = "default_seed")]
    pub seed: i64,
}

fn default_dimension() -> u32 {
    1024
}

fn default_steps() -> u32 {
    20
}

fn default_cfg_scale() -> f64 {
    7.0
}

fn default_sampler() -> String {
    "euler".to_string()
}

fn default_scheduler() -> String {
    "normal".to_string()
}

fn default_denoise() -> f64 {
    1.0
}

fn default_seed() -> i64 {
    -1
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            width: default_dimension(),
            height: default_dimension(),
            steps: default_steps(),
            cfg_scale: default_cfg_scale(),
            sampler: default_sampler(),
            scheduler: default_scheduler(),
            denoise_strength: default_denoise(),
            seed: default_seed(),
        }
    }
}

/// Opaque reference to a completed generation's output on a worker.
///
/// Resolvable into bytes via the owning node's artifact endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub node_id: NodeId,
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}
