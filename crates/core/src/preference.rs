//! Preference learning engine.
//!
//! Tracks which models and adapters the user selects or rejects for which
//! kinds of prompt, keyed by four statistic dimensions:
//!
//! - (keyword, model)
//! - (keyword, adapter)
//! - (model, adapter)
//! - (model) as a coarse prior
//!
//! Scores blend the observed selection rate with a neutral prior, weighted by
//! how much data backs the observation. Rejections are recorded against the
//! same contextual keys they occurred under and never aggregate into a global
//! penalty for a model.
//!
//! Writes are serialized through the single `record`/`import` path; queries
//! take a read lock and compute against the frozen state, so any
//! recommendation is a pure function of (state, inputs).

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::keywords;
use crate::types::{SessionId, Timestamp};

/// Neutral prior used when a key has no observations.
pub const PRIOR: f64 = 0.5;

/// Pseudo-count smoothing: with `tot` observations the data weight is
/// `tot / (tot + SMOOTHING)`.
pub const SMOOTHING: f64 = 10.0;

/// Total observations at which recommendation confidence saturates at 1.0.
pub const CONFIDENCE_SATURATION: f64 = 100.0;

/// Current export format version.
pub const EXPORT_VERSION: u32 = 1;

/// What the user did with a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceAction {
    Selected,
    Rejected,
}

/// Dimension key of one aggregated statistic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "dim", rename_all = "snake_case")]
pub enum StatKey {
    KeywordModel { keyword: String, model: String },
    KeywordAdapter { keyword: String, adapter: String },
    ModelAdapter { model: String, adapter: String },
    Model { model: String },
}

/// Selected/total counters for one stat key. Monotone: counts only grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatCounts {
    pub selected: u64,
    pub total: u64,
}

impl StatCounts {
    fn observe(&mut self, selected: bool) {
        self.total += 1;
        if selected {
            self.selected += 1;
        }
    }

    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.selected as f64 / self.total as f64
        }
    }
}

/// One immutable selection/rejection event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceRecord {
    pub prompt: String,
    pub keywords: Vec<String>,
    pub model: String,
    pub adapters: Vec<String>,
    pub action: PreferenceAction,
    pub stage: u32,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub recorded_at: Timestamp,
}

/// Stable export of the full engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceExport {
    pub version: u32,
    pub records: Vec<PreferenceRecord>,
    pub stats: Vec<StatEntry>,
}

/// One stat key with its counters, as serialized in exports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatEntry {
    #[serde(flatten)]
    pub key: StatKey,
    pub selected: u64,
    pub total: u64,
}

/// Summary of accumulated learning for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub total_records: usize,
    pub selected: usize,
    pub rejected: usize,
    pub top_models: Vec<ModelStat>,
}

/// Per-model aggregate with enough data to be worth showing.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStat {
    pub model: String,
    pub selected: u64,
    pub total: u64,
    pub selection_rate: f64,
}

#[derive(Debug, Default)]
struct PreferenceState {
    records: Vec<PreferenceRecord>,
    stats: HashMap<StatKey, StatCounts>,
}

impl PreferenceState {
    fn counts(&self, key: &StatKey) -> Option<StatCounts> {
        self.stats.get(key).copied()
    }

    /// Blended score of one stat key: prior when no data, observed rate as
    /// the data weight grows.
    fn blended(&self, key: &StatKey) -> f64 {
        match self.counts(key) {
            Some(c) if c.total > 0 => {
                let tot = c.total as f64;
                let weight = tot / (tot + SMOOTHING);
                (1.0 - weight) * PRIOR + weight * c.rate()
            }
            _ => PRIOR,
        }
    }

    /// Mean per-keyword score of a model; the prior when no keywords.
    fn model_score(&self, model: &str, prompt_keywords: &[String]) -> f64 {
        if prompt_keywords.is_empty() {
            return PRIOR;
        }
        let sum: f64 = prompt_keywords
            .iter()
            .map(|k| {
                self.blended(&StatKey::KeywordModel {
                    keyword: k.clone(),
                    model: model.to_string(),
                })
            })
            .sum();
        sum / prompt_keywords.len() as f64
    }

    /// Evidence behind a recommendation: total observations across all
    /// (keyword, candidate) pairs, saturating at [`CONFIDENCE_SATURATION`].
    fn confidence(&self, prompt_keywords: &[String], candidates: &[String]) -> f64 {
        let mut evidence = 0u64;
        for keyword in prompt_keywords {
            for model in candidates {
                if let Some(c) = self.counts(&StatKey::KeywordModel {
                    keyword: keyword.clone(),
                    model: model.clone(),
                }) {
                    evidence += c.total;
                }
            }
        }
        (evidence as f64 / CONFIDENCE_SATURATION).min(1.0)
    }
}

/// Shared preference learning engine.
pub struct PreferenceEngine {
    state: RwLock<PreferenceState>,
}

impl Default for PreferenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PreferenceEngine {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PreferenceState::default()),
        }
    }

    /// Record one selection or rejection with its full context.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        prompt: &str,
        model: &str,
        adapters: &[String],
        action: PreferenceAction,
        stage: u32,
        session_id: &str,
        feedback: Option<String>,
        recorded_at: Timestamp,
    ) {
        let prompt_keywords = keywords::extract(prompt);
        let selected = action == PreferenceAction::Selected;

        let mut state = self.state.write().expect("preference lock poisoned");

        state.records.push(PreferenceRecord {
            prompt: prompt.to_string(),
            keywords: prompt_keywords.clone(),
            model: model.to_string(),
            adapters: adapters.to_vec(),
            action,
            stage,
            session_id: session_id.to_string(),
            feedback,
            recorded_at,
        });

        for keyword in &prompt_keywords {
            state
                .stats
                .entry(StatKey::KeywordModel {
                    keyword: keyword.clone(),
                    model: model.to_string(),
                })
                .or_default()
                .observe(selected);

            for adapter in adapters {
                state
                    .stats
                    .entry(StatKey::KeywordAdapter {
                        keyword: keyword.clone(),
                        adapter: adapter.clone(),
                    })
                    .or_default()
                    .observe(selected);
            }
        }

        for adapter in adapters {
            state
                .stats
                .entry(StatKey::ModelAdapter {
                    model: model.to_string(),
                    adapter: adapter.clone(),
                })
                .or_default()
                .observe(selected);
        }

        state
            .stats
            .entry(StatKey::Model {
                model: model.to_string(),
            })
            .or_default()
            .observe(selected);

        tracing::debug!(
            model,
            action = ?action,
            keywords = ?prompt_keywords,
            "Recorded preference",
        );
    }

    /// Score every candidate for a prompt, best first.
    ///
    /// Ties are broken by lexicographic candidate id so the ordering is
    /// deterministic.
    pub fn score_models(&self, prompt: &str, candidates: &[String]) -> Vec<(String, f64)> {
        let prompt_keywords = keywords::extract(prompt);
        let state = self.state.read().expect("preference lock poisoned");

        let mut scored: Vec<(String, f64)> = candidates
            .iter()
            .map(|m| (m.clone(), state.model_score(m, &prompt_keywords)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored
    }

    /// Recommend the best model for a prompt, with a confidence score.
    ///
    /// A prompt with no extractable keywords yields the first candidate at
    /// confidence 0.
    pub fn recommend_model(&self, prompt: &str, candidates: &[String]) -> Option<(String, f64)> {
        let first = candidates.first()?;
        let prompt_keywords = keywords::extract(prompt);
        if prompt_keywords.is_empty() {
            return Some((first.clone(), 0.0));
        }

        let state = self.state.read().expect("preference lock poisoned");
        let confidence = state.confidence(&prompt_keywords, candidates);

        let mut best = first.clone();
        let mut best_score = state.model_score(first, &prompt_keywords);
        for model in &candidates[1..] {
            let score = state.model_score(model, &prompt_keywords);
            if score > best_score || (score == best_score && *model < best) {
                best = model.clone();
                best_score = score;
            }
        }

        Some((best, confidence))
    }

    /// Recommend up to `count` adapters for a prompt and chosen model.
    ///
    /// Each adapter's score combines its per-keyword affinity and its
    /// compatibility with the model at equal weight.
    pub fn recommend_adapters(
        &self,
        prompt: &str,
        model: &str,
        candidates: &[String],
        count: usize,
    ) -> Vec<(String, f64)> {
        let prompt_keywords = keywords::extract(prompt);
        let state = self.state.read().expect("preference lock poisoned");

        let mut scored: Vec<(String, f64)> = candidates
            .iter()
            .map(|adapter| {
                let keyword_score = if prompt_keywords.is_empty() {
                    PRIOR
                } else {
                    let sum: f64 = prompt_keywords
                        .iter()
                        .map(|k| {
                            state.blended(&StatKey::KeywordAdapter {
                                keyword: k.clone(),
                                adapter: adapter.clone(),
                            })
                        })
                        .sum();
                    sum / prompt_keywords.len() as f64
                };
                let model_score = state.blended(&StatKey::ModelAdapter {
                    model: model.to_string(),
                    adapter: adapter.clone(),
                });
                (adapter.clone(), (keyword_score + model_score) / 2.0)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(count);
        scored
    }

    /// Summary for the stats endpoint: record counts and top models by
    /// selection rate (minimum five observations).
    pub fn stats_summary(&self) -> StatsSummary {
        let state = self.state.read().expect("preference lock poisoned");

        let selected = state
            .records
            .iter()
            .filter(|r| r.action == PreferenceAction::Selected)
            .count();

        let mut top_models: Vec<ModelStat> = state
            .stats
            .iter()
            .filter_map(|(key, counts)| match key {
                StatKey::Model { model } if counts.total >= 5 => Some(ModelStat {
                    model: model.clone(),
                    selected: counts.selected,
                    total: counts.total,
                    selection_rate: counts.rate(),
                }),
                _ => None,
            })
            .collect();
        top_models.sort_by(|a, b| {
            b.selection_rate
                .partial_cmp(&a.selection_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.model.cmp(&b.model))
        });
        top_models.truncate(10);

        StatsSummary {
            total_records: state.records.len(),
            selected,
            rejected: state.records.len() - selected,
            top_models,
        }
    }

    /// Export the full engine state in the stable format.
    pub fn export(&self) -> PreferenceExport {
        let state = self.state.read().expect("preference lock poisoned");

        let mut stats: Vec<StatEntry> = state
            .stats
            .iter()
            .map(|(key, counts)| StatEntry {
                key: key.clone(),
                selected: counts.selected,
                total: counts.total,
            })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));

        PreferenceExport {
            version: EXPORT_VERSION,
            records: state.records.clone(),
            stats,
        }
    }

    /// Replace the current state with an imported export, atomically.
    ///
    /// The export is fully validated before anything is swapped; a rejected
    /// import leaves the current state untouched.
    pub fn import(&self, export: PreferenceExport) -> CoreResult<()> {
        if export.version != EXPORT_VERSION {
            return Err(CoreError::CorruptExport(format!(
                "unsupported version {} (expected {EXPORT_VERSION})",
                export.version
            )));
        }

        let mut stats = HashMap::with_capacity(export.stats.len());
        for entry in export.stats {
            if entry.selected > entry.total {
                return Err(CoreError::CorruptExport(format!(
                    "stat {:?} has selected {} > total {}",
                    entry.key, entry.selected, entry.total
                )));
            }
            if stats
                .insert(
                    entry.key.clone(),
                    StatCounts {
                        selected: entry.selected,
                        total: entry.total,
                    },
                )
                .is_some()
            {
                return Err(CoreError::CorruptExport(format!(
                    "duplicate stat key {:?}",
                    entry.key
                )));
            }
        }

        let imported = PreferenceState {
            records: export.records,
            stats,
        };

        let mut state = self.state.write().expect("preference lock poisoned");
        *state = imported;
        Ok(())
    }

    /// Total observations on one key, for tests and introspection.
    pub fn total_for(&self, key: &StatKey) -> u64 {
        self.state
            .read()
            .expect("preference lock poisoned")
            .counts(key)
            .map(|c| c.total)
            .unwrap_or(0)
    }
}
