//! Iteration funnel: stage profiles, phase transitions, and next-stage
//! planning.
//!
//! A session walks a fixed funnel of stages, each narrowing the candidate
//! set (many cheap drafts, fewer refined images, one final render). The
//! controller in `atelier-api` wires these pure pieces to the store, the
//! preference engine, and the executor.

use serde::{Deserialize, Serialize};

use crate::types::{GenerationId, GenerationParams, ModelFamily, TaskClass};

/// Denoise strength for "more like this" image-to-image continuations.
pub const MORE_LIKE_THIS_DENOISE: f64 = 0.4;

/// Where a session currently sits within its active stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    Configuring,
    Generating,
    Reviewing,
    Done,
}

impl StagePhase {
    /// Generation work was submitted for the current stage.
    pub fn on_submit(self) -> StagePhase {
        match self {
            StagePhase::Done => StagePhase::Done,
            _ => StagePhase::Generating,
        }
    }

    /// The stage's batch finished; the user can review.
    pub fn on_batch_complete(self) -> StagePhase {
        match self {
            StagePhase::Generating => StagePhase::Reviewing,
            other => other,
        }
    }

    /// The user advanced past the current stage.
    pub fn on_advance(self, terminal_stage: bool) -> StagePhase {
        if terminal_stage {
            StagePhase::Done
        } else {
            StagePhase::Generating
        }
    }

    /// The user rejected everything; the stage stays open for another round.
    pub fn on_reject_all(self) -> StagePhase {
        StagePhase::Reviewing
    }
}

/// Parameter profile of one funnel stage.
#[derive(Debug, Clone, Copy)]
pub struct StageProfile {
    pub task_class: TaskClass,
    pub count: u32,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub denoise_strength: f64,
}

/// The default funnel: 20 drafts, 8 refined, 3 polished, 1 final.
pub static STAGE_FUNNEL: [StageProfile; 4] = [
    StageProfile {
        task_class: TaskClass::Draft,
        count: 20,
        width: 512,
        height: 512,
        steps: 10,
        denoise_strength: 1.0,
    },
    StageProfile {
        task_class: TaskClass::Standard,
        count: 8,
        width: 1024,
        height: 1024,
        steps: 20,
        denoise_strength: 0.75,
    },
    StageProfile {
        task_class: TaskClass::Quality,
        count: 3,
        width: 1024,
        height: 1024,
        steps: 30,
        denoise_strength: 0.6,
    },
    StageProfile {
        task_class: TaskClass::Quality,
        count: 1,
        width: 1024,
        height: 1024,
        steps: 40,
        denoise_strength: 0.5,
    },
];

/// Profile for a stage index; indices past the funnel clamp to the last
/// stage.
pub fn profile_for_stage(stage: u32) -> &'static StageProfile {
    let idx = (stage as usize).min(STAGE_FUNNEL.len() - 1);
    &STAGE_FUNNEL[idx]
}

/// Whether a stage index is the final funnel stage.
pub fn is_terminal_stage(stage: u32) -> bool {
    stage as usize >= STAGE_FUNNEL.len() - 1
}

/// Output of the prompt-rewriting collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct RewriteOutcome {
    pub prompt: String,
    pub negative: String,
    pub rationale: String,
}

/// Pluggable seam for an external prompt-rewriting service.
///
/// Implementations receive the current prompt, the user's free-text
/// feedback, and how many images were selected, and return a possibly
/// rewritten prompt with a rationale.
pub trait PromptRewriter: Send + Sync {
    fn rewrite(
        &self,
        prompt: &str,
        negative: &str,
        feedback: Option<&str>,
        selected: usize,
    ) -> RewriteOutcome;
}

/// Default rewriter: passes prompts through unchanged.
pub struct NoopRewriter;

impl PromptRewriter for NoopRewriter {
    fn rewrite(
        &self,
        prompt: &str,
        negative: &str,
        _feedback: Option<&str>,
        selected: usize,
    ) -> RewriteOutcome {
        RewriteOutcome {
            prompt: prompt.to_string(),
            negative: negative.to_string(),
            rationale: format!(
                "Advancing with the same prompt ({selected} image(s) selected); no rewriter configured"
            ),
        }
    }
}

/// The controller's plan for a session's next batch.
#[derive(Debug, Clone, Serialize)]
pub struct StagePlan {
    pub suggested_prompt: String,
    pub suggested_negative: String,
    pub parameters: GenerationParams,
    pub task_class: TaskClass,
    pub model_family: ModelFamily,
    pub use_img2img: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_generation_id: Option<GenerationId>,
    pub denoise_strength: f64,
    pub count: u32,
    pub rationale: String,
}

/// Build the plan for a stage from a rewrite outcome and an optional
/// source image.
pub fn plan_for_stage(
    stage: u32,
    rewrite: RewriteOutcome,
    model_family: ModelFamily,
    source_generation_id: Option<GenerationId>,
) -> StagePlan {
    let profile = profile_for_stage(stage);
    let use_img2img = source_generation_id.is_some();
    StagePlan {
        suggested_prompt: rewrite.prompt,
        suggested_negative: rewrite.negative,
        parameters: GenerationParams {
            width: profile.width,
            height: profile.height,
            steps: profile.steps,
            denoise_strength: if use_img2img {
                profile.denoise_strength
            } else {
                1.0
            },
            ..GenerationParams::default()
        },
        task_class: profile.task_class,
        model_family,
        use_img2img,
        source_generation_id,
        denoise_strength: if use_img2img {
            profile.denoise_strength
        } else {
            1.0
        },
        count: profile.count,
        rationale: rewrite.rationale,
    }
}
