//! Iteration controller: feedback ingestion and next-stage planning.
//!
//! Side effects are limited to preference-engine writes, session iteration
//! state, and the plans it hands back; generation submission stays with the
//! executor.

use std::sync::Arc;

use atelier_core::error::{CoreError, CoreResult};
use atelier_core::iteration::{
    self, PromptRewriter, StagePlan, MORE_LIKE_THIS_DENOISE,
};
use atelier_core::preference::{PreferenceAction, PreferenceEngine};
use atelier_core::types::{GenerationId, SessionId};
use serde::Serialize;

use crate::store::{GenerationRow, Store};

/// Feedback actions a session can take on its current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackAction {
    Select,
    RejectAll,
    MoreLikeThis,
}

/// One feedback submission.
#[derive(Debug, Clone)]
pub struct Feedback {
    pub session_id: SessionId,
    pub action: FeedbackAction,
    pub selected_ids: Vec<GenerationId>,
    pub rejected_ids: Vec<GenerationId>,
    pub feedback_text: Option<String>,
}

/// Outcome of a reject-all round.
#[derive(Debug, Clone, Serialize)]
pub struct RejectOutcome {
    pub recorded: usize,
    pub rationale: String,
}

/// Drives the stage funnel for every session.
pub struct IterationController {
    store: Arc<Store>,
    preferences: Arc<PreferenceEngine>,
    rewriter: Arc<dyn PromptRewriter>,
}

impl IterationController {
    pub fn new(
        store: Arc<Store>,
        preferences: Arc<PreferenceEngine>,
        rewriter: Arc<dyn PromptRewriter>,
    ) -> Self {
        Self {
            store,
            preferences,
            rewriter,
        }
    }

    /// Handle a feedback submission and produce the next-stage plan.
    pub async fn feedback(&self, feedback: Feedback) -> CoreResult<StagePlan> {
        let session = self
            .store
            .session(&feedback.session_id)
            .await
            .ok_or_else(|| CoreError::NotFound {
                entity: "session",
                id: feedback.session_id.clone(),
            })?;

        let selected = self
            .load_generations(&feedback.session_id, &feedback.selected_ids)
            .await?;

        match feedback.action {
            FeedbackAction::Select => {
                for generation in &selected {
                    self.record(generation, PreferenceAction::Selected, &feedback);
                    self.store
                        .append_intent(
                            &feedback.session_id,
                            "preferences",
                            serde_json::json!({
                                "generation_id": generation.id,
                                "model": generation.model,
                                "stage": generation.stage,
                            }),
                        )
                        .await;
                }

                let (prompt, negative, family) = selected
                    .first()
                    .map(|g| (g.prompt.clone(), g.negative_prompt.clone(), g.model_family))
                    .unwrap_or_else(|| {
                        (String::new(), String::new(), atelier_core::types::ModelFamily::Sdxl)
                    });

                let rewrite = self.rewriter.rewrite(
                    &prompt,
                    &negative,
                    feedback.feedback_text.as_deref(),
                    selected.len(),
                );

                let next_stage = session.current_stage + 1;
                let terminal = iteration::is_terminal_stage(session.current_stage);
                self.store
                    .update_session_iteration(
                        &feedback.session_id,
                        session.phase.on_advance(terminal),
                        Some(next_stage),
                    )
                    .await;

                tracing::info!(
                    session_id = %feedback.session_id,
                    selected = selected.len(),
                    next_stage,
                    "Stage advanced on selection",
                );

                Ok(iteration::plan_for_stage(
                    next_stage,
                    rewrite,
                    family,
                    selected.first().map(|g| g.id.clone()),
                ))
            }

            FeedbackAction::MoreLikeThis => {
                let source = selected.first().ok_or_else(|| {
                    CoreError::Internal("more_like_this requires a selected image".to_string())
                })?;

                for generation in &selected {
                    self.record(generation, PreferenceAction::Selected, &feedback);
                }

                let rewrite = self.rewriter.rewrite(
                    &source.prompt,
                    &source.negative_prompt,
                    feedback.feedback_text.as_deref(),
                    selected.len(),
                );

                // Same stage, image-to-image from the chosen source at low
                // denoise so variations stay close.
                let mut plan = iteration::plan_for_stage(
                    session.current_stage,
                    rewrite,
                    source.model_family,
                    Some(source.id.clone()),
                );
                plan.denoise_strength = MORE_LIKE_THIS_DENOISE;
                plan.parameters.denoise_strength = MORE_LIKE_THIS_DENOISE;
                Ok(plan)
            }

            FeedbackAction::RejectAll => Err(CoreError::Internal(
                "reject_all is handled by reject_all()".to_string(),
            )),
        }
    }

    /// Record every generation of the current stage as rejected. The stage
    /// does not advance; prior-stage inputs remain available.
    pub async fn reject_all(
        &self,
        session_id: &str,
        stage: u32,
        rejected_ids: &[GenerationId],
        feedback_text: Option<String>,
    ) -> CoreResult<RejectOutcome> {
        let session = self
            .store
            .session(session_id)
            .await
            .ok_or_else(|| CoreError::NotFound {
                entity: "session",
                id: session_id.to_string(),
            })?;

        let rejected: Vec<GenerationRow> = if rejected_ids.is_empty() {
            self.store.list_generations(session_id, Some(stage)).await
        } else {
            self.load_generations(session_id, rejected_ids).await?
        };

        let feedback = Feedback {
            session_id: session_id.to_string(),
            action: FeedbackAction::RejectAll,
            selected_ids: vec![],
            rejected_ids: rejected_ids.to_vec(),
            feedback_text: feedback_text.clone(),
        };
        for generation in &rejected {
            self.record(generation, PreferenceAction::Rejected, &feedback);
        }

        if let Some(text) = &feedback_text {
            self.store
                .append_intent(
                    session_id,
                    "rejections",
                    serde_json::json!({ "stage": stage, "feedback": text }),
                )
                .await;
        }

        self.store
            .update_session_iteration(session_id, session.phase.on_reject_all(), None)
            .await;

        tracing::info!(
            session_id,
            stage,
            rejected = rejected.len(),
            "Stage rejected in full",
        );

        Ok(RejectOutcome {
            recorded: rejected.len(),
            rationale: "Rejections recorded; rerun the stage with adjusted parameters".to_string(),
        })
    }

    fn record(&self, generation: &GenerationRow, action: PreferenceAction, feedback: &Feedback) {
        let adapters: Vec<String> = generation
            .adapters
            .iter()
            .map(|a| a.name.clone())
            .collect();
        self.preferences.record(
            &generation.prompt,
            &generation.model,
            &adapters,
            action,
            generation.stage,
            &generation.session_id,
            feedback.feedback_text.clone(),
            chrono::Utc::now(),
        );
    }

    /// Fetch generations by id, verifying each belongs to the session.
    async fn load_generations(
        &self,
        session_id: &str,
        ids: &[GenerationId],
    ) -> CoreResult<Vec<GenerationRow>> {
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            let row = self
                .store
                .generation(id)
                .await
                .ok_or_else(|| CoreError::NotFound {
                    entity: "generation",
                    id: id.clone(),
                })?;
            if row.session_id != session_id {
                return Err(CoreError::NotFound {
                    entity: "generation",
                    id: id.clone(),
                });
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use atelier_core::iteration::{NoopRewriter, StagePhase};
    use atelier_core::types::{
        FlowKind, GenerationParams, GenerationStatus, ModelFamily, TaskClass,
    };

    use super::*;

    fn controller_with_store() -> (IterationController, Arc<Store>, Arc<PreferenceEngine>) {
        let store = Arc::new(Store::new());
        let preferences = Arc::new(PreferenceEngine::new());
        let controller = IterationController::new(
            Arc::clone(&store),
            Arc::clone(&preferences),
            Arc::new(NoopRewriter),
        );
        (controller, store, preferences)
    }

    async fn seed_generation(store: &Store, id: &str, session_id: &str, stage: u32) {
        store
            .insert_generation(GenerationRow {
                id: id.into(),
                session_id: session_id.into(),
                stage,
                batch_id: None,
                task_class: TaskClass::Draft,
                model_family: ModelFamily::Sd15,
                prompt: "castle on a hill".into(),
                negative_prompt: "blurry".into(),
                model: "base.safetensors".into(),
                adapters: vec![],
                params: GenerationParams::default(),
                seed: 7,
                node_id: Some("gpu-1".into()),
                worker_job_id: Some(format!("wj-{id}")),
                status: GenerationStatus::Complete,
                error: None,
                artifact: None,
                elapsed_ms: Some(900),
                created_at: chrono::Utc::now(),
            })
            .await;
    }

    #[tokio::test]
    async fn select_advances_the_stage_and_records_preferences() {
        let (controller, store, preferences) = controller_with_store();
        let session = store.create_session(FlowKind::DraftGrid, None).await;
        seed_generation(&store, "g1", &session.id, 0).await;
        seed_generation(&store, "g2", &session.id, 0).await;

        let plan = controller
            .feedback(Feedback {
                session_id: session.id.clone(),
                action: FeedbackAction::Select,
                selected_ids: vec!["g1".into(), "g2".into()],
                rejected_ids: vec![],
                feedback_text: Some("love the lighting".into()),
            })
            .await
            .unwrap();

        assert_eq!(plan.suggested_prompt, "castle on a hill");
        assert_eq!(plan.count, 8); // stage 1 of the funnel
        assert!(plan.use_img2img);
        assert_eq!(plan.source_generation_id.as_deref(), Some("g1"));

        let session = store.session(&session.id).await.unwrap();
        assert_eq!(session.current_stage, 1);
        assert_eq!(session.phase, StagePhase::Generating);

        assert_eq!(preferences.stats_summary().selected, 2);
    }

    #[tokio::test]
    async fn reject_all_records_without_advancing() {
        let (controller, store, preferences) = controller_with_store();
        let session = store.create_session(FlowKind::DraftGrid, None).await;
        seed_generation(&store, "g1", &session.id, 0).await;
        seed_generation(&store, "g2", &session.id, 0).await;
        seed_generation(&store, "g3", &session.id, 1).await;

        let outcome = controller
            .reject_all(&session.id, 0, &[], Some("wrong style".into()))
            .await
            .unwrap();

        // Only the current stage's generations were recorded.
        assert_eq!(outcome.recorded, 2);
        assert_eq!(preferences.stats_summary().rejected, 2);

        let session = store.session(&session.id).await.unwrap();
        assert_eq!(session.current_stage, 0);
        assert_eq!(session.phase, StagePhase::Reviewing);
        assert_eq!(session.intent["rejections"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn more_like_this_plans_img2img_at_low_denoise() {
        let (controller, store, _) = controller_with_store();
        let session = store.create_session(FlowKind::Explorer, None).await;
        seed_generation(&store, "g1", &session.id, 0).await;

        let plan = controller
            .feedback(Feedback {
                session_id: session.id.clone(),
                action: FeedbackAction::MoreLikeThis,
                selected_ids: vec!["g1".into()],
                rejected_ids: vec![],
                feedback_text: None,
            })
            .await
            .unwrap();

        assert!(plan.use_img2img);
        assert_eq!(plan.denoise_strength, MORE_LIKE_THIS_DENOISE);
        assert_eq!(plan.source_generation_id.as_deref(), Some("g1"));

        // The stage did not advance.
        let session = store.session(&session.id).await.unwrap();
        assert_eq!(session.current_stage, 0);
    }

    #[tokio::test]
    async fn foreign_generations_are_rejected() {
        let (controller, store, _) = controller_with_store();
        let session = store.create_session(FlowKind::DraftGrid, None).await;
        let other = store.create_session(FlowKind::DraftGrid, None).await;
        seed_generation(&store, "g1", &other.id, 0).await;

        let err = controller
            .feedback(Feedback {
                session_id: session.id.clone(),
                action: FeedbackAction::Select,
                selected_ids: vec!["g1".into()],
                rejected_ids: vec![],
                feedback_text: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (controller, _, _) = controller_with_store();
        let err = controller
            .reject_all("nope", 0, &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }
}
