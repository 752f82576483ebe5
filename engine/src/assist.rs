//! Advisory inference calls made by the extraction stages.
//!
//! An `AssistSession` wraps an optional [`GuardedClassifier`] for one stage of
//! one run. Answers below the minimum confidence are rejected. The first
//! timeout or unavailability ends the session for the rest of the stage and
//! is recorded as a warning; the stage carries on with pattern-only results.

use policy_nav_inference::{
    Classification, ClassifyRequest, GuardedClassifier, InferenceError, TaskKind,
};
use tracing::{debug, warn};

use crate::issue::{Issue, IssueKind};

/// Per-stage inference session.
pub(crate) struct AssistSession<'a> {
    classifier: Option<&'a GuardedClassifier>,
    min_confidence: f32,
    max_calls: usize,
    calls: usize,
    stopped: bool,
    pub issues: Vec<Issue>,
}

impl<'a> AssistSession<'a> {
    pub fn new(
        classifier: Option<&'a GuardedClassifier>,
        min_confidence: f32,
        max_calls: usize,
    ) -> Self {
        Self {
            classifier,
            min_confidence,
            max_calls,
            calls: 0,
            stopped: false,
            issues: Vec::new(),
        }
    }

    /// Whether another call would be attempted.
    pub fn is_active(&self) -> bool {
        self.classifier.is_some() && !self.stopped && self.calls < self.max_calls
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Ask for a label. Returns `None` on any failure or rejected answer.
    pub async fn ask(
        &mut self,
        text: &str,
        task: TaskKind,
        labels: &[&str],
        subject_id: &str,
    ) -> Option<Classification> {
        if !self.is_active() {
            return None;
        }
        let classifier = self.classifier?;
        self.calls += 1;

        let request = ClassifyRequest::new(text, task).with_labels(labels.iter().copied());
        match classifier.classify(request).await {
            Ok(answer) if answer.confidence >= self.min_confidence => {
                debug!(
                    task = task.as_str(),
                    label = %answer.label,
                    confidence = answer.confidence,
                    "Inference answer accepted for validation"
                );
                Some(answer)
            }
            Ok(answer) => {
                self.issues.push(
                    Issue::info(
                        IssueKind::RejectedInference,
                        format!(
                            "{} answer '{}' below minimum confidence ({:.2} < {:.2})",
                            task.as_str(),
                            answer.label,
                            answer.confidence,
                            self.min_confidence
                        ),
                    )
                    .with_subject(subject_id),
                );
                None
            }
            Err(err) => {
                self.record_failure(&err, task, subject_id);
                None
            }
        }
    }

    /// Record that a validated answer was still overruled by structure.
    pub fn reject(&mut self, message: impl Into<String>, subject_id: &str) {
        self.issues
            .push(Issue::info(IssueKind::RejectedInference, message).with_subject(subject_id));
    }

    fn record_failure(&mut self, err: &InferenceError, task: TaskKind, subject_id: &str) {
        let kind = match err {
            InferenceError::Timeout { .. } => Some(IssueKind::InferenceServiceTimeout),
            InferenceError::Http(e) if e.is_timeout() => Some(IssueKind::InferenceServiceTimeout),
            InferenceError::Unavailable(_)
            | InferenceError::ProviderNotConfigured
            | InferenceError::RateLimited { .. }
            | InferenceError::Http(_) => Some(IssueKind::InferenceServiceUnavailable),
            InferenceError::ApiRequest(_)
            | InferenceError::InvalidResponse(_)
            | InferenceError::Serialization(_) => None,
        };

        match kind {
            Some(kind) => {
                warn!(
                    task = task.as_str(),
                    error = %err,
                    "Inference degraded; continuing with pattern-only results"
                );
                self.stopped = true;
                self.issues.push(
                    Issue::warning(
                        kind,
                        format!("{} call failed, falling back to patterns: {err}", task.as_str()),
                    )
                    .with_subject(subject_id),
                );
            }
            None => {
                self.issues.push(
                    Issue::info(
                        IssueKind::RejectedInference,
                        format!("{} answer rejected: {err}", task.as_str()),
                    )
                    .with_subject(subject_id),
                );
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_low_confidence_is_rejected() {
        let (classifier, _) = fakes::scripted(|_| ("section".to_string(), 0.3));
        let mut session = AssistSession::new(Some(&classifier), 0.6, 10);
        let answer = session
            .ask("INCOME", TaskKind::HeadingDisambiguation, &["section", "not_heading"], "n1")
            .await;
        assert!(answer.is_none());
        assert_eq!(session.issues[0].kind, IssueKind::RejectedInference);
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn test_timeout_stops_session() {
        let classifier = fakes::stalled();
        let mut session = AssistSession::new(Some(&classifier), 0.6, 10);
        let labels = ["section", "not_heading"];
        assert!(
            session
                .ask("INCOME", TaskKind::HeadingDisambiguation, &labels, "n1")
                .await
                .is_none()
        );
        assert!(!session.is_active());
        assert!(
            session
                .ask("ASSETS", TaskKind::HeadingDisambiguation, &labels, "n2")
                .await
                .is_none()
        );
        assert_eq!(session.calls(), 1);
        assert_eq!(session.issues.len(), 1);
        assert_eq!(session.issues[0].kind, IssueKind::InferenceServiceTimeout);
    }

    #[tokio::test]
    async fn test_without_classifier_is_inactive() {
        let mut session = AssistSession::new(None, 0.6, 10);
        assert!(!session.is_active());
        assert!(
            session
                .ask("x", TaskKind::EntityTyping, &["a"], "c1")
                .await
                .is_none()
        );
        assert!(session.issues.is_empty());
    }
}
