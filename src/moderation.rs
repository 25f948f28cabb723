use crate::{
    domain::{LabelDetector, ModerationEngine},
    errors::ModerationError,
    models::{DetectedLabel, ModerationDecision, RejectReason},
};
use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_rekognition::{
    primitives::Blob,
    types::Image,
    Client as RekognitionClient,
};
use std::{collections::HashSet, sync::Arc, time::Duration};

/// Approves everything. Used when no classifier is configured.
#[derive(Debug, Clone, Default)]
pub struct PermissiveModerator;

#[async_trait]
impl ModerationEngine for PermissiveModerator {
    async fn classify(&self, _image: &[u8], _min_confidence: f32) -> ModerationDecision {
        ModerationDecision::approve()
    }
}

/// Rejects an image when a disallowed label reaches `min_confidence`.
///
/// Detector failures and timeouts approve the image: moderation must never block an upload.
pub struct ConfidenceThresholdModerator {
    detector: Arc<dyn LabelDetector>,
    disallowed: HashSet<String>,
    timeout: Duration,
}

impl ConfidenceThresholdModerator {
    pub fn new<I, S>(detector: Arc<dyn LabelDetector>, disallowed: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let disallowed = disallowed.into_iter().map(|l| l.as_ref().to_lowercase()).collect();
        Self {
            detector,
            disallowed,
            timeout,
        }
    }

    async fn detect(&self, image: &[u8], min_confidence: f32) -> Result<Vec<DetectedLabel>, ModerationError> {
        tokio::time::timeout(self.timeout, self.detector.detect_moderation_labels(image, min_confidence))
            .await
            .map_err(|_| ModerationError::Timeout)?
    }
}

#[async_trait]
impl ModerationEngine for ConfidenceThresholdModerator {
    async fn classify(&self, image: &[u8], min_confidence: f32) -> ModerationDecision {
        match self.detect(image, min_confidence).await {
            Ok(labels) => {
                let decision = evaluate(&labels, &self.disallowed, min_confidence);
                tracing::debug!(
                    approved = decision.approved,
                    detected = labels.len(),
                    rejected_by = decision.reasons.len(),
                    "Moderation decision"
                );
                decision
            }
            Err(e) => {
                tracing::warn!(error = %e, "Moderation classifier failed, approving by default");
                ModerationDecision::approve()
            }
        }
    }
}

/// Applies the disallowed-label policy to detector output, keeping detector order.
pub fn evaluate(labels: &[DetectedLabel], disallowed: &HashSet<String>, min_confidence: f32) -> ModerationDecision {
    let reasons: Vec<RejectReason> = labels
        .iter()
        .filter(|l| disallowed.contains(&l.name.to_lowercase()) && l.confidence >= min_confidence)
        .map(|l| RejectReason {
            label: l.name.clone(),
            confidence: l.confidence,
        })
        .collect();
    ModerationDecision {
        approved: reasons.is_empty(),
        reasons,
    }
}

/// `DetectModerationLabels` backed detector.
#[derive(Debug, Clone)]
pub struct RekognitionLabelDetector {
    client: RekognitionClient,
}

impl RekognitionLabelDetector {
    pub fn new(client: RekognitionClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LabelDetector for RekognitionLabelDetector {
    async fn detect_moderation_labels(&self, image: &[u8], min_confidence: f32) -> Result<Vec<DetectedLabel>, ModerationError> {
        let output = self
            .client
            .detect_moderation_labels()
            .image(Image::builder().bytes(Blob::new(image.to_vec())).build())
            .min_confidence(min_confidence)
            .send()
            .await
            .context("Rekognition: DetectModerationLabels failed")?;

        Ok(output
            .moderation_labels()
            .iter()
            .map(|label| DetectedLabel {
                name: label.name().unwrap_or_default().to_string(),
                confidence: label.confidence().unwrap_or_default(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_DISALLOWED_LABELS;

    struct FixedDetector(Vec<DetectedLabel>);

    #[async_trait]
    impl LabelDetector for FixedDetector {
        async fn detect_moderation_labels(&self, _image: &[u8], _min: f32) -> Result<Vec<DetectedLabel>, ModerationError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenDetector;

    #[async_trait]
    impl LabelDetector for BrokenDetector {
        async fn detect_moderation_labels(&self, _image: &[u8], _min: f32) -> Result<Vec<DetectedLabel>, ModerationError> {
            Err(ModerationError::BackendError(anyhow::anyhow!("ThrottlingException")))
        }
    }

    struct StalledDetector;

    #[async_trait]
    impl LabelDetector for StalledDetector {
        async fn detect_moderation_labels(&self, _image: &[u8], _min: f32) -> Result<Vec<DetectedLabel>, ModerationError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(vec![])
        }
    }

    fn label(name: &str, confidence: f32) -> DetectedLabel {
        DetectedLabel {
            name: name.to_string(),
            confidence,
        }
    }

    fn moderator(detector: impl LabelDetector) -> ConfidenceThresholdModerator {
        ConfidenceThresholdModerator::new(Arc::new(detector), DEFAULT_DISALLOWED_LABELS, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn permissive_always_approves() {
        let decision = PermissiveModerator.classify(b"anything", 99.0).await;
        assert_eq!(decision, ModerationDecision::approve());
    }

    #[tokio::test]
    async fn rejects_disallowed_labels_at_or_above_threshold() {
        let engine = moderator(FixedDetector(vec![
            label("Violence", 60.0),
            label("Smoking", 95.0),
            label("Explicit Nudity", 59.9),
            label("Hate Symbols", 88.5),
        ]));

        let decision = engine.classify(b"img", 60.0).await;

        assert!(!decision.approved);
        assert_eq!(
            decision.reasons,
            vec![
                RejectReason { label: "Violence".into(), confidence: 60.0 },
                RejectReason { label: "Hate Symbols".into(), confidence: 88.5 },
            ]
        );
    }

    #[tokio::test]
    async fn approves_when_only_allowed_labels_are_found() {
        let engine = moderator(FixedDetector(vec![label("Tobacco", 99.0)]));
        assert!(engine.classify(b"img", 60.0).await.approved);
    }

    #[tokio::test]
    async fn detector_failure_fails_open() {
        let decision = moderator(BrokenDetector).classify(b"img", 60.0).await;
        assert!(decision.approved);
        assert!(decision.reasons.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn detector_timeout_fails_open() {
        let decision = moderator(StalledDetector).classify(b"img", 60.0).await;
        assert!(decision.approved);
    }
}
