use crate::{domain::LabelExtractor, models::Extraction};
use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_rekognition::{
    primitives::Blob,
    types::{Image, TextTypes},
    Client as RekognitionClient,
};
use std::time::Duration;

const MAX_LABELS: i32 = 20;
const LABEL_MIN_CONFIDENCE: f32 = 50.0;

/// Extractor for deployments without a vision backend.
#[derive(Debug, Clone, Default)]
pub struct NoopExtractor;

#[async_trait]
impl LabelExtractor for NoopExtractor {
    async fn extract(&self, _image: &[u8]) -> Extraction {
        Extraction::default()
    }
}

/// Labels via `DetectLabels`, text via `DetectText` (LINE detections only).
#[derive(Debug, Clone)]
pub struct RekognitionExtractor {
    client: RekognitionClient,
    timeout: Duration,
}

impl RekognitionExtractor {
    pub fn new(client: RekognitionClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn try_extract(&self, image: &[u8]) -> anyhow::Result<Extraction> {
        let labels = self
            .client
            .detect_labels()
            .image(Image::builder().bytes(Blob::new(image.to_vec())).build())
            .max_labels(MAX_LABELS)
            .min_confidence(LABEL_MIN_CONFIDENCE)
            .send()
            .await
            .context("Rekognition: DetectLabels failed")?;

        let text = self
            .client
            .detect_text()
            .image(Image::builder().bytes(Blob::new(image.to_vec())).build())
            .send()
            .await
            .context("Rekognition: DetectText failed")?;

        Ok(Extraction {
            labels: labels
                .labels()
                .iter()
                .filter_map(|l| l.name().map(str::to_string))
                .collect(),
            text: text
                .text_detections()
                .iter()
                .filter(|d| d.r#type() == Some(&TextTypes::Line))
                .filter_map(|d| d.detected_text())
                .collect::<Vec<_>>()
                .join(" "),
        })
    }
}

#[async_trait]
impl LabelExtractor for RekognitionExtractor {
    async fn extract(&self, image: &[u8]) -> Extraction {
        match tokio::time::timeout(self.timeout, self.try_extract(image)).await {
            Ok(Ok(extraction)) => extraction,
            Ok(Err(e)) => {
                tracing::warn!(error = ?e, "Label/text extraction failed, continuing without enrichment");
                Extraction::default()
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "Label/text extraction timed out, continuing without enrichment");
                Extraction::default()
            }
        }
    }
}
