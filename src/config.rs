use crate::notifications::{default_channels, NotificationKind};
use std::{collections::HashMap, env, net::SocketAddr, str::FromStr, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid environment variable format for {0}: {1}")]
    InvalidVar(String, String),
}

/// Where blobs, metadata, relations and activity live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Aws,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModerationBackend {
    Permissive,
    Rekognition,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractionBackend {
    None,
    Rekognition,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifierBackend {
    Log,
    Sns,
}

macro_rules! impl_backend_from_str {
    ($ty:ty, $($name:literal => $variant:expr),+ $(,)?) => {
        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($name => Ok($variant),)+
                    other => Err(format!("unknown backend '{}'", other)),
                }
            }
        }
    };
}

impl_backend_from_str!(StorageBackend, "memory" => StorageBackend::Memory, "aws" => StorageBackend::Aws);
impl_backend_from_str!(ModerationBackend, "permissive" => ModerationBackend::Permissive, "rekognition" => ModerationBackend::Rekognition);
impl_backend_from_str!(ExtractionBackend, "none" => ExtractionBackend::None, "rekognition" => ExtractionBackend::Rekognition);
impl_backend_from_str!(NotifierBackend, "log" => NotifierBackend::Log, "sns" => NotifierBackend::Sns);

pub const DEFAULT_MIN_CONFIDENCE: f32 = 60.0;
pub const DEFAULT_DISALLOWED_LABELS: [&str; 4] = ["explicit nudity", "violence", "hate symbols", "sexual content"];

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub storage_backend: StorageBackend,
    pub moderation_backend: ModerationBackend,
    pub extraction_backend: ExtractionBackend,
    pub notifier_backend: NotifierBackend,
    /// Required when `storage_backend` is `Aws`.
    pub meme_bucket_name: Option<String>,
    // Store region as string for simplicity here, aws_clients can convert
    pub aws_region: String,
    // Optional endpoint for LocalStack
    pub localstack_endpoint: Option<String>,
    pub memes_table: String,
    pub relations_table: String,
    pub activity_table: String,
    pub min_confidence: f32,
    pub disallowed_labels: Vec<String>,
    pub notification_channels: HashMap<NotificationKind, String>,
    pub presigned_expiration: Duration,
    pub classifier_timeout: Duration,
    pub max_upload_bytes: usize,
    pub side_effect_queue: usize,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (ignores errors, relies on env vars otherwise)
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let bind_address = parse_var(&lookup, "BIND_ADDRESS", "0.0.0.0:3000")?;
        let storage_backend = parse_var(&lookup, "STORAGE_BACKEND", "memory")?;
        let moderation_backend = parse_var(&lookup, "MODERATION_BACKEND", "permissive")?;
        let extraction_backend = parse_var(&lookup, "EXTRACTION_BACKEND", "none")?;
        let notifier_backend = parse_var(&lookup, "NOTIFIER_BACKEND", "log")?;

        let meme_bucket_name = lookup("MEME_BUCKET_NAME").filter(|b| !b.trim().is_empty());
        if storage_backend == StorageBackend::Aws && meme_bucket_name.is_none() {
            return Err(ConfigError::MissingVar("MEME_BUCKET_NAME".into()));
        }

        let aws_region = var_or("AWS_DEFAULT_REGION", "us-east-1");
        // Allow overriding endpoint for localstack/testing
        let localstack_endpoint = lookup("AWS_ENDPOINT_URL");

        let min_confidence: f32 = parse_var(&lookup, "MIN_CONFIDENCE", "60")?;
        if !(0.0..=100.0).contains(&min_confidence) {
            return Err(ConfigError::InvalidVar(
                "MIN_CONFIDENCE".into(),
                format!("{} is outside 0..=100", min_confidence),
            ));
        }

        let disallowed_labels = match lookup("DISALLOWED_LABELS") {
            Some(raw) => raw
                .split(',')
                .map(|l| l.trim().to_lowercase())
                .filter(|l| !l.is_empty())
                .collect(),
            None => DEFAULT_DISALLOWED_LABELS.iter().map(|l| l.to_string()).collect(),
        };

        let notification_channels = match lookup("NOTIFICATION_CHANNELS") {
            Some(raw) => parse_channels(&raw)?,
            None => legacy_channels(&lookup),
        };

        let presigned_expiration = Duration::from_secs(parse_var(&lookup, "PRESIGNED_EXPIRATION", "3600")?);
        let classifier_timeout = Duration::from_secs(parse_var(&lookup, "CLASSIFIER_TIMEOUT_SECS", "10")?);
        let max_upload_bytes = parse_var(&lookup, "MAX_UPLOAD_BYTES", "10485760")?;
        let side_effect_queue: usize = parse_var(&lookup, "SIDE_EFFECT_QUEUE", "1024")?;
        if side_effect_queue == 0 {
            return Err(ConfigError::InvalidVar("SIDE_EFFECT_QUEUE".into(), "must be greater than zero".into()));
        }

        Ok(Config {
            bind_address,
            storage_backend,
            moderation_backend,
            extraction_backend,
            notifier_backend,
            meme_bucket_name,
            aws_region,
            localstack_endpoint,
            memes_table: var_or("MEMES_TABLE", "MemeItems"),
            relations_table: var_or("RELATIONS_TABLE", "MemeRelations"),
            activity_table: var_or("ACTIVITY_LOG_TABLE", "MemeLogs"),
            min_confidence,
            disallowed_labels,
            notification_channels,
            presigned_expiration,
            classifier_timeout,
            max_upload_bytes,
            side_effect_queue,
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: &str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidVar(key.into(), e.to_string()))
}

/// Parses `register=arn:...,upload-rejected=arn:...`.
fn parse_channels(raw: &str) -> Result<HashMap<NotificationKind, String>, ConfigError> {
    let mut channels = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (kind, channel) = entry.split_once('=').ok_or_else(|| {
            ConfigError::InvalidVar("NOTIFICATION_CHANNELS".into(), format!("expected kind=channel, got '{}'", entry))
        })?;
        let kind: NotificationKind = kind
            .trim()
            .parse()
            .map_err(|e: String| ConfigError::InvalidVar("NOTIFICATION_CHANNELS".into(), e))?;
        channels.insert(kind, channel.trim().to_string());
    }
    Ok(channels)
}

/// Topic variables used by the original deployment scripts, falling back to the static defaults.
fn legacy_channels<F>(lookup: &F) -> HashMap<NotificationKind, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut channels = default_channels();
    if let Some(topic) = lookup("NEW_MEME_UPLOAD_SNS_TOPIC") {
        channels.insert(NotificationKind::Register, topic.clone());
        channels.insert(NotificationKind::UploadApproved, topic);
    }
    if let Some(topic) = lookup("MODERATION_ALERT_SNS_TOPIC") {
        channels.insert(NotificationKind::UploadRejected, topic);
    }
    channels
}
