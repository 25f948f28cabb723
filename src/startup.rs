use crate::{
    activity::DynamoDbActivityLog,
    aws_clients::{create_sdk_config, AwsClients},
    config::{Config, ExtractionBackend, ModerationBackend, NotifierBackend, StorageBackend},
    dispatch::SideEffects,
    domain::{ActivityLog, LabelExtractor, ModerationEngine, Notifier},
    errors::AppError,
    extraction::{NoopExtractor, RekognitionExtractor},
    memory::{InMemoryActivityLog, InMemoryFileStorage, InMemoryMemeRepository, InMemoryRelationRepository},
    moderation::{ConfidenceThresholdModerator, PermissiveModerator, RekognitionLabelDetector},
    notifications::{LogNotifier, NotificationRouter, SnsNotifier},
    pipeline::{Backends, EngagementPipeline, PipelineSettings},
    repositories::{DynamoDbMemeRepository, DynamoDbRelationRepository, OWNER_INDEX, USER_RELATION_INDEX},
    storage::S3FileStorage,
    AppState,
};
use aws_sdk_dynamodb::{
    error::SdkError as DynamoSdkError,
    types::{
        AttributeDefinition, BillingMode, GlobalSecondaryIndex, KeySchemaElement, KeyType, Projection, ProjectionType,
        ScalarAttributeType,
    },
    Client as DynamoDbClient,
};
use aws_sdk_s3::{
    error::SdkError as S3SdkError,
    types::{BucketLocationConstraint, CreateBucketConfiguration},
    Client as S3Client,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing;

struct IndexSpec<'a> {
    name: &'a str,
    key_schema: &'a [(&'a str, KeyType)],
}

struct TableSpec<'a> {
    name: &'a str,
    attributes: &'a [&'a str],
    key_schema: &'a [(&'a str, KeyType)],
    indexes: &'a [IndexSpec<'a>],
}

fn key_schema(elements: &[(&str, KeyType)]) -> Result<Vec<KeySchemaElement>, AppError> {
    elements
        .iter()
        .map(|(name, key_type)| {
            KeySchemaElement::builder()
                .attribute_name(*name)
                .key_type(key_type.clone())
                .build()
                .map_err(AppError::from)
        })
        .collect()
}

/// Creates the DynamoDB table if it doesn't exist.
async fn create_dynamodb_table_if_not_exists(client: &DynamoDbClient, spec: &TableSpec<'_>) -> Result<(), AppError> {
    let mut request = client
        .create_table()
        .table_name(spec.name)
        .set_key_schema(Some(key_schema(spec.key_schema)?))
        .billing_mode(BillingMode::PayPerRequest);

    for attribute in spec.attributes {
        request = request.attribute_definitions(
            AttributeDefinition::builder()
                .attribute_name(*attribute)
                .attribute_type(ScalarAttributeType::S)
                .build()?,
        );
    }
    for index in spec.indexes {
        request = request.global_secondary_indexes(
            GlobalSecondaryIndex::builder()
                .index_name(index.name)
                .set_key_schema(Some(key_schema(index.key_schema)?))
                .projection(Projection::builder().projection_type(ProjectionType::All).build())
                .build()?,
        );
    }

    match request.send().await {
        Ok(_) => {
            tracing::info!("Startup: Table '{}' created successfully or setup initiated.", spec.name);
            Ok(())
        }
        Err(e) => {
            if let DynamoSdkError::ServiceError(service_err) = &e {
                if service_err.err().is_resource_in_use_exception() {
                    tracing::info!("Startup: Table '{}' already exists, no action needed.", spec.name);
                    return Ok(());
                }
                tracing::error!("Startup: Service error creating DynamoDB table '{}': {:?}", spec.name, service_err);
            }
            Err(AppError::InitError(format!("Startup: Failed to create DynamoDB table '{}': {}", spec.name, e)))
        }
    }
}

/// Ensures the S3 bucket exists, creating it with the correct location constraint if needed.
async fn ensure_s3_bucket_exists(client: &S3Client, bucket_name: &str, region_str: &str) -> Result<(), AppError> {
    let mut create_bucket_req_builder = client.create_bucket().bucket(bucket_name);
    if region_str != "us-east-1" {
        create_bucket_req_builder = create_bucket_req_builder.create_bucket_configuration(
            CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region_str))
                .build(),
        );
    }

    match create_bucket_req_builder.send().await {
        Ok(_) => {
            tracing::info!("Startup: S3 bucket '{}' created.", bucket_name);
            Ok(())
        }
        Err(sdk_err) => {
            if let S3SdkError::ServiceError(service_err) = &sdk_err {
                let code = service_err.err().meta().code();
                if code == Some("BucketAlreadyOwnedByYou") || code == Some("BucketAlreadyExists") {
                    tracing::info!("Startup: S3 bucket '{}' already exists.", bucket_name);
                    return Ok(());
                }
                tracing::error!("Startup: Service error creating S3 bucket '{}': {:?}", bucket_name, service_err);
            }
            Err(AppError::InitError(format!("Startup: Failed to create S3 bucket '{}': {}", bucket_name, sdk_err)))
        }
    }
}

/// Initializes the memes, relations and activity tables and the image bucket.
pub async fn init_resources(clients: &AwsClients, config: &Config, bucket_name: &str) -> Result<(), AppError> {
    tracing::info!("Startup: Initializing AWS resources...");

    let tables = [
        TableSpec {
            name: &config.memes_table,
            attributes: &["meme_id", "owner", "created_at"],
            key_schema: &[("meme_id", KeyType::Hash)],
            indexes: &[IndexSpec {
                name: OWNER_INDEX,
                key_schema: &[("owner", KeyType::Hash), ("created_at", KeyType::Range)],
            }],
        },
        TableSpec {
            name: &config.relations_table,
            attributes: &["relation_key", "user"],
            key_schema: &[("relation_key", KeyType::Hash), ("user", KeyType::Range)],
            indexes: &[IndexSpec {
                name: USER_RELATION_INDEX,
                key_schema: &[("user", KeyType::Hash), ("relation_key", KeyType::Range)],
            }],
        },
        TableSpec {
            name: &config.activity_table,
            attributes: &["log_id"],
            key_schema: &[("log_id", KeyType::Hash)],
            indexes: &[],
        },
    ];
    for table in &tables {
        create_dynamodb_table_if_not_exists(&clients.dynamodb, table).await?;
    }

    ensure_s3_bucket_exists(&clients.s3, bucket_name, &config.aws_region).await?;
    tracing::info!("Startup: AWS resource initialization complete.");
    Ok(())
}

fn needs_aws(config: &Config) -> bool {
    config.storage_backend == StorageBackend::Aws
        || config.moderation_backend == ModerationBackend::Rekognition
        || config.extraction_backend == ExtractionBackend::Rekognition
        || config.notifier_backend == NotifierBackend::Sns
}

fn require_aws(clients: Option<&AwsClients>) -> Result<&AwsClients, AppError> {
    clients.ok_or_else(|| AppError::InitError("AWS clients were not initialized".to_string()))
}

/// Selects and wires every backend named in `config`. The returned handle is the side-effect worker.
pub async fn build_state(config: &Config) -> Result<(AppState, JoinHandle<()>), AppError> {
    let aws = if needs_aws(config) {
        let sdk_config = create_sdk_config(config).await;
        Some(AwsClients::new(&sdk_config))
    } else {
        None
    };

    let moderation: Arc<dyn ModerationEngine> = match config.moderation_backend {
        ModerationBackend::Permissive => Arc::new(PermissiveModerator),
        ModerationBackend::Rekognition => {
            let clients = require_aws(aws.as_ref())?;
            Arc::new(ConfidenceThresholdModerator::new(
                Arc::new(RekognitionLabelDetector::new(clients.rekognition.clone())),
                &config.disallowed_labels,
                config.classifier_timeout,
            ))
        }
    };

    let extractor: Arc<dyn LabelExtractor> = match config.extraction_backend {
        ExtractionBackend::None => Arc::new(NoopExtractor),
        ExtractionBackend::Rekognition => {
            let clients = require_aws(aws.as_ref())?;
            Arc::new(RekognitionExtractor::new(clients.rekognition.clone(), config.classifier_timeout))
        }
    };

    let notifier: Arc<dyn Notifier> = match config.notifier_backend {
        NotifierBackend::Log => Arc::new(LogNotifier),
        NotifierBackend::Sns => Arc::new(SnsNotifier::new(require_aws(aws.as_ref())?.sns.clone())),
    };

    let (backends, activity_log): (Backends, Arc<dyn ActivityLog>) = match config.storage_backend {
        StorageBackend::Memory => {
            tracing::info!("Startup: Using in-memory metadata, relations, blobs and activity log");
            (
                Backends {
                    memes: Arc::new(InMemoryMemeRepository::new()),
                    relations: Arc::new(InMemoryRelationRepository::new()),
                    storage: Arc::new(InMemoryFileStorage::new()),
                    moderation,
                    extractor,
                },
                Arc::new(InMemoryActivityLog::new()),
            )
        }
        StorageBackend::Aws => {
            let clients = require_aws(aws.as_ref())?;
            let bucket_name = config
                .meme_bucket_name
                .clone()
                .ok_or_else(|| AppError::ConfigError("MEME_BUCKET_NAME is required for aws storage".to_string()))?;
            init_resources(clients, config, &bucket_name).await?;
            (
                Backends {
                    memes: Arc::new(DynamoDbMemeRepository::new(clients.dynamodb.clone(), config.memes_table.clone())),
                    relations: Arc::new(DynamoDbRelationRepository::new(
                        clients.dynamodb.clone(),
                        config.relations_table.clone(),
                    )),
                    storage: Arc::new(S3FileStorage::new(clients.s3.clone(), bucket_name)),
                    moderation,
                    extractor,
                },
                Arc::new(DynamoDbActivityLog::new(clients.dynamodb.clone(), config.activity_table.clone())),
            )
        }
    };

    let router = NotificationRouter::new(notifier, config.notification_channels.clone());
    let (side_effects, worker) = SideEffects::spawn(activity_log.clone(), router, config.side_effect_queue);

    let settings = PipelineSettings {
        min_confidence: config.min_confidence,
        retrieval_ttl: config.presigned_expiration,
    };
    let pipeline = EngagementPipeline::new(backends, side_effects, settings);

    tracing::info!(
        storage = ?config.storage_backend,
        moderation = ?config.moderation_backend,
        extraction = ?config.extraction_backend,
        notifier = ?config.notifier_backend,
        "Startup: Backends wired"
    );
    Ok((
        AppState {
            pipeline: Arc::new(pipeline),
            activity_log,
            max_upload_bytes: config.max_upload_bytes,
        },
        worker,
    ))
}
