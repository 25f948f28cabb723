use crate::config::Config;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::Credentials;
use aws_sdk_dynamodb::Client as DynamoDbClient;
use aws_sdk_rekognition::Client as RekognitionClient;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_sns::Client as SnsClient;
use tracing;

/// Every AWS client the service may use, built from one shared `SdkConfig`.
#[derive(Debug, Clone)]
pub struct AwsClients {
    pub dynamodb: DynamoDbClient,
    pub s3: S3Client,
    pub rekognition: RekognitionClient,
    pub sns: SnsClient,
}

// Creates the base AWS SDK configuration based on application config.
// With an endpoint override and no credentials in the environment, LocalStack's
// static test credentials are used instead of the default provider chain.
pub async fn create_sdk_config(config: &Config) -> SdkConfig {
    let region = Region::new(config.aws_region.clone());
    tracing::info!(sdk_region = %config.aws_region, "Setting SDK region");

    let mut config_loader = aws_config::defaults(BehaviorVersion::latest()).region(region);

    if let Some(endpoint_url) = &config.localstack_endpoint {
        tracing::info!("Using localstack endpoint override: {}", endpoint_url);
        config_loader = config_loader.endpoint_url(endpoint_url);

        if std::env::var_os("AWS_ACCESS_KEY_ID").is_none() {
            tracing::info!("No AWS credentials in environment, using static LocalStack credentials");
            let credentials = Credentials::new("test", "test", None, None, "localstack");
            config_loader = config_loader.credentials_provider(credentials);
        }
    } else {
        tracing::info!("Using default AWS endpoints and credential resolution.");
    }

    config_loader.load().await
}

impl AwsClients {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            dynamodb: DynamoDbClient::new(sdk_config),
            s3: create_s3_client(sdk_config),
            rekognition: RekognitionClient::new(sdk_config),
            sns: SnsClient::new(sdk_config),
        }
    }
}

// Path-style addressing keeps bucket names out of the hostname, which LocalStack needs.
fn create_s3_client(sdk_config: &SdkConfig) -> S3Client {
    let s3_config = aws_sdk_s3::config::Builder::from(sdk_config)
        .force_path_style(true)
        .build();
    S3Client::from_conf(s3_config)
}
