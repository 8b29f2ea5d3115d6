use crate::{
    aws_clients::{create_dynamodb_client, create_s3_client, create_sdk_config},
    config::{Config, StorageBackend},
    db::{TableNames, COMMENTS_BY_MEME_INDEX},
    domain::IdentityResolver,
    errors::AppError,
    memory::{InMemoryCommentRepository, InMemoryFileStorage, InMemoryIdentityResolver, InMemoryMemeRepository},
    repositories::{DynamoDbCommentRepository, DynamoDbMemeRepository, DynamoDbSessionResolver},
    service::MemeService,
    storage::S3FileStorage,
    AppState,
};
use aws_sdk_dynamodb::{
    error::SdkError as DynamoSdkError,
    operation::create_table::builders::CreateTableFluentBuilder,
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
use tracing;

fn attribute(name: &str, kind: ScalarAttributeType) -> Result<AttributeDefinition, AppError> {
    AttributeDefinition::builder()
        .attribute_name(name)
        .attribute_type(kind)
        .build()
        .map_err(|e| AppError::InitError(format!("Failed to build attribute definition: {}", e)))
}

fn key(name: &str, kind: KeyType) -> Result<KeySchemaElement, AppError> {
    KeySchemaElement::builder()
        .attribute_name(name)
        .key_type(kind)
        .build()
        .map_err(|e| AppError::InitError(format!("Failed to build key schema: {}", e)))
}

/// Sends a CreateTable request, treating "already exists" as success.
async fn create_table_if_not_exists(request: CreateTableFluentBuilder, table_name: &str) -> Result<(), AppError> {
    let result = request
        .table_name(table_name)
        .billing_mode(BillingMode::PayPerRequest)
        .send()
        .await;
    match result {
        Ok(_) => {
            tracing::info!("Startup: Table '{}' created successfully or setup initiated.", table_name);
            Ok(())
        }
        Err(e) => {
            if let DynamoSdkError::ServiceError(service_err) = &e {
                if service_err.err().is_resource_in_use_exception() {
                    tracing::info!("Startup: Table '{}' already exists, no action needed.", table_name);
                    Ok(())
                } else {
                    let context = format!("Startup: Service error creating DynamoDB table '{}'", table_name);
                    tracing::error!("{}: {:?}", context, service_err);
                    Err(AppError::InitError(format!("{}: {}", context, e)))
                }
            } else {
                let context = format!("Startup: SDK error creating DynamoDB table '{}'", table_name);
                tracing::error!("{}: {}", context, e);
                Err(AppError::InitError(format!("{}: {}", context, e)))
            }
        }
    }
}

async fn create_tables(client: &DynamoDbClient, tables: &TableNames) -> Result<(), AppError> {
    let memes = client
        .create_table()
        .attribute_definitions(attribute("meme_id", ScalarAttributeType::S)?)
        .key_schema(key("meme_id", KeyType::Hash)?);
    create_table_if_not_exists(memes, &tables.memes).await?;

    // One row per (meme, voter); the range key makes per-meme cleanup a Query.
    let votes = client
        .create_table()
        .attribute_definitions(attribute("meme_id", ScalarAttributeType::S)?)
        .attribute_definitions(attribute("user_id", ScalarAttributeType::S)?)
        .key_schema(key("meme_id", KeyType::Hash)?)
        .key_schema(key("user_id", KeyType::Range)?);
    create_table_if_not_exists(votes, &tables.votes).await?;

    let by_meme = GlobalSecondaryIndex::builder()
        .index_name(COMMENTS_BY_MEME_INDEX)
        .key_schema(key("meme_id", KeyType::Hash)?)
        .key_schema(key("created_at", KeyType::Range)?)
        .projection(Projection::builder().projection_type(ProjectionType::All).build())
        .build()
        .map_err(|e| AppError::InitError(format!("Failed to build comments index: {}", e)))?;
    let comments = client
        .create_table()
        .attribute_definitions(attribute("comment_id", ScalarAttributeType::S)?)
        .attribute_definitions(attribute("meme_id", ScalarAttributeType::S)?)
        .attribute_definitions(attribute("created_at", ScalarAttributeType::N)?)
        .key_schema(key("comment_id", KeyType::Hash)?)
        .global_secondary_indexes(by_meme);
    create_table_if_not_exists(comments, &tables.comments).await?;

    let sessions = client
        .create_table()
        .attribute_definitions(attribute("token", ScalarAttributeType::S)?)
        .key_schema(key("token", KeyType::Hash)?);
    create_table_if_not_exists(sessions, &tables.sessions).await
}

/// Ensures the S3 bucket exists, creating it with the correct location constraint if needed.
async fn ensure_s3_bucket_exists(client: &S3Client, bucket_name: &str, region_str: &str) -> Result<(), AppError> {
    let mut request = client.create_bucket().bucket(bucket_name);
    if region_str != "us-east-1" {
        request = request.create_bucket_configuration(
            CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region_str))
                .build(),
        );
    }

    match request.send().await {
        Ok(_) => {
            tracing::info!("Startup: S3 bucket '{}' created or already exists.", bucket_name);
            Ok(())
        }
        Err(sdk_err) => {
            if let S3SdkError::ServiceError(service_err) = &sdk_err {
                let code = service_err.err().meta().code();
                if code == Some("BucketAlreadyOwnedByYou") || code == Some("BucketAlreadyExists") {
                    tracing::info!("Startup: S3 bucket '{}' already exists.", bucket_name);
                    Ok(())
                } else {
                    let context = format!("Startup: Service error creating S3 bucket '{}'", bucket_name);
                    tracing::error!("{}: {:?}", context, service_err);
                    Err(AppError::InitError(format!("{}: {}", context, sdk_err)))
                }
            } else {
                let context = format!("Startup: SDK error creating S3 bucket '{}'", bucket_name);
                tracing::error!("{}: {}", context, sdk_err);
                Err(AppError::InitError(format!("{}: {}", context, sdk_err)))
            }
        }
    }
}

/// Initializes required AWS resources (DynamoDB tables, S3 bucket).
pub async fn init_resources(
    db_client: &DynamoDbClient,
    s3_client: &S3Client,
    tables: &TableNames,
    bucket_name: &str,
    region_str: &str,
) -> Result<(), AppError> {
    tracing::info!("Startup: Initializing AWS resources...");
    create_tables(db_client, tables).await?;
    ensure_s3_bucket_exists(s3_client, bucket_name, region_str).await?;
    tracing::info!("Startup: AWS resource initialization complete.");
    Ok(())
}

/// Wires repositories, storage and identity resolution for the configured backend.
pub async fn build_state(config: &Config) -> Result<Arc<AppState>, AppError> {
    match config.backend {
        StorageBackend::Aws => {
            let sdk_config = create_sdk_config(config).await;
            let db_client = create_dynamodb_client(&sdk_config);
            let s3_client = create_s3_client(&sdk_config);
            let tables = TableNames::with_prefix(&config.table_prefix);

            init_resources(&db_client, &s3_client, &tables, &config.meme_bucket_name, &config.aws_region).await?;

            let service = MemeService::new(
                Arc::new(DynamoDbMemeRepository::new(db_client.clone(), tables.clone())),
                Arc::new(DynamoDbCommentRepository::new(db_client.clone(), tables.comments.clone())),
                Arc::new(S3FileStorage::new(
                    s3_client,
                    config.meme_bucket_name.clone(),
                    config.image_base_url.clone(),
                )),
                config.flag_policy,
                config.max_upload_bytes,
            );
            let identity: Arc<dyn IdentityResolver> =
                Arc::new(DynamoDbSessionResolver::new(db_client, tables.sessions));
            Ok(Arc::new(AppState { service, identity }))
        }
        StorageBackend::Memory => {
            tracing::warn!("Startup: Using in-memory storage; data is lost on restart.");
            Ok(Arc::new(memory_state(config).await))
        }
    }
}

/// State backed entirely by process memory, seeded with the configured sessions.
pub async fn memory_state(config: &Config) -> AppState {
    let resolver = InMemoryIdentityResolver::new();
    for (token, identity) in &config.seed_sessions {
        resolver.insert(token.clone(), identity.clone()).await;
    }
    let service = MemeService::new(
        Arc::new(InMemoryMemeRepository::new()),
        Arc::new(InMemoryCommentRepository::new()),
        Arc::new(InMemoryFileStorage::new(config.image_base_url.clone())),
        config.flag_policy,
        config.max_upload_bytes,
    );
    AppState {
        service,
        identity: Arc::new(resolver),
    }
}
