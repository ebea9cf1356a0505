//! S3-compatible evidence store.
//!
//! Credentials come from the service-account JSON file when one is
//! configured, otherwise from the default AWS provider chain.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::ByteStream;
use serde::Deserialize;
use vigil_core::archive::StorageReference;
use vigil_core::hashing::UploadKey;

use super::{object_name, EvidenceMetadata, EvidenceStore, StoreError};

/// Provider name attached to file-based credentials.
const CREDENTIALS_PROVIDER: &str = "vigil-service-account";

/// Service-account credential file layout.
#[derive(Debug, Deserialize)]
struct ServiceAccount {
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    session_token: Option<String>,
}

fn load_service_account(path: &Path) -> Result<Credentials, StoreError> {
    let raw = std::fs::read(path).map_err(|e| {
        StoreError::Permanent(format!(
            "Cannot read credential file {}: {e}",
            path.display()
        ))
    })?;
    let account: ServiceAccount = serde_json::from_slice(&raw).map_err(|e| {
        StoreError::Permanent(format!(
            "Invalid credential file {}: {e}",
            path.display()
        ))
    })?;
    Ok(Credentials::new(
        account.access_key_id,
        account.secret_access_key,
        account.session_token,
        None,
        CREDENTIALS_PROVIDER,
    ))
}

pub struct S3EvidenceStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3EvidenceStore {
    /// Build a client for `bucket`. Does not contact the service.
    pub async fn connect(
        bucket: String,
        region: String,
        endpoint: Option<String>,
        prefix: String,
        credentials_path: Option<&Path>,
    ) -> Result<Self, StoreError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region));
        if let Some(path) = credentials_path {
            loader = loader.credentials_provider(load_service_account(path)?);
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket,
            prefix: prefix.trim_matches('/').to_string(),
        })
    }

    fn object_key(&self, key: &UploadKey, file_name: &str) -> String {
        let name = object_name(key, file_name);
        if self.prefix.is_empty() {
            name
        } else {
            format!("{}/{name}", self.prefix)
        }
    }
}

fn classify(err: SdkError<PutObjectError>) -> StoreError {
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            if status >= 500 || status == 429 || status == 408 {
                StoreError::Transient(message)
            } else {
                StoreError::Permanent(message)
            }
        }
        SdkError::ConstructionFailure(_) => StoreError::Permanent(message),
        _ => StoreError::Transient(message),
    }
}

#[async_trait]
impl EvidenceStore for S3EvidenceStore {
    fn backend(&self) -> &'static str {
        "s3"
    }

    async fn put(
        &self,
        key: &UploadKey,
        bytes: &[u8],
        metadata: &EvidenceMetadata,
    ) -> Result<StorageReference, StoreError> {
        let object_key = self.object_key(key, &metadata.file_name);

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .content_type(metadata.content_type())
            .body(ByteStream::from(bytes.to_vec()));
        for (name, value) in metadata.to_pairs() {
            request = request.metadata(name, value);
        }

        request.send().await.map_err(classify)?;
        tracing::debug!(bucket = %self.bucket, key = %object_key, "Uploaded evidence object");

        Ok(StorageReference::new(format!(
            "s3://{}/{object_key}",
            self.bucket
        )))
    }
}
