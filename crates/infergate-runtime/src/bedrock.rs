//! Amazon Bedrock adapters for the external-service contracts.
//!
//! This module is feature-gated behind `bedrock`.

#![cfg(feature = "bedrock")]

use async_trait::async_trait;
use aws_sdk_bedrock::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_bedrock::types::{
    ModelInvocationJobInputDataConfig, ModelInvocationJobOutputDataConfig,
    ModelInvocationJobS3InputDataConfig, ModelInvocationJobS3OutputDataConfig,
};
use aws_sdk_bedrockruntime::primitives::Blob;
use serde_json::Value;
use tracing::debug;

use infergate_kernel::{JobHandle, ServiceError, WorkUnitStatus};

use crate::service::{BatchJobService, Invoker, JobDescription, JobSubmission, WorkUnit};

const TRANSIENT_CODES: [&str; 4] = [
    "ThrottlingException",
    "ServiceUnavailableException",
    "InternalServerException",
    "ModelNotReadyException",
];

fn classify<E, R>(err: SdkError<E, R>) -> ServiceError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            ServiceError::Transient(message)
        }
        SdkError::ServiceError(service_err) => {
            let transient = service_err
                .err()
                .code()
                .is_some_and(|code| TRANSIENT_CODES.contains(&code));
            if transient {
                ServiceError::Transient(message)
            } else {
                ServiceError::Permanent(message)
            }
        }
        _ => ServiceError::Permanent(message),
    }
}

fn parse_status(raw: &str) -> Result<WorkUnitStatus, ServiceError> {
    raw.parse::<WorkUnitStatus>()
        .map_err(|e| ServiceError::Permanent(e.to_string()))
}

/// Batch jobs through Bedrock model invocation jobs.
#[derive(Clone, Debug)]
pub struct BedrockBatchService {
    client: aws_sdk_bedrock::Client,
    model_id: String,
}

impl BedrockBatchService {
    pub fn new(client: aws_sdk_bedrock::Client, model_id: impl Into<String>) -> Self {
        Self {
            client,
            model_id: model_id.into(),
        }
    }

    /// Client built from the default AWS credential and region chain.
    pub async fn from_env(model_id: impl Into<String>) -> Self {
        let sdk_config = aws_config::load_from_env().await;
        Self::new(aws_sdk_bedrock::Client::new(&sdk_config), model_id)
    }
}

#[async_trait]
impl BatchJobService for BedrockBatchService {
    async fn count_active_jobs(&self, name_filter: &str) -> Result<usize, ServiceError> {
        let mut active = 0;
        let mut next_token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_model_invocation_jobs()
                .name_contains(name_filter)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(classify)?;
            active += page
                .invocation_job_summaries()
                .iter()
                .filter_map(|job| job.status())
                .filter_map(|status| status.as_str().parse::<WorkUnitStatus>().ok())
                .filter(WorkUnitStatus::is_in_flight)
                .count();
            match page.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }
        debug!(name_filter, active, "counted active batch jobs");
        Ok(active)
    }

    async fn submit_job(&self, submission: &JobSubmission) -> Result<JobHandle, ServiceError> {
        let input = ModelInvocationJobS3InputDataConfig::builder()
            .s3_uri(&submission.input_uri)
            .build()
            .map_err(|e| ServiceError::Permanent(e.to_string()))?;
        let output = ModelInvocationJobS3OutputDataConfig::builder()
            .s3_uri(&submission.output_uri)
            .build()
            .map_err(|e| ServiceError::Permanent(e.to_string()))?;
        let created = self
            .client
            .create_model_invocation_job()
            .job_name(&submission.name)
            .role_arn(&submission.execution_role)
            .model_id(&self.model_id)
            .input_data_config(ModelInvocationJobInputDataConfig::S3InputDataConfig(input))
            .output_data_config(ModelInvocationJobOutputDataConfig::S3OutputDataConfig(output))
            .send()
            .await
            .map_err(classify)?;
        Ok(created.job_arn().to_string())
    }

    async fn describe_job(&self, handle: &str) -> Result<JobDescription, ServiceError> {
        let job = self
            .client
            .get_model_invocation_job()
            .job_identifier(handle)
            .send()
            .await
            .map_err(classify)?;
        let status = job
            .status()
            .ok_or_else(|| ServiceError::Permanent(format!("job {handle} has no status")))?;
        Ok(JobDescription {
            status: parse_status(status.as_str())?,
            output_location_hint: None,
        })
    }
}

/// On-demand invocation through `InvokeModel`. The unit payload is the request body.
#[derive(Clone, Debug)]
pub struct BedrockInvoker {
    client: aws_sdk_bedrockruntime::Client,
    model_id: String,
}

impl BedrockInvoker {
    pub fn new(client: aws_sdk_bedrockruntime::Client, model_id: impl Into<String>) -> Self {
        Self {
            client,
            model_id: model_id.into(),
        }
    }

    pub async fn from_env(model_id: impl Into<String>) -> Self {
        let sdk_config = aws_config::load_from_env().await;
        Self::new(aws_sdk_bedrockruntime::Client::new(&sdk_config), model_id)
    }
}

#[async_trait]
impl Invoker for BedrockInvoker {
    async fn invoke(&self, unit: &WorkUnit) -> Result<Value, ServiceError> {
        let body = serde_json::to_vec(&unit.payload)
            .map_err(|e| ServiceError::Permanent(format!("encode request body: {e}")))?;
        let response = self
            .client
            .invoke_model()
            .model_id(&self.model_id)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(body))
            .send()
            .await
            .map_err(classify)?;
        serde_json::from_slice(response.body().as_ref())
            .map_err(|e| ServiceError::Permanent(format!("decode response body: {e}")))
    }
}
