//! Typed facade over the provider APIs.
//!
//! Clients are cheap: every reconcile builds the bundle it needs through
//! [`AwsClientBuilder`] rather than sharing clients across reconciles.
//! Transient provider errors are retried inside the facade; everything else
//! surfaces as a classified [`AwsError`](crate::errors::AwsError).

pub mod assume;
pub mod ec2;
pub mod iam;
pub mod organizations;
pub mod policy;
pub mod quotas;
pub mod retry;
pub mod storage;
pub mod support;

use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_sts::config::Credentials;
use kube::Client;

use crate::{errors::AwsError, Error, Result};

/// Secret keys of a long-lived credential payload.
pub const ACCESS_KEY_ID: &str = "aws_access_key_id";
pub const SECRET_ACCESS_KEY: &str = "aws_secret_access_key";
pub const USER_NAME_KEY: &str = "aws_user_name";
/// Secret key of an STS payload.
pub const ROLE_ARN_KEY: &str = "role_arn";

/// One bundle of service clients scoped to a single account + region.
#[derive(Clone)]
pub struct AwsClients {
    pub region: String,
    pub organizations: aws_sdk_organizations::Client,
    pub iam: aws_sdk_iam::Client,
    pub sts: aws_sdk_sts::Client,
    pub ec2: aws_sdk_ec2::Client,
    pub s3: aws_sdk_s3::Client,
    pub route53: aws_sdk_route53::Client,
    pub support: aws_sdk_support::Client,
    pub servicequotas: aws_sdk_servicequotas::Client,
}

impl AwsClients {
    pub fn from_sdk_config(config: &SdkConfig) -> Self {
        Self {
            region: config
                .region()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "us-east-1".to_string()),
            organizations: aws_sdk_organizations::Client::new(config),
            iam: aws_sdk_iam::Client::new(config),
            sts: aws_sdk_sts::Client::new(config),
            ec2: aws_sdk_ec2::Client::new(config),
            s3: aws_sdk_s3::Client::new(config),
            route53: aws_sdk_route53::Client::new(config),
            support: aws_sdk_support::Client::new(config),
            servicequotas: aws_sdk_servicequotas::Client::new(config),
        }
    }

    /// Caller identity via STS, with transient retry.
    pub async fn get_caller_identity(&self) -> Result<(String, String), AwsError> {
        let resp = retry::retry_transient("sts:GetCallerIdentity", || {
            self.sts.get_caller_identity().send()
        })
        .await?;
        let account = resp
            .account()
            .ok_or(AwsError::MissingField("Account"))?
            .to_string();
        let arn = resp.arn().ok_or(AwsError::MissingField("Arn"))?.to_string();
        Ok((account, arn))
    }
}

pub async fn sdk_config_from_static_keys(
    access_key_id: &str,
    secret_access_key: &str,
    session_token: Option<String>,
    region: &str,
) -> SdkConfig {
    let credentials = Credentials::new(
        access_key_id,
        secret_access_key,
        session_token,
        None,
        "account-operator",
    );
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .credentials_provider(credentials)
        .load()
        .await
}

/// Builds client bundles from Kubernetes secrets holding long-lived keys.
#[derive(Clone)]
pub struct AwsClientBuilder {
    kube: Client,
}

impl AwsClientBuilder {
    pub fn new(kube: Client) -> Self {
        Self { kube }
    }

    /// Build a bundle from the long-lived keys in `namespace/secret_name`.
    pub async fn from_secret(
        &self,
        secret_name: &str,
        namespace: &str,
        region: &str,
    ) -> Result<AwsClients> {
        let secret_api = kube::Api::namespaced(self.kube.clone(), namespace);
        let data =
            crate::fetch_all_decoded_data_from_secret(secret_api, secret_name.to_string()).await?;
        let access_key_id = data
            .get(ACCESS_KEY_ID)
            .ok_or_else(|| Error::MissingSecretError(format!("{secret_name}: {ACCESS_KEY_ID}")))?;
        let secret_access_key = data.get(SECRET_ACCESS_KEY).ok_or_else(|| {
            Error::MissingSecretError(format!("{secret_name}: {SECRET_ACCESS_KEY}"))
        })?;
        let config =
            sdk_config_from_static_keys(access_key_id, secret_access_key, None, region).await;
        Ok(AwsClients::from_sdk_config(&config))
    }
}
