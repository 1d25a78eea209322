use aws_sdk_iam::types::{PolicyScopeType, Role};

use crate::{
    aws::{policy::PolicyDocument, retry},
    errors::AwsError,
    Result,
};

use super::AwsClients;

/// A freshly minted long-lived key pair.
#[derive(Clone, Debug)]
pub struct AccessKey {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub user_name: String,
}

impl AwsClients {
    /// Create an IAM user, treating `EntityAlreadyExists` as success.
    pub async fn ensure_user(&self, user_name: &str) -> Result<(), AwsError> {
        let result = retry::retry_transient("iam:CreateUser", || {
            self.iam.create_user().user_name(user_name).send()
        })
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.code() == "EntityAlreadyExists" => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn attach_user_policy(
        &self,
        user_name: &str,
        policy_arn: &str,
    ) -> Result<(), AwsError> {
        retry::retry_transient("iam:AttachUserPolicy", || {
            self.iam
                .attach_user_policy()
                .user_name(user_name)
                .policy_arn(policy_arn)
                .send()
        })
        .await?;
        Ok(())
    }

    pub async fn create_access_key(&self, user_name: &str) -> Result<AccessKey, AwsError> {
        let resp = retry::retry_transient("iam:CreateAccessKey", || {
            self.iam.create_access_key().user_name(user_name).send()
        })
        .await?;
        let key = resp.access_key().ok_or(AwsError::MissingField("AccessKey"))?;
        Ok(AccessKey {
            access_key_id: key.access_key_id().to_string(),
            secret_access_key: key.secret_access_key().to_string(),
            user_name: user_name.to_string(),
        })
    }

    /// Remove every existing key of the user. Used before minting fresh ones
    /// so rotation never trips the two-key limit.
    pub async fn delete_all_access_keys(&self, user_name: &str) -> Result<(), AwsError> {
        let resp = retry::retry_transient("iam:ListAccessKeys", || {
            self.iam.list_access_keys().user_name(user_name).send()
        })
        .await;
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        for metadata in resp.access_key_metadata() {
            if let Some(key_id) = metadata.access_key_id() {
                retry::retry_transient("iam:DeleteAccessKey", || {
                    self.iam
                        .delete_access_key()
                        .user_name(user_name)
                        .access_key_id(key_id)
                        .send()
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Full teardown of a user: keys, attached policies, then the user.
    /// Not-found at any step is fine; the user may be half-deleted.
    pub async fn delete_user(&self, user_name: &str) -> Result<(), AwsError> {
        self.delete_all_access_keys(user_name).await?;

        let attached = retry::retry_transient("iam:ListAttachedUserPolicies", || {
            self.iam
                .list_attached_user_policies()
                .user_name(user_name)
                .send()
        })
        .await;
        match attached {
            Ok(resp) => {
                for policy in resp.attached_policies() {
                    if let Some(arn) = policy.policy_arn() {
                        retry::retry_transient("iam:DetachUserPolicy", || {
                            self.iam
                                .detach_user_policy()
                                .user_name(user_name)
                                .policy_arn(arn)
                                .send()
                        })
                        .await?;
                    }
                }
            }
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }

        let deleted = retry::retry_transient("iam:DeleteUser", || {
            self.iam.delete_user().user_name(user_name).send()
        })
        .await;
        match deleted {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Create a role with the given trust policy; returns it. The caller
    /// decides what `EntityAlreadyExists` means for its flow.
    pub async fn create_role(
        &self,
        role_name: &str,
        trust_policy: &PolicyDocument,
        description: &str,
    ) -> Result<Role, AwsError> {
        let document = trust_policy
            .marshal()
            .map_err(|e| AwsError::Validation {
                code: "MalformedPolicyDocument".to_string(),
                message: e.to_string(),
            })?;
        let resp = retry::retry_transient("iam:CreateRole", || {
            self.iam
                .create_role()
                .role_name(role_name)
                .assume_role_policy_document(&document)
                .description(description)
                .send()
        })
        .await?;
        resp.role().cloned().ok_or(AwsError::MissingField("Role"))
    }

    pub async fn get_role(&self, role_name: &str) -> Result<Role, AwsError> {
        let resp = retry::retry_transient("iam:GetRole", || {
            self.iam.get_role().role_name(role_name).send()
        })
        .await?;
        resp.role().cloned().ok_or(AwsError::MissingField("Role"))
    }

    pub async fn delete_role(&self, role_name: &str) -> Result<(), AwsError> {
        let result = retry::retry_transient("iam:DeleteRole", || {
            self.iam.delete_role().role_name(role_name).send()
        })
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn create_policy(
        &self,
        policy_name: &str,
        document: &PolicyDocument,
        description: &str,
    ) -> Result<String, AwsError> {
        let marshalled = document.marshal().map_err(|e| AwsError::Validation {
            code: "MalformedPolicyDocument".to_string(),
            message: e.to_string(),
        })?;
        let resp = retry::retry_transient("iam:CreatePolicy", || {
            self.iam
                .create_policy()
                .policy_name(policy_name)
                .policy_document(&marshalled)
                .description(description)
                .send()
        })
        .await?;
        resp.policy()
            .and_then(|p| p.arn())
            .map(str::to_string)
            .ok_or(AwsError::MissingField("Policy.Arn"))
    }

    /// Delete a customer-managed policy, including its non-default versions.
    pub async fn delete_policy(&self, policy_arn: &str) -> Result<(), AwsError> {
        let versions = retry::retry_transient("iam:ListPolicyVersions", || {
            self.iam.list_policy_versions().policy_arn(policy_arn).send()
        })
        .await;
        match versions {
            Ok(resp) => {
                for version in resp.versions() {
                    if version.is_default_version() {
                        continue;
                    }
                    if let Some(id) = version.version_id() {
                        retry::retry_transient("iam:DeletePolicyVersion", || {
                            self.iam
                                .delete_policy_version()
                                .policy_arn(policy_arn)
                                .version_id(id)
                                .send()
                        })
                        .await?;
                    }
                }
            }
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
        let deleted = retry::retry_transient("iam:DeletePolicy", || {
            self.iam.delete_policy().policy_arn(policy_arn).send()
        })
        .await;
        match deleted {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Look up a provider-managed policy ARN by name via paginated
    /// ListPolicies.
    pub async fn find_managed_policy_arn(&self, name: &str) -> Result<Option<String>, AwsError> {
        let mut marker: Option<String> = None;
        loop {
            let token = marker.clone();
            let page = retry::retry_transient("iam:ListPolicies", || {
                self.iam
                    .list_policies()
                    .scope(PolicyScopeType::Aws)
                    .set_marker(token.clone())
                    .send()
            })
            .await?;
            if let Some(policy) = page.policies().iter().find(|p| p.policy_name() == Some(name)) {
                return Ok(policy.arn().map(str::to_string));
            }
            if page.is_truncated() {
                marker = page.marker().map(str::to_string);
            } else {
                return Ok(None);
            }
        }
    }

    pub async fn attach_role_policy(
        &self,
        role_name: &str,
        policy_arn: &str,
    ) -> Result<(), AwsError> {
        retry::retry_transient("iam:AttachRolePolicy", || {
            self.iam
                .attach_role_policy()
                .role_name(role_name)
                .policy_arn(policy_arn)
                .send()
        })
        .await?;
        Ok(())
    }

    pub async fn detach_role_policy(
        &self,
        role_name: &str,
        policy_arn: &str,
    ) -> Result<(), AwsError> {
        let result = retry::retry_transient("iam:DetachRolePolicy", || {
            self.iam
                .detach_role_policy()
                .role_name(role_name)
                .policy_arn(policy_arn)
                .send()
        })
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// (policy name, policy arn) pairs attached to a role.
    pub async fn list_attached_role_policies(
        &self,
        role_name: &str,
    ) -> Result<Vec<(String, String)>, AwsError> {
        let resp = retry::retry_transient("iam:ListAttachedRolePolicies", || {
            self.iam
                .list_attached_role_policies()
                .role_name(role_name)
                .send()
        })
        .await;
        match resp {
            Ok(resp) => Ok(resp
                .attached_policies()
                .iter()
                .filter_map(|p| match (p.policy_name(), p.policy_arn()) {
                    (Some(name), Some(arn)) => Some((name.to_string(), arn.to_string())),
                    _ => None,
                })
                .collect()),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Attach an inline policy document directly to a role.
    pub async fn put_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        document: &PolicyDocument,
    ) -> Result<(), AwsError> {
        let marshalled = document.marshal().map_err(|e| AwsError::Validation {
            code: "MalformedPolicyDocument".to_string(),
            message: e.to_string(),
        })?;
        retry::retry_transient("iam:PutRolePolicy", || {
            self.iam
                .put_role_policy()
                .role_name(role_name)
                .policy_name(policy_name)
                .policy_document(&marshalled)
                .send()
        })
        .await?;
        Ok(())
    }

    pub async fn list_role_policies(&self, role_name: &str) -> Result<Vec<String>, AwsError> {
        let resp = retry::retry_transient("iam:ListRolePolicies", || {
            self.iam.list_role_policies().role_name(role_name).send()
        })
        .await;
        match resp {
            Ok(resp) => Ok(resp.policy_names().to_vec()),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
    ) -> Result<(), AwsError> {
        let result = retry::retry_transient("iam:DeleteRolePolicy", || {
            self.iam
                .delete_role_policy()
                .role_name(role_name)
                .policy_name(policy_name)
                .send()
        })
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// The URL-encoded document of a policy's default version.
    pub async fn get_policy_document(&self, policy_arn: &str) -> Result<String, AwsError> {
        let policy = retry::retry_transient("iam:GetPolicy", || {
            self.iam.get_policy().policy_arn(policy_arn).send()
        })
        .await?;
        let version_id = policy
            .policy()
            .and_then(|p| p.default_version_id())
            .ok_or(AwsError::MissingField("Policy.DefaultVersionId"))?
            .to_string();
        let version = retry::retry_transient("iam:GetPolicyVersion", || {
            self.iam
                .get_policy_version()
                .policy_arn(policy_arn)
                .version_id(&version_id)
                .send()
        })
        .await?;
        version
            .policy_version()
            .and_then(|v| v.document())
            .map(str::to_string)
            .ok_or(AwsError::MissingField("PolicyVersion.Document"))
    }
}
