use tokio::time::Duration;
use tracing::{debug, warn};

use crate::{config, errors::AwsError};

use super::{sdk_config_from_static_keys, AwsClients};

/// Attempts before giving up on an assumed role becoming visible.
pub const ASSUME_ROLE_ATTEMPTS: u32 = 10;

/// Name of the cross-account role every organization member account carries
/// at creation time.
pub const ORG_ACCESS_ROLE: &str = "OrganizationAccountAccessRole";

pub fn role_arn(account_id: &str, role_name: &str) -> String {
    format!(
        "{}:iam::{}:role/{}",
        config::partition_prefix(),
        account_id,
        role_name
    )
}

/// Obtain a client bundle scoped to `account_id` by assuming `role_name`
/// there.
///
/// Freshly created roles are eventually consistent: the call retries with
/// linear backoff while assumption fails or while the returned
/// `AssumedRoleId` does not contain `expected_role_id` (when given).
pub async fn assume_role_for_account(
    setup: &AwsClients,
    account_id: &str,
    role_name: &str,
    region: &str,
    expected_role_id: Option<&str>,
) -> Result<AwsClients, AwsError> {
    let arn = role_arn(account_id, role_name);
    let session_name = format!("account-operator-{account_id}");

    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = setup
            .sts
            .assume_role()
            .role_arn(&arn)
            .role_session_name(&session_name)
            .send()
            .await;

        let outcome = match result {
            Ok(resp) => {
                let role_id = resp
                    .assumed_role_user()
                    .map(|u| u.assumed_role_id().to_string())
                    .unwrap_or_default();
                match expected_role_id {
                    Some(expected) if !role_id.contains(expected) => Err(format!(
                        "assumed role id {role_id} does not match {expected} yet"
                    )),
                    _ => Ok(resp),
                }
            }
            Err(e) => Err(format!("{e}")),
        };

        match outcome {
            Ok(resp) => {
                let creds = resp
                    .credentials()
                    .ok_or(AwsError::MissingField("Credentials"))?;
                let sdk_config = sdk_config_from_static_keys(
                    creds.access_key_id(),
                    creds.secret_access_key(),
                    Some(creds.session_token().to_string()),
                    region,
                )
                .await;
                debug!("assumed {arn} after {attempt} attempt(s)");
                return Ok(AwsClients::from_sdk_config(&sdk_config));
            }
            Err(reason) if attempt < ASSUME_ROLE_ATTEMPTS => {
                debug!(
                    "assume role {arn} attempt {attempt}/{ASSUME_ROLE_ATTEMPTS}: {reason}"
                );
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
            Err(reason) => {
                warn!("giving up assuming {arn}: {reason}");
                return Err(AwsError::Timeout(format!("assume role {arn}: {reason}")));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn role_arn_uses_commercial_partition_by_default() {
        crate::config::set_fedramp(false);
        assert_eq!(
            role_arn("123456789012", ORG_ACCESS_ROLE),
            "arn:aws:iam::123456789012:role/OrganizationAccountAccessRole"
        );
    }
}
