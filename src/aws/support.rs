use crate::{aws::retry, errors::AwsError};

use super::AwsClients;

/// Severity used for limit-increase cases; these are routine.
const CASE_SEVERITY: &str = "normal";
const CASE_SERVICE_CODE: &str = "service-limit-increase";
const CASE_CATEGORY_CODE: &str = "ec2-instances";
const CASE_RESOLVED_STATUS: &str = "resolved";

impl AwsClients {
    /// Open a support case asking for the instance-limit raise every new
    /// account needs, returning the case id.
    pub async fn open_limit_increase_case(&self, account_id: &str) -> Result<String, AwsError> {
        let subject = format!("Limit increase request for account {account_id}");
        let body = format!(
            "Please raise the default EC2 instance limits for account {account_id} to \
             production levels."
        );
        let resp = retry::retry_transient("support:CreateCase", || {
            self.support
                .create_case()
                .subject(&subject)
                .communication_body(&body)
                .service_code(CASE_SERVICE_CODE)
                .category_code(CASE_CATEGORY_CODE)
                .severity_code(CASE_SEVERITY)
                .send()
        })
        .await?;
        resp.case_id()
            .map(str::to_string)
            .ok_or(AwsError::MissingField("CaseId"))
    }

    /// Whether the given case has been resolved. A case the provider no
    /// longer knows about counts as resolved.
    pub async fn support_case_resolved(&self, case_id: &str) -> Result<bool, AwsError> {
        let resp = retry::retry_transient("support:DescribeCases", || {
            self.support
                .describe_cases()
                .case_id_list(case_id)
                .include_resolved_cases(true)
                .send()
        })
        .await;
        match resp {
            Ok(resp) => Ok(resp
                .cases()
                .iter()
                .find(|c| c.case_id() == Some(case_id))
                .map(|c| c.status() == Some(CASE_RESOLVED_STATUS))
                .unwrap_or(true)),
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e),
        }
    }
}
