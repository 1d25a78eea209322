use aws_sdk_servicequotas::types::RequestStatus;

use crate::{aws::retry, errors::AwsError};

use super::AwsClients;

/// Terminal summary of a quota change request's history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaRequestHistory {
    /// No request for this (quota, value) tuple was ever filed.
    None,
    Pending,
    Approved,
    Denied,
}

impl AwsClients {
    /// Currently applied value of a quota.
    pub async fn get_service_quota(
        &self,
        service_code: &str,
        quota_code: &str,
    ) -> Result<f64, AwsError> {
        let resp = retry::retry_transient("servicequotas:GetServiceQuota", || {
            self.servicequotas
                .get_service_quota()
                .service_code(service_code)
                .quota_code(quota_code)
                .send()
        })
        .await?;
        resp.quota()
            .and_then(|q| q.value())
            .ok_or(AwsError::MissingField("Quota.Value"))
    }

    /// Submit an increase request. `ResourceAlreadyExistsException` means a
    /// request for this tuple is already in flight and counts as success.
    pub async fn request_service_quota_increase(
        &self,
        service_code: &str,
        quota_code: &str,
        desired_value: f64,
    ) -> Result<(), AwsError> {
        let result = retry::retry_transient("servicequotas:RequestServiceQuotaIncrease", || {
            self.servicequotas
                .request_service_quota_increase()
                .service_code(service_code)
                .quota_code(quota_code)
                .desired_value(desired_value)
                .send()
        })
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.code() == "ResourceAlreadyExistsException" => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Inspect the change history for a (quota, desired value) tuple.
    pub async fn quota_request_history(
        &self,
        service_code: &str,
        quota_code: &str,
        desired_value: f64,
    ) -> Result<QuotaRequestHistory, AwsError> {
        let resp = retry::retry_transient(
            "servicequotas:ListRequestedServiceQuotaChangeHistoryByQuota",
            || {
                self.servicequotas
                    .list_requested_service_quota_change_history_by_quota()
                    .service_code(service_code)
                    .quota_code(quota_code)
                    .send()
            },
        )
        .await;
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) if e.is_not_found() => return Ok(QuotaRequestHistory::None),
            Err(e) => return Err(e),
        };

        let mut history = QuotaRequestHistory::None;
        for request in resp.requested_quotas() {
            if request.desired_value() != Some(desired_value) {
                continue;
            }
            match request.status() {
                Some(RequestStatus::Pending) | Some(RequestStatus::CaseOpened) => {
                    history = QuotaRequestHistory::Pending;
                }
                Some(RequestStatus::Approved) | Some(RequestStatus::CaseClosed) => {
                    return Ok(QuotaRequestHistory::Approved);
                }
                Some(RequestStatus::Denied) => {
                    return Ok(QuotaRequestHistory::Denied);
                }
                _ => {}
            }
        }
        Ok(history)
    }
}
