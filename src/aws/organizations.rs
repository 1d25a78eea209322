use aws_sdk_organizations::types::{
    Account, AccountStatus, ChildType, CreateAccountState, CreateAccountStatus, OrganizationalUnit,
};

use crate::{aws::retry, errors::AwsError};

use super::AwsClients;

impl AwsClients {
    /// Kick off creation of a member account; returns the creation request id
    /// to poll with [`describe_create_account_status`].
    pub async fn create_account(
        &self,
        email: &str,
        account_name: &str,
    ) -> Result<String, AwsError> {
        let resp = retry::retry_transient("organizations:CreateAccount", || {
            self.organizations
                .create_account()
                .email(email)
                .account_name(account_name)
                .send()
        })
        .await?;
        resp.create_account_status()
            .and_then(|s| s.id())
            .map(str::to_string)
            .ok_or(AwsError::MissingField("CreateAccountStatus.Id"))
    }

    pub async fn describe_create_account_status(
        &self,
        request_id: &str,
    ) -> Result<CreateAccountStatus, AwsError> {
        let resp = retry::retry_transient("organizations:DescribeCreateAccountStatus", || {
            self.organizations
                .describe_create_account_status()
                .create_account_request_id(request_id)
                .send()
        })
        .await?;
        resp.create_account_status()
            .cloned()
            .ok_or(AwsError::MissingField("CreateAccountStatus"))
    }

    /// All Active accounts in the organization, fully paginated.
    pub async fn list_active_accounts(&self) -> Result<Vec<Account>, AwsError> {
        let mut accounts = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let token = next_token.clone();
            let page = retry::retry_transient("organizations:ListAccounts", || {
                self.organizations
                    .list_accounts()
                    .set_next_token(token.clone())
                    .send()
            })
            .await?;
            accounts.extend(
                page.accounts()
                    .iter()
                    .filter(|a| matches!(a.status(), Some(AccountStatus::Active)))
                    .cloned(),
            );
            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(accounts)
    }

    /// Number of account creations currently in flight.
    pub async fn count_in_progress_creations(&self) -> Result<usize, AwsError> {
        let mut count = 0;
        let mut next_token: Option<String> = None;
        loop {
            let token = next_token.clone();
            let page = retry::retry_transient("organizations:ListCreateAccountStatus", || {
                self.organizations
                    .list_create_account_status()
                    .states(CreateAccountState::InProgress)
                    .set_next_token(token.clone())
                    .send()
            })
            .await?;
            count += page.create_account_statuses().len();
            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(count)
    }

    pub async fn organization_root_id(&self) -> Result<String, AwsError> {
        let resp = retry::retry_transient("organizations:ListRoots", || {
            self.organizations.list_roots().send()
        })
        .await?;
        resp.roots()
            .first()
            .and_then(|r| r.id())
            .map(str::to_string)
            .ok_or(AwsError::MissingField("Roots[0].Id"))
    }

    pub async fn create_organizational_unit(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<OrganizationalUnit, AwsError> {
        let resp = retry::retry_transient("organizations:CreateOrganizationalUnit", || {
            self.organizations
                .create_organizational_unit()
                .parent_id(parent_id)
                .name(name)
                .send()
        })
        .await?;
        resp.organizational_unit()
            .cloned()
            .ok_or(AwsError::MissingField("OrganizationalUnit"))
    }

    pub async fn list_organizational_units_for_parent(
        &self,
        parent_id: &str,
    ) -> Result<Vec<OrganizationalUnit>, AwsError> {
        let mut units = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let token = next_token.clone();
            let page =
                retry::retry_transient("organizations:ListOrganizationalUnitsForParent", || {
                    self.organizations
                        .list_organizational_units_for_parent()
                        .parent_id(parent_id)
                        .set_next_token(token.clone())
                        .send()
                })
                .await?;
            units.extend(page.organizational_units().iter().cloned());
            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(units)
    }

    /// Account ids parented directly under `parent_id`.
    pub async fn list_child_accounts(&self, parent_id: &str) -> Result<Vec<String>, AwsError> {
        let mut children = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let token = next_token.clone();
            let page = retry::retry_transient("organizations:ListChildren", || {
                self.organizations
                    .list_children()
                    .parent_id(parent_id)
                    .child_type(ChildType::Account)
                    .set_next_token(token.clone())
                    .send()
            })
            .await?;
            children.extend(
                page.children()
                    .iter()
                    .filter_map(|c| c.id())
                    .map(str::to_string),
            );
            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(children)
    }

    pub async fn move_account(
        &self,
        account_id: &str,
        source_parent_id: &str,
        destination_parent_id: &str,
    ) -> Result<(), AwsError> {
        retry::retry_transient("organizations:MoveAccount", || {
            self.organizations
                .move_account()
                .account_id(account_id)
                .source_parent_id(source_parent_id)
                .destination_parent_id(destination_parent_id)
                .send()
        })
        .await?;
        Ok(())
    }

    /// Ensure an OU named `name` exists under `parent_id` and return its id.
    pub async fn ensure_organizational_unit(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<String, AwsError> {
        let existing = self.list_organizational_units_for_parent(parent_id).await?;
        if let Some(unit) = existing.iter().find(|u| u.name() == Some(name)) {
            return unit
                .id()
                .map(str::to_string)
                .ok_or(AwsError::MissingField("OrganizationalUnit.Id"));
        }
        let unit = self.create_organizational_unit(parent_id, name).await?;
        unit.id()
            .map(str::to_string)
            .ok_or(AwsError::MissingField("OrganizationalUnit.Id"))
    }
}
