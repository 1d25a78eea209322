use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{apis::federated_types::CustomPolicy, Result};

pub const POLICY_VERSION: &str = "2012-10-17";

/// Provider policy-document dialect. Field order is fixed so marshalling is
/// deterministic and re-marshalling a parsed document is byte-stable.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PolicyDocument {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Statement")]
    pub statement: Vec<PolicyStatement>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PolicyStatement {
    #[serde(rename = "Effect")]
    pub effect: String,
    #[serde(rename = "Action")]
    pub action: Vec<String>,
    #[serde(rename = "Resource", skip_serializing_if = "Option::is_none")]
    pub resource: Option<Vec<String>>,
    #[serde(rename = "Principal", skip_serializing_if = "Option::is_none")]
    pub principal: Option<PolicyPrincipal>,
    #[serde(rename = "Condition", skip_serializing_if = "Option::is_none")]
    pub condition: Option<BTreeMap<String, BTreeMap<String, Vec<String>>>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PolicyPrincipal {
    #[serde(rename = "AWS")]
    pub aws: Vec<String>,
}

impl PolicyDocument {
    pub fn new(statement: Vec<PolicyStatement>) -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            statement,
        }
    }

    pub fn marshal(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a document as returned by the provider (URL-encoded).
    pub fn from_url_encoded(encoded: &str) -> Result<Self> {
        let decoded: String = percent_encoding::percent_decode_str(encoded)
            .decode_utf8()
            .map_err(|e| crate::Error::InvalidErr(format!("policy document encoding: {e}")))?
            .into_owned();
        Ok(serde_json::from_str(&decoded)?)
    }
}

impl From<&CustomPolicy> for PolicyDocument {
    fn from(custom: &CustomPolicy) -> Self {
        let statement = custom
            .statements
            .iter()
            .map(|s| PolicyStatement {
                effect: s.effect.clone(),
                action: s.action.clone(),
                resource: if s.resource.is_empty() {
                    None
                } else {
                    Some(s.resource.clone())
                },
                principal: None,
                condition: s.condition.clone(),
            })
            .collect();
        PolicyDocument::new(statement)
    }
}

/// Trust policy allowing `principal_arns` to assume the carrying role.
pub fn assume_role_trust_policy(principal_arns: &[String]) -> PolicyDocument {
    PolicyDocument::new(vec![PolicyStatement {
        effect: "Allow".to_string(),
        action: vec!["sts:AssumeRole".to_string()],
        resource: None,
        principal: Some(PolicyPrincipal {
            aws: principal_arns.to_vec(),
        }),
        condition: None,
    }])
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::apis::federated_types::StatementEntry;

    #[test]
    fn marshal_then_remarshal_is_byte_stable() {
        let custom = CustomPolicy {
            name: "read-only-ec2".to_string(),
            description: "list instances".to_string(),
            statements: vec![StatementEntry {
                effect: "Allow".to_string(),
                action: vec!["ec2:DescribeInstances".to_string()],
                resource: vec!["*".to_string()],
                condition: None,
            }],
        };
        let doc = PolicyDocument::from(&custom);
        let first = doc.marshal().unwrap();
        let reparsed: PolicyDocument = serde_json::from_str(&first).unwrap();
        let second = reparsed.marshal().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn url_encoded_documents_round_trip() {
        let doc = assume_role_trust_policy(&["arn:aws:iam::123456789012:root".to_string()]);
        let marshalled = doc.marshal().unwrap();
        let encoded: String = percent_encoding::utf8_percent_encode(
            &marshalled,
            percent_encoding::NON_ALPHANUMERIC,
        )
        .to_string();
        let decoded = PolicyDocument::from_url_encoded(&encoded).unwrap();
        assert_eq!(decoded, doc);
        assert_eq!(decoded.marshal().unwrap(), marshalled);
    }

    #[test]
    fn trust_policy_carries_version_and_principal() {
        let doc = assume_role_trust_policy(&["arn:aws:iam::111122223333:role/ops".to_string()]);
        let json: serde_json::Value = serde_json::from_str(&doc.marshal().unwrap()).unwrap();
        assert_eq!(json["Version"], "2012-10-17");
        assert_eq!(
            json["Statement"][0]["Principal"]["AWS"][0],
            "arn:aws:iam::111122223333:role/ops"
        );
    }
}
