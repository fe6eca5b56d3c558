use time::OffsetDateTime;
use yaserde::YaSerialize;

use crate::{
    assertion::{Assertion, AssertionXml, NameId, NameIdXml},
    error::SamlResult,
    signature::VerifiedSignature,
    utils::{format_date_time, to_xml_string},
    STATUS_SUCCESS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: String,
    /// Nested second-level status code, e.g. `...:status:AuthnFailed`.
    pub second_level_code: Option<String>,
    pub message: Option<String>,
}

impl Status {
    pub fn success() -> Self {
        Status {
            code: STATUS_SUCCESS.to_string(),
            second_level_code: None,
            message: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == STATUS_SUCCESS
    }
}

/// A `<samlp:Response>` as read from the wire. Never mutated after reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamlResponse {
    pub id: String,
    pub issue_instant: OffsetDateTime,
    pub issuer: Option<NameId>,
    pub destination: Option<String>,
    pub in_response_to: Option<String>,
    pub status: Status,
    pub assertions: Vec<Assertion>,
    /// Set by the reader when the response carried a signature that verified.
    pub signature: Option<VerifiedSignature>,
}

impl SamlResponse {
    /// NameID of the first assertion's subject.
    pub fn subject(&self) -> Option<&NameId> {
        self.assertions.iter().find_map(Assertion::subject_name_id)
    }

    pub fn to_xml(&self) -> SamlResult<String> {
        let status_code = StatusCodeXml {
            value: self.status.code.clone(),
            nested: self
                .status
                .second_level_code
                .as_ref()
                .map(|code| NestedStatusCodeXml { value: code.clone() }),
        };
        let response = ResponseXml {
            id: self.id.clone(),
            version: "2.0".to_string(),
            issue_instant: format_date_time(self.issue_instant)?,
            destination: self.destination.clone(),
            in_response_to: self.in_response_to.clone(),
            issuer: self.issuer.as_ref().map(NameIdXml::from),
            status: StatusXml {
                status_code,
                status_message: self.status.message.clone(),
            },
            assertions: self
                .assertions
                .iter()
                .map(AssertionXml::try_from)
                .collect::<SamlResult<_>>()?,
        };
        to_xml_string(&response)
    }
}

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "samlp",
  rename = "Response"
)]
struct ResponseXml {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: Option<String>,
    #[yaserde(attribute = true, rename = "InResponseTo")]
    in_response_to: Option<String>,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Option<NameIdXml>,
    #[yaserde(rename = "Status", prefix = "samlp")]
    status: StatusXml,
    #[yaserde(rename = "Assertion", prefix = "saml")]
    assertions: Vec<AssertionXml>,
}

#[derive(YaSerialize)]
struct StatusXml {
    #[yaserde(rename = "StatusCode", prefix = "samlp")]
    status_code: StatusCodeXml,
    #[yaserde(rename = "StatusMessage", prefix = "samlp")]
    status_message: Option<String>,
}

#[derive(YaSerialize)]
struct StatusCodeXml {
    #[yaserde(attribute = true, rename = "Value")]
    value: String,
    #[yaserde(rename = "StatusCode", prefix = "samlp")]
    nested: Option<NestedStatusCodeXml>,
}

#[derive(YaSerialize)]
struct NestedStatusCodeXml {
    #[yaserde(attribute = true, rename = "Value")]
    value: String,
}
