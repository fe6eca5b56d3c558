//! The `<saml:Assertion>` data model.

use time::OffsetDateTime;
use yaserde::YaSerialize;

use crate::{
    error::SamlResult,
    signature::VerifiedSignature,
    utils::{format_date_time, to_xml_string},
};

/// A `NameID` or `Issuer` value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NameId {
    pub value: String,
    pub format: Option<String>,
    pub name_qualifier: Option<String>,
    pub sp_name_qualifier: Option<String>,
}

impl NameId {
    pub fn new(value: impl Into<String>) -> Self {
        NameId {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_format(self, format: &str) -> Self {
        NameId {
            format: Some(format.into()),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubjectConfirmationData {
    pub not_before: Option<OffsetDateTime>,
    pub not_on_or_after: Option<OffsetDateTime>,
    pub recipient: Option<String>,
    pub in_response_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectConfirmation {
    pub method: String,
    pub data: Option<SubjectConfirmationData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subject {
    pub name_id: Option<NameId>,
    pub confirmations: Vec<SubjectConfirmation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Conditions {
    pub not_before: Option<OffsetDateTime>,
    pub not_on_or_after: Option<OffsetDateTime>,
    /// One entry per `<AudienceRestriction>`, each holding its audiences.
    pub audience_restrictions: Vec<Vec<String>>,
    pub one_time_use: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthnStatement {
    pub authn_instant: OffsetDateTime,
    pub session_index: Option<String>,
    pub session_not_on_or_after: Option<OffsetDateTime>,
    pub authn_context_class_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SamlAttribute {
    pub name: String,
    pub name_format: Option<String>,
    pub friendly_name: Option<String>,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    pub id: String,
    pub issue_instant: OffsetDateTime,
    pub issuer: NameId,
    pub subject: Option<Subject>,
    pub conditions: Option<Conditions>,
    pub authn_statements: Vec<AuthnStatement>,
    pub attributes: Vec<SamlAttribute>,
    /// Set by the reader when the assertion carried a signature that verified.
    pub signature: Option<VerifiedSignature>,
}

impl Assertion {
    pub fn subject_name_id(&self) -> Option<&NameId> {
        self.subject.as_ref()?.name_id.as_ref()
    }

    /// Values of every attribute called `name`, in document order.
    pub fn attribute_values(&self, name: &str) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|attribute| attribute.name == name)
            .flat_map(|attribute| attribute.values.iter().map(String::as_str))
            .collect()
    }

    pub fn to_xml(&self) -> SamlResult<String> {
        to_xml_string(&AssertionXml::try_from(self)?)
    }
}

#[derive(YaSerialize)]
pub(crate) struct NameIdXml {
    #[yaserde(attribute = true, rename = "Format")]
    format: Option<String>,
    #[yaserde(attribute = true, rename = "NameQualifier")]
    name_qualifier: Option<String>,
    #[yaserde(attribute = true, rename = "SPNameQualifier")]
    sp_name_qualifier: Option<String>,
    #[yaserde(text = true)]
    content: String,
}

impl From<&NameId> for NameIdXml {
    fn from(name_id: &NameId) -> Self {
        NameIdXml {
            format: name_id.format.clone(),
            name_qualifier: name_id.name_qualifier.clone(),
            sp_name_qualifier: name_id.sp_name_qualifier.clone(),
            content: name_id.value.clone(),
        }
    }
}

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "saml",
  rename = "Assertion"
)]
pub(crate) struct AssertionXml {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: NameIdXml,
    #[yaserde(rename = "Subject", prefix = "saml")]
    subject: Option<SubjectXml>,
    #[yaserde(rename = "Conditions", prefix = "saml")]
    conditions: Option<ConditionsXml>,
    #[yaserde(rename = "AuthnStatement", prefix = "saml")]
    authn_statements: Vec<AuthnStatementXml>,
    #[yaserde(rename = "AttributeStatement", prefix = "saml")]
    attribute_statement: Option<AttributeStatementXml>,
}

#[derive(YaSerialize)]
struct SubjectXml {
    #[yaserde(rename = "NameID", prefix = "saml")]
    name_id: Option<NameIdXml>,
    #[yaserde(rename = "SubjectConfirmation", prefix = "saml")]
    confirmations: Vec<SubjectConfirmationXml>,
}

#[derive(YaSerialize)]
struct SubjectConfirmationXml {
    #[yaserde(attribute = true, rename = "Method")]
    method: String,
    #[yaserde(rename = "SubjectConfirmationData", prefix = "saml")]
    data: Option<SubjectConfirmationDataXml>,
}

#[derive(YaSerialize)]
struct SubjectConfirmationDataXml {
    #[yaserde(attribute = true, rename = "NotBefore")]
    not_before: Option<String>,
    #[yaserde(attribute = true, rename = "NotOnOrAfter")]
    not_on_or_after: Option<String>,
    #[yaserde(attribute = true, rename = "Recipient")]
    recipient: Option<String>,
    #[yaserde(attribute = true, rename = "InResponseTo")]
    in_response_to: Option<String>,
}

#[derive(YaSerialize)]
struct ConditionsXml {
    #[yaserde(attribute = true, rename = "NotBefore")]
    not_before: Option<String>,
    #[yaserde(attribute = true, rename = "NotOnOrAfter")]
    not_on_or_after: Option<String>,
    #[yaserde(rename = "AudienceRestriction", prefix = "saml")]
    audience_restrictions: Vec<AudienceRestrictionXml>,
    #[yaserde(rename = "OneTimeUse", prefix = "saml")]
    one_time_use: Option<EmptyXml>,
}

#[derive(YaSerialize)]
struct AudienceRestrictionXml {
    #[yaserde(rename = "Audience", prefix = "saml")]
    audiences: Vec<TextXml>,
}

#[derive(YaSerialize)]
struct TextXml {
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct EmptyXml {}

#[derive(YaSerialize)]
struct AuthnStatementXml {
    #[yaserde(attribute = true, rename = "AuthnInstant")]
    authn_instant: String,
    #[yaserde(attribute = true, rename = "SessionIndex")]
    session_index: Option<String>,
    #[yaserde(attribute = true, rename = "SessionNotOnOrAfter")]
    session_not_on_or_after: Option<String>,
    #[yaserde(rename = "AuthnContext", prefix = "saml")]
    authn_context: AuthnContextXml,
}

#[derive(YaSerialize)]
struct AuthnContextXml {
    #[yaserde(rename = "AuthnContextClassRef", prefix = "saml")]
    class_ref: Option<TextXml>,
}

#[derive(YaSerialize)]
struct AttributeStatementXml {
    #[yaserde(rename = "Attribute", prefix = "saml")]
    attributes: Vec<AttributeXml>,
}

#[derive(YaSerialize)]
struct AttributeXml {
    #[yaserde(attribute = true, rename = "Name")]
    name: String,
    #[yaserde(attribute = true, rename = "NameFormat")]
    name_format: Option<String>,
    #[yaserde(attribute = true, rename = "FriendlyName")]
    friendly_name: Option<String>,
    #[yaserde(rename = "AttributeValue", prefix = "saml")]
    values: Vec<TextXml>,
}

fn optional_date_time(instant: Option<OffsetDateTime>) -> SamlResult<Option<String>> {
    instant.map(format_date_time).transpose()
}

fn text(content: &str) -> TextXml {
    TextXml {
        content: content.to_string(),
    }
}

impl TryFrom<&Assertion> for AssertionXml {
    type Error = crate::error::SamlError;

    fn try_from(assertion: &Assertion) -> SamlResult<Self> {
        let subject = assertion.subject.as_ref().map(|subject| -> SamlResult<_> {
            Ok(SubjectXml {
                name_id: subject.name_id.as_ref().map(NameIdXml::from),
                confirmations: subject
                    .confirmations
                    .iter()
                    .map(|confirmation| -> SamlResult<_> {
                        Ok(SubjectConfirmationXml {
                            method: confirmation.method.clone(),
                            data: match &confirmation.data {
                                Some(data) => Some(SubjectConfirmationDataXml {
                                    not_before: optional_date_time(data.not_before)?,
                                    not_on_or_after: optional_date_time(data.not_on_or_after)?,
                                    recipient: data.recipient.clone(),
                                    in_response_to: data.in_response_to.clone(),
                                }),
                                None => None,
                            },
                        })
                    })
                    .collect::<SamlResult<_>>()?,
            })
        });

        let conditions = assertion.conditions.as_ref().map(|conditions| -> SamlResult<_> {
            Ok(ConditionsXml {
                not_before: optional_date_time(conditions.not_before)?,
                not_on_or_after: optional_date_time(conditions.not_on_or_after)?,
                audience_restrictions: conditions
                    .audience_restrictions
                    .iter()
                    .map(|audiences| AudienceRestrictionXml {
                        audiences: audiences.iter().map(|a| text(a)).collect(),
                    })
                    .collect(),
                one_time_use: conditions.one_time_use.then_some(EmptyXml {}),
            })
        });

        let authn_statements = assertion
            .authn_statements
            .iter()
            .map(|statement| -> SamlResult<_> {
                Ok(AuthnStatementXml {
                    authn_instant: format_date_time(statement.authn_instant)?,
                    session_index: statement.session_index.clone(),
                    session_not_on_or_after: optional_date_time(statement.session_not_on_or_after)?,
                    authn_context: AuthnContextXml {
                        class_ref: statement.authn_context_class_ref.as_deref().map(text),
                    },
                })
            })
            .collect::<SamlResult<_>>()?;

        let attribute_statement = (!assertion.attributes.is_empty()).then(|| AttributeStatementXml {
            attributes: assertion
                .attributes
                .iter()
                .map(|attribute| AttributeXml {
                    name: attribute.name.clone(),
                    name_format: attribute.name_format.clone(),
                    friendly_name: attribute.friendly_name.clone(),
                    values: attribute.values.iter().map(|v| text(v)).collect(),
                })
                .collect(),
        });

        Ok(AssertionXml {
            id: assertion.id.clone(),
            version: "2.0".to_string(),
            issue_instant: format_date_time(assertion.issue_instant)?,
            issuer: NameIdXml::from(&assertion.issuer),
            subject: subject.transpose()?,
            conditions: conditions.transpose()?,
            authn_statements,
            attribute_statement,
        })
    }
}
