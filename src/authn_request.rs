use std::{fmt::Display, str::FromStr};

use time::OffsetDateTime;
use yaserde::YaSerialize;

use crate::{
    error::{SamlError, SamlResult},
    utils::{format_date_time, random_id, to_xml_string},
    NAME_ID_FORMAT_ENTITY,
};

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "samlp",
  rename = "AuthnRequest"
)]
struct AuthnRequestXml {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: Option<String>,
    #[yaserde(attribute = true, rename = "ProtocolBinding")]
    protocol_binding: Option<String>,
    #[yaserde(attribute = true, rename = "AssertionConsumerServiceURL")]
    assertion_consumer_service_url: Option<String>,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: IssuerXml,
    #[yaserde(rename = "Subject", prefix = "saml")]
    subject: Option<SubjectXml>,
    #[yaserde(rename = "NameIDPolicy", prefix = "samlp")]
    name_id_policy: Option<NameIdPolicyXml>,
}

#[derive(YaSerialize)]
struct IssuerXml {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct NameIdPolicyXml {
    #[yaserde(attribute = true, rename = "Format")]
    format: Option<String>,
    #[yaserde(attribute = true, rename = "AllowCreate")]
    allow_create: bool,
}

#[derive(YaSerialize)]
struct SubjectXml {
    #[yaserde(rename = "NameID", prefix = "saml")]
    name_id: NameIdXml,
}

#[derive(YaSerialize)]
struct NameIdXml {
    #[yaserde(attribute = true, rename = "Format")]
    format: Option<String>,
    #[yaserde(text = true)]
    content: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolBinding {
    Post,
    #[default]
    Redirect,
}

impl Display for ProtocolBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProtocolBinding::Post => write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"),
            ProtocolBinding::Redirect => {
                write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect")
            }
        }
    }
}

impl FromStr for ProtocolBinding {
    type Err = SamlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" => Ok(ProtocolBinding::Post),
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" => Ok(ProtocolBinding::Redirect),
            other => Err(SamlError::Binding(format!("unsupported binding {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameIdPolicy {
    pub format: Option<String>,
    pub allow_create: bool,
}

/// A `<samlp:AuthnRequest>`. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthnRequest {
    pub id: String,
    pub issue_instant: OffsetDateTime,
    pub issuer: String,
    pub destination: Option<String>,
    pub assertion_consumer_service_url: Option<String>,
    /// Binding the response should be delivered with.
    pub protocol_binding: Option<ProtocolBinding>,
    pub name_id_policy: Option<NameIdPolicy>,
    /// NameID of the user the IdP should authenticate, if already known.
    pub subject: Option<String>,
}

impl AuthnRequest {
    pub fn to_xml(&self) -> SamlResult<String> {
        let name_id_format = self
            .name_id_policy
            .as_ref()
            .and_then(|policy| policy.format.clone());
        let req = AuthnRequestXml {
            id: self.id.clone(),
            version: "2.0".to_string(),
            issue_instant: format_date_time(self.issue_instant)?,
            destination: self.destination.clone(),
            protocol_binding: self.protocol_binding.map(|binding| binding.to_string()),
            assertion_consumer_service_url: self.assertion_consumer_service_url.clone(),
            issuer: IssuerXml {
                format: NAME_ID_FORMAT_ENTITY.to_string(),
                content: self.issuer.clone(),
            },
            subject: self.subject.as_ref().map(|subject| SubjectXml {
                name_id: NameIdXml {
                    format: name_id_format,
                    content: subject.clone(),
                },
            }),
            name_id_policy: self.name_id_policy.as_ref().map(|policy| NameIdPolicyXml {
                format: policy.format.clone(),
                allow_create: policy.allow_create,
            }),
        };
        to_xml_string(&req)
    }
}

#[derive(Default)]
pub struct AuthnRequestBuilder {
    id: Option<String>,
    issue_instant: Option<OffsetDateTime>,
    issuer: Option<String>,
    destination: Option<String>,
    protocol_binding: Option<ProtocolBinding>,
    consumer_url: Option<String>,
    name_format: Option<String>,
    deny_create: bool,
    subject: Option<String>,
}

impl AuthnRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(self, id: &str) -> Self {
        AuthnRequestBuilder {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn auto_id(self) -> Self {
        AuthnRequestBuilder {
            id: Some(random_id()),
            ..self
        }
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        AuthnRequestBuilder {
            issue_instant: Some(instant),
            ..self
        }
    }

    pub fn issued_now(self) -> Self {
        AuthnRequestBuilder {
            issue_instant: Some(OffsetDateTime::now_utc()),
            ..self
        }
    }

    pub fn issuer(self, issuer: &str) -> Self {
        AuthnRequestBuilder {
            issuer: Some(issuer.into()),
            ..self
        }
    }

    pub fn destination(self, destination: &str) -> Self {
        AuthnRequestBuilder {
            destination: Some(destination.into()),
            ..self
        }
    }

    pub fn protocol_binding(self, binding: ProtocolBinding) -> Self {
        AuthnRequestBuilder {
            protocol_binding: Some(binding),
            ..self
        }
    }

    pub fn consumer_url(self, url: &str) -> Self {
        AuthnRequestBuilder {
            consumer_url: Some(url.into()),
            ..self
        }
    }

    pub fn name_format(self, format: &str) -> Self {
        AuthnRequestBuilder {
            name_format: Some(format.into()),
            ..self
        }
    }

    pub fn allow_create(self, allow: bool) -> Self {
        AuthnRequestBuilder {
            deny_create: !allow,
            ..self
        }
    }

    pub fn subject(self, subject: &str) -> Self {
        AuthnRequestBuilder {
            subject: Some(subject.into()),
            ..self
        }
    }

    pub fn build(self) -> SamlResult<AuthnRequest> {
        let required = |value: Option<String>, name: &str| {
            value.ok_or_else(|| SamlError::Configuration(format!("{name} is required")))
        };
        let name_id_policy = match (&self.name_format, self.deny_create) {
            (None, false) => None,
            (format, deny_create) => Some(NameIdPolicy {
                format: format.clone(),
                allow_create: !deny_create,
            }),
        };
        Ok(AuthnRequest {
            id: required(self.id, "ID")?,
            issue_instant: self
                .issue_instant
                .ok_or_else(|| SamlError::Configuration("IssueInstant is required".into()))?,
            issuer: required(self.issuer, "Issuer")?,
            destination: self.destination,
            assertion_consumer_service_url: self.consumer_url,
            protocol_binding: self.protocol_binding,
            name_id_policy,
            subject: self.subject,
        })
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use crate::{xml::XmlDocument, NAME_ID_FORMAT_EMAIL_ADDRESS, SAMLP_NAMESPACE, SAML_NAMESPACE};

    use super::*;

    fn sample() -> AuthnRequest {
        AuthnRequestBuilder::new()
            .id("_req1")
            .issue_instant(datetime!(2023-09-08 14:53:02 UTC))
            .issuer("https://sp.example.com/Metadata")
            .destination("https://idp.example.com/sso")
            .protocol_binding(ProtocolBinding::Post)
            .consumer_url("https://sp.example.com:8888/Saml2/Acs")
            .name_format(NAME_ID_FORMAT_EMAIL_ADDRESS)
            .subject("user@example.com")
            .build()
            .unwrap()
    }

    #[test]
    fn can_build_authn_request() {
        let xml = sample().to_xml().unwrap();
        let document = XmlDocument::parse(&xml).unwrap();
        let root = document.root();
        assert!(root.is(SAMLP_NAMESPACE, "AuthnRequest"));
        assert_eq!(root.prefix(), Some("samlp"));
        assert_eq!(root.attribute("ID"), Some("_req1"));
        assert_eq!(root.attribute("IssueInstant"), Some("2023-09-08T14:53:02Z"));
        assert_eq!(
            root.attribute("ProtocolBinding"),
            Some("urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST")
        );

        let issuer = root.child_elements().next().unwrap();
        assert!(issuer.is(SAML_NAMESPACE, "Issuer"));
        assert_eq!(issuer.text(), "https://sp.example.com/Metadata");
    }

    #[test]
    fn writer_is_deterministic() {
        assert_eq!(sample().to_xml().unwrap(), sample().to_xml().unwrap());
    }

    #[test]
    fn missing_fields_are_configuration_errors() {
        let err = AuthnRequestBuilder::new()
            .auto_id()
            .issued_now()
            .build()
            .unwrap_err();
        assert!(matches!(err, SamlError::Configuration(ref m) if m.contains("Issuer")));
    }

    #[test]
    fn binding_uris() {
        for binding in [ProtocolBinding::Post, ProtocolBinding::Redirect] {
            assert_eq!(binding.to_string().parse::<ProtocolBinding>().unwrap(), binding);
        }
        assert!("urn:oasis:names:tc:SAML:2.0:bindings:SOAP"
            .parse::<ProtocolBinding>()
            .is_err());
    }
}
