use yaserde::YaSerialize;

use crate::{
    authn_request::ProtocolBinding,
    error::{SamlError, SamlResult},
    utils::to_xml_string,
};

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "md" = "urn:oasis:names:tc:SAML:2.0:metadata",
    "ds" = "http://www.w3.org/2000/09/xmldsig#",
  },
  prefix = "md"
)]
struct EntityDescriptor {
    #[yaserde(attribute = true, rename = "entityID")]
    entity_id: String,
    #[yaserde(rename = "SPSSODescriptor", prefix = "md")]
    sp_sso_descriptor: SPSSODescriptor,
}

#[derive(YaSerialize)]
struct SPSSODescriptor {
    #[yaserde(attribute = true, rename = "AuthnRequestsSigned")]
    authn_requests_signed: bool,
    #[yaserde(attribute = true, rename = "WantAssertionsSigned")]
    want_assertions_signed: bool,
    #[yaserde(attribute = true, rename = "protocolSupportEnumeration")]
    protocol_support_enumeration: String,
    #[yaserde(rename = "KeyDescriptor", prefix = "md")]
    key_descriptor: Option<KeyDescriptor>,
    #[yaserde(rename = "NameIDFormat", prefix = "md")]
    name_id_format: Option<NameIdFormat>,
    #[yaserde(rename = "AssertionConsumerService", prefix = "md")]
    assertion_consumer_service: AssertionConsumerService,
}

#[derive(YaSerialize)]
struct KeyDescriptor {
    #[yaserde(attribute = true, rename = "use")]
    key_use: String,
    #[yaserde(rename = "KeyInfo", prefix = "ds")]
    key_info: KeyInfo,
}

#[derive(YaSerialize)]
struct KeyInfo {
    #[yaserde(rename = "X509Data", prefix = "ds")]
    x509_data: X509Data,
}

#[derive(YaSerialize)]
struct X509Data {
    #[yaserde(rename = "X509Certificate", prefix = "ds")]
    certificate: String,
}

#[derive(YaSerialize)]
struct NameIdFormat {
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct AssertionConsumerService {
    #[yaserde(attribute = true, rename = "Binding")]
    binding: String,
    #[yaserde(attribute = true, rename = "Location")]
    location: String,
    #[yaserde(attribute = true)]
    index: u32,
}

#[derive(Default)]
pub struct SpMetadataBuilder {
    entity_id: Option<String>,
    acs_url: Option<String>,
    name_id_format: Option<String>,
    authn_requests_signed: bool,
    want_assertions_signed: bool,
    signing_certificate: Option<String>,
}

impl SpMetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_id(self, entity_id: &str) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..self
        }
    }

    pub fn acs_url(self, acs_url: &str) -> Self {
        Self {
            acs_url: Some(acs_url.into()),
            ..self
        }
    }

    pub fn name_id_format(self, name_id_format: &str) -> Self {
        Self {
            name_id_format: Some(name_id_format.into()),
            ..self
        }
    }

    pub fn authn_requests_signed(self, signed: bool) -> Self {
        Self {
            authn_requests_signed: signed,
            ..self
        }
    }

    pub fn want_assertions_signed(self, want: bool) -> Self {
        Self {
            want_assertions_signed: want,
            ..self
        }
    }

    /// Base64 DER of the certificate the SP signs requests with.
    pub fn signing_certificate(self, certificate: &str) -> Self {
        Self {
            signing_certificate: Some(certificate.into()),
            ..self
        }
    }

    pub fn build(self) -> SamlResult<String> {
        let required = |value: Option<String>, name: &str| {
            value.ok_or_else(|| SamlError::Configuration(format!("{name} is required")))
        };
        let metadata = EntityDescriptor {
            entity_id: required(self.entity_id, "entity_id")?,
            sp_sso_descriptor: SPSSODescriptor {
                authn_requests_signed: self.authn_requests_signed,
                want_assertions_signed: self.want_assertions_signed,
                protocol_support_enumeration: crate::SAMLP_NAMESPACE.into(),
                key_descriptor: self.signing_certificate.map(|certificate| KeyDescriptor {
                    key_use: "signing".into(),
                    key_info: KeyInfo {
                        x509_data: X509Data { certificate },
                    },
                }),
                name_id_format: self
                    .name_id_format
                    .map(|content| NameIdFormat { content }),
                assertion_consumer_service: AssertionConsumerService {
                    binding: ProtocolBinding::Post.to_string(),
                    location: required(self.acs_url, "acs_url")?,
                    index: 0,
                },
            },
        };
        to_xml_string(&metadata)
    }
}
