//! Fixtures shared by the unit tests.

use time::{macros::datetime, Duration, OffsetDateTime};

use crate::{
    assertion::{
        Assertion, AuthnStatement, Conditions, NameId, SamlAttribute, Subject,
        SubjectConfirmation, SubjectConfirmationData,
    },
    response::{SamlResponse, Status},
    signature::{sign_enveloped, SigningCredential, SigningKey},
    CONFIRMATION_METHOD_BEARER, NAME_ID_FORMAT_EMAIL_ADDRESS, NAME_ID_FORMAT_ENTITY,
};

pub const IDP_KEY_PEM: &str = include_str!("../static/idp_key.pem");
pub const IDP_CERT_PEM: &str = include_str!("../static/idp_cert.pem");
pub const OTHER_KEY_PEM: &str = include_str!("../static/other_key.pem");
pub const OTHER_CERT_PEM: &str = include_str!("../static/other_cert.pem");

pub const SP_ENTITY_ID: &str = "https://sp.example.com/Metadata";
pub const IDP_ENTITY_ID: &str = "https://idp.example.com";
pub const IDP_SSO_URL: &str = "https://idp.example.com/sso";
pub const ACS_URL: &str = "https://sp.example.com:8888/Saml2/Acs";
pub const NOW: OffsetDateTime = datetime!(2023-09-08 14:53:02 UTC);

pub fn idp_credential() -> SigningCredential {
    SigningCredential::from_pem(IDP_KEY_PEM).unwrap()
}

pub fn other_credential() -> SigningCredential {
    SigningCredential::from_pem(OTHER_KEY_PEM).unwrap()
}

pub fn idp_signing_key() -> SigningKey {
    SigningKey::from_certificate_pem(IDP_CERT_PEM).unwrap()
}

pub fn sample_assertion(id: &str, in_response_to: Option<&str>) -> Assertion {
    Assertion {
        id: id.to_string(),
        issue_instant: NOW,
        issuer: NameId::new(IDP_ENTITY_ID).with_format(NAME_ID_FORMAT_ENTITY),
        subject: Some(Subject {
            name_id: Some(
                NameId::new("user@example.com").with_format(NAME_ID_FORMAT_EMAIL_ADDRESS),
            ),
            confirmations: vec![SubjectConfirmation {
                method: CONFIRMATION_METHOD_BEARER.to_string(),
                data: Some(SubjectConfirmationData {
                    not_before: None,
                    not_on_or_after: Some(NOW + Duration::minutes(5)),
                    recipient: Some(ACS_URL.to_string()),
                    in_response_to: in_response_to.map(str::to_string),
                }),
            }],
        }),
        conditions: Some(Conditions {
            not_before: Some(NOW - Duration::minutes(1)),
            not_on_or_after: Some(NOW + Duration::minutes(5)),
            audience_restrictions: vec![vec![SP_ENTITY_ID.to_string()]],
            one_time_use: true,
        }),
        authn_statements: vec![AuthnStatement {
            authn_instant: NOW,
            session_index: Some("_session1".to_string()),
            session_not_on_or_after: None,
            authn_context_class_ref: Some(
                "urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport".to_string(),
            ),
        }],
        attributes: vec![SamlAttribute {
            name: "role".to_string(),
            name_format: None,
            friendly_name: Some("Role".to_string()),
            values: vec!["admin".to_string(), "user".to_string()],
        }],
        signature: None,
    }
}

pub fn sample_response(in_response_to: Option<&str>) -> SamlResponse {
    SamlResponse {
        id: "_response1".to_string(),
        issue_instant: NOW,
        issuer: Some(NameId::new(IDP_ENTITY_ID).with_format(NAME_ID_FORMAT_ENTITY)),
        destination: Some(ACS_URL.to_string()),
        in_response_to: in_response_to.map(str::to_string),
        status: Status::success(),
        assertions: vec![sample_assertion("_assertion1", in_response_to)],
        signature: None,
    }
}

/// Serializes `response`, signing its assertions and then the response
/// itself with the IdP key.
pub fn sign_response(
    response: &SamlResponse,
    sign_response: bool,
    sign_assertions: bool,
) -> String {
    let mut xml = response.to_xml().unwrap();
    if sign_assertions {
        for assertion in &response.assertions {
            xml = sign_enveloped(&xml, &assertion.id, &idp_credential()).unwrap();
        }
    }
    if sign_response {
        xml = sign_enveloped(&xml, &response.id, &idp_credential()).unwrap();
    }
    xml
}
