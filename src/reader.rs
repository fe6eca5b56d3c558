//! Reads SAML protocol messages into the typed model.
//!
//! Signatures are verified as soon as a signed element is reached and fail
//! the read immediately. Structural problems are collected for the whole
//! message and reported together once reading has finished.

use time::OffsetDateTime;
use tracing::debug;

use crate::{
    assertion::{
        Assertion, AuthnStatement, Conditions, NameId, SamlAttribute, Subject,
        SubjectConfirmation, SubjectConfirmationData,
    },
    authn_request::{AuthnRequest, NameIdPolicy, ProtocolBinding},
    error::SamlResult,
    response::{SamlResponse, Status},
    signature::{DigestAlgorithm, SignatureVerifier, SigningKey},
    traverser::XmlTraverser,
    xml::XmlDocument,
    DSIG_NAMESPACE, SAMLP_NAMESPACE, SAML_NAMESPACE,
};

#[derive(Debug, Clone)]
pub struct SamlXmlReader {
    pub allowed_hash_algorithms: Vec<DigestAlgorithm>,
    pub trusted_signing_keys: Vec<SigningKey>,
}

impl Default for SamlXmlReader {
    fn default() -> Self {
        SamlXmlReader {
            allowed_hash_algorithms: DigestAlgorithm::DEFAULT_ALLOWED.to_vec(),
            trusted_signing_keys: Vec::new(),
        }
    }
}

fn check_version(source: &XmlTraverser<'_>) {
    if let Some(version) = source.required_attribute("Version") {
        if version != "2.0" {
            source.error(format!("unsupported SAML version {version}"));
        }
    }
}

fn required_string(source: &XmlTraverser<'_>, name: &str) -> String {
    source.required_attribute(name).unwrap_or_default().to_string()
}

fn optional_string(source: &XmlTraverser<'_>, name: &str) -> Option<String> {
    source.optional_attribute(name).map(str::to_string)
}

fn read_name_id(source: &XmlTraverser<'_>) -> NameId {
    NameId {
        value: source.text(),
        format: source.optional_uri("Format").map(str::to_string),
        name_qualifier: optional_string(source, "NameQualifier"),
        sp_name_qualifier: optional_string(source, "SPNameQualifier"),
    }
}

fn read_status(source: &XmlTraverser<'_>) -> Status {
    let mut children = source.children();
    let mut status = Status {
        code: String::new(),
        second_level_code: None,
        message: None,
    };
    if let Some(code) = children.required(SAMLP_NAMESPACE, "StatusCode") {
        status.code = required_string(&code, "Value");
        let mut nested = code.children();
        status.second_level_code = nested
            .optional(SAMLP_NAMESPACE, "StatusCode")
            .map(|second| required_string(&second, "Value"));
        nested.finish();
    }
    status.message = children
        .optional(SAMLP_NAMESPACE, "StatusMessage")
        .map(|message| message.text());
    children.optional(SAMLP_NAMESPACE, "StatusDetail");
    children.finish();
    status
}

fn read_subject(source: &XmlTraverser<'_>) -> Subject {
    let mut children = source.children();
    let name_id = children
        .optional(SAML_NAMESPACE, "NameID")
        .map(|name_id| read_name_id(&name_id));
    for unsupported in ["BaseID", "EncryptedID"] {
        if let Some(child) = children.optional(SAML_NAMESPACE, unsupported) {
            child.error(format!("{unsupported} subjects are not supported"));
        }
    }
    let confirmations = children
        .zero_or_more(SAML_NAMESPACE, "SubjectConfirmation")
        .iter()
        .map(read_subject_confirmation)
        .collect();
    children.finish();
    Subject {
        name_id,
        confirmations,
    }
}

fn read_subject_confirmation(source: &XmlTraverser<'_>) -> SubjectConfirmation {
    let method = required_string(source, "Method");
    let mut children = source.children();
    for identifier in ["BaseID", "NameID", "EncryptedID"] {
        children.optional(SAML_NAMESPACE, identifier);
    }
    // SubjectConfirmationData may carry arbitrary content such as KeyInfo.
    let data = children
        .optional(SAML_NAMESPACE, "SubjectConfirmationData")
        .map(|data| SubjectConfirmationData {
            not_before: data.optional_date_time("NotBefore"),
            not_on_or_after: data.optional_date_time("NotOnOrAfter"),
            recipient: data.optional_uri("Recipient").map(str::to_string),
            in_response_to: optional_string(&data, "InResponseTo"),
        });
    children.finish();
    SubjectConfirmation { method, data }
}

fn read_conditions(source: &XmlTraverser<'_>) -> Conditions {
    let mut conditions = Conditions {
        not_before: source.optional_date_time("NotBefore"),
        not_on_or_after: source.optional_date_time("NotOnOrAfter"),
        ..Default::default()
    };
    let mut children = source.children();
    while let Some(child) = children.next_any() {
        let element = child.element();
        if element.is(SAML_NAMESPACE, "AudienceRestriction") {
            let audiences = child
                .children()
                .one_or_more(SAML_NAMESPACE, "Audience")
                .iter()
                .map(XmlTraverser::text)
                .collect();
            conditions.audience_restrictions.push(audiences);
        } else if element.is(SAML_NAMESPACE, "OneTimeUse") {
            conditions.one_time_use = true;
        } else if element.is(SAML_NAMESPACE, "ProxyRestriction") {
            child.warning("ProxyRestriction is not enforced");
        } else {
            child.error(format!("unknown condition {}", element.local_name()));
        }
    }
    conditions
}

fn read_authn_statement(source: &XmlTraverser<'_>) -> AuthnStatement {
    let mut statement = AuthnStatement {
        authn_instant: source
            .required_date_time("AuthnInstant")
            .unwrap_or(OffsetDateTime::UNIX_EPOCH),
        session_index: optional_string(source, "SessionIndex"),
        session_not_on_or_after: source.optional_date_time("SessionNotOnOrAfter"),
        authn_context_class_ref: None,
    };
    let mut children = source.children();
    children.optional(SAML_NAMESPACE, "SubjectLocality");
    if let Some(context) = children.required(SAML_NAMESPACE, "AuthnContext") {
        statement.authn_context_class_ref = context
            .children()
            .optional(SAML_NAMESPACE, "AuthnContextClassRef")
            .map(|class_ref| class_ref.text());
    }
    children.finish();
    statement
}

fn read_attribute(source: &XmlTraverser<'_>) -> SamlAttribute {
    let mut children = source.children();
    let values = children
        .zero_or_more(SAML_NAMESPACE, "AttributeValue")
        .iter()
        .map(|value| {
            if value.element().child_elements().next().is_some() {
                value.warning("complex attribute value reduced to its text");
            }
            value.element().text()
        })
        .collect();
    children.finish();
    SamlAttribute {
        name: required_string(source, "Name"),
        name_format: optional_string(source, "NameFormat"),
        friendly_name: optional_string(source, "FriendlyName"),
        values,
    }
}

fn read_attribute_statement(source: &XmlTraverser<'_>, attributes: &mut Vec<SamlAttribute>) {
    let mut children = source.children();
    loop {
        if let Some(attribute) = children.optional(SAML_NAMESPACE, "Attribute") {
            attributes.push(read_attribute(&attribute));
        } else if let Some(encrypted) = children.optional(SAML_NAMESPACE, "EncryptedAttribute") {
            encrypted.warning("encrypted attribute skipped");
        } else {
            break;
        }
    }
    children.finish();
}

impl SamlXmlReader {
    pub fn new(trusted_signing_keys: Vec<SigningKey>) -> Self {
        SamlXmlReader {
            trusted_signing_keys,
            ..Default::default()
        }
    }

    pub fn allowed_hash_algorithms(self, algorithms: &[DigestAlgorithm]) -> Self {
        SamlXmlReader {
            allowed_hash_algorithms: algorithms.to_vec(),
            ..self
        }
    }

    fn verifier(&self) -> SignatureVerifier<'_> {
        SignatureVerifier::new(&self.trusted_signing_keys, &self.allowed_hash_algorithms)
    }

    pub fn read_saml_response(&self, xml: &str) -> SamlResult<SamlResponse> {
        let document = XmlDocument::parse(xml)?;
        let source = XmlTraverser::new(document.root());
        let response = self.read_response(&source)?;
        source.throw_on_errors()?;
        debug!(
            id = %response.id,
            assertions = response.assertions.len(),
            signed = response.signature.is_some(),
            "read SAML response"
        );
        Ok(response)
    }

    pub fn read_assertion(&self, xml: &str) -> SamlResult<Assertion> {
        let document = XmlDocument::parse(xml)?;
        let source = XmlTraverser::new(document.root());
        let assertion = self.read_assertion_element(&source)?;
        source.throw_on_errors()?;
        Ok(assertion)
    }

    pub fn read_authn_request(&self, xml: &str) -> SamlResult<AuthnRequest> {
        let document = XmlDocument::parse(xml)?;
        let source = XmlTraverser::new(document.root());
        if !source.ensure_name(SAMLP_NAMESPACE, "AuthnRequest") {
            source.throw_on_errors()?;
        }
        self.verifier().verify_enveloped(source.element())?;
        check_version(&source);

        let protocol_binding = source
            .optional_attribute("ProtocolBinding")
            .and_then(|binding| match binding.parse::<ProtocolBinding>() {
                Ok(binding) => Some(binding),
                Err(e) => {
                    source.error(e.to_string());
                    None
                }
            });
        let mut request = AuthnRequest {
            id: required_string(&source, "ID"),
            issue_instant: source
                .required_date_time("IssueInstant")
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            issuer: String::new(),
            destination: source.optional_uri("Destination").map(str::to_string),
            assertion_consumer_service_url: source
                .optional_uri("AssertionConsumerServiceURL")
                .map(str::to_string),
            protocol_binding,
            name_id_policy: None,
            subject: None,
        };

        let mut children = source.children();
        if let Some(issuer) = children.required(SAML_NAMESPACE, "Issuer") {
            request.issuer = issuer.text();
        }
        children.optional(DSIG_NAMESPACE, "Signature");
        children.optional(SAMLP_NAMESPACE, "Extensions");
        if let Some(subject) = children.optional(SAML_NAMESPACE, "Subject") {
            request.subject = read_subject(&subject).name_id.map(|name_id| name_id.value);
        }
        request.name_id_policy = children
            .optional(SAMLP_NAMESPACE, "NameIDPolicy")
            .map(|policy| NameIdPolicy {
                format: policy.optional_uri("Format").map(str::to_string),
                allow_create: policy.optional_bool("AllowCreate").unwrap_or(false),
            });
        if let Some(conditions) = children.optional(SAML_NAMESPACE, "Conditions") {
            conditions.warning("Conditions is not interpreted");
        }
        for ignored in ["RequestedAuthnContext", "Scoping"] {
            if let Some(child) = children.optional(SAMLP_NAMESPACE, ignored) {
                child.warning(format!("{ignored} is not interpreted"));
            }
        }
        children.finish();

        source.throw_on_errors()?;
        Ok(request)
    }

    fn read_response(&self, source: &XmlTraverser<'_>) -> SamlResult<SamlResponse> {
        if !source.ensure_name(SAMLP_NAMESPACE, "Response") {
            source.throw_on_errors()?;
        }
        let signature = self.verifier().verify_enveloped(source.element())?;
        check_version(source);

        let mut response = SamlResponse {
            id: required_string(source, "ID"),
            issue_instant: source
                .required_date_time("IssueInstant")
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            issuer: None,
            destination: source.optional_uri("Destination").map(str::to_string),
            in_response_to: optional_string(source, "InResponseTo"),
            status: Status::success(),
            assertions: Vec::new(),
            signature,
        };

        let mut children = source.children();
        response.issuer = children
            .optional(SAML_NAMESPACE, "Issuer")
            .map(|issuer| read_name_id(&issuer));
        children.optional(DSIG_NAMESPACE, "Signature");
        children.optional(SAMLP_NAMESPACE, "Extensions");
        if let Some(status) = children.required(SAMLP_NAMESPACE, "Status") {
            response.status = read_status(&status);
        }
        loop {
            if let Some(assertion) = children.optional(SAML_NAMESPACE, "Assertion") {
                response
                    .assertions
                    .push(self.read_assertion_element(&assertion)?);
            } else if let Some(encrypted) =
                children.optional(SAML_NAMESPACE, "EncryptedAssertion")
            {
                encrypted.error("encrypted assertions are not supported");
            } else {
                break;
            }
        }
        children.finish();
        Ok(response)
    }

    fn read_assertion_element(&self, source: &XmlTraverser<'_>) -> SamlResult<Assertion> {
        if !source.ensure_name(SAML_NAMESPACE, "Assertion") {
            source.throw_on_errors()?;
        }
        let signature = self.verifier().verify_enveloped(source.element())?;
        check_version(source);

        let mut assertion = Assertion {
            id: required_string(source, "ID"),
            issue_instant: source
                .required_date_time("IssueInstant")
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            issuer: NameId::default(),
            subject: None,
            conditions: None,
            authn_statements: Vec::new(),
            attributes: Vec::new(),
            signature,
        };

        let mut children = source.children();
        if let Some(issuer) = children.required(SAML_NAMESPACE, "Issuer") {
            assertion.issuer = read_name_id(&issuer);
        }
        children.optional(DSIG_NAMESPACE, "Signature");
        assertion.subject = children
            .optional(SAML_NAMESPACE, "Subject")
            .map(|subject| read_subject(&subject));
        assertion.conditions = children
            .optional(SAML_NAMESPACE, "Conditions")
            .map(|conditions| read_conditions(&conditions));
        if let Some(advice) = children.optional(SAML_NAMESPACE, "Advice") {
            advice.warning("Advice is ignored");
        }
        loop {
            if let Some(statement) = children.optional(SAML_NAMESPACE, "AuthnStatement") {
                assertion
                    .authn_statements
                    .push(read_authn_statement(&statement));
            } else if let Some(statement) =
                children.optional(SAML_NAMESPACE, "AttributeStatement")
            {
                read_attribute_statement(&statement, &mut assertion.attributes);
            } else if let Some(statement) =
                children.optional(SAML_NAMESPACE, "AuthzDecisionStatement")
            {
                statement.warning("AuthzDecisionStatement is ignored");
            } else {
                break;
            }
        }
        children.finish();
        Ok(assertion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        authn_request::AuthnRequestBuilder,
        error::SamlError,
        test_support::{idp_credential, idp_signing_key, sample_response, sign_response},
        NAME_ID_FORMAT_EMAIL_ADDRESS,
    };

    #[test]
    fn reads_a_written_response() {
        let response = sample_response(Some("_req1"));
        let read = SamlXmlReader::default()
            .read_saml_response(&response.to_xml().unwrap())
            .unwrap();
        assert_eq!(read, response);
    }

    #[test]
    fn reads_signed_response_and_assertion() {
        let xml = sign_response(&sample_response(Some("_req1")), true, true);
        let reader = SamlXmlReader::new(vec![idp_signing_key()]);
        let response = reader.read_saml_response(&xml).unwrap();
        assert_eq!(response.signature.unwrap().reference_id, response.id);
        let assertion = &response.assertions[0];
        assert_eq!(assertion.signature.as_ref().unwrap().reference_id, assertion.id);
    }

    #[test]
    fn reports_all_structural_problems_together() {
        let xml = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" Version="2.0"><saml:Assertion ID="_a" Version="2.0" IssueInstant="2023-09-08T14:53:02Z"><saml:Issuer>https://idp.example.com</saml:Issuer></saml:Assertion></samlp:Response>"#;
        match SamlXmlReader::default().read_saml_response(xml) {
            Err(SamlError::Structural(errors)) => {
                assert!(errors.iter().any(|e| e.message.contains("ID")));
                assert!(errors.iter().any(|e| e.message.contains("IssueInstant")));
                assert!(errors
                    .iter()
                    .any(|e| e.message.contains("expected element Status")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn signature_errors_fail_before_structure() {
        let xml = sign_response(&sample_response(None), false, true)
            .replace("user@example.com", "admin@example.com");
        let err = SamlXmlReader::new(vec![idp_signing_key()])
            .read_saml_response(&xml)
            .unwrap_err();
        assert!(matches!(err, SamlError::Signature(_)), "{err}");
    }

    #[test]
    fn rejects_encrypted_assertions_and_unknown_conditions() {
        let xml = sample_response(None)
            .to_xml()
            .unwrap()
            .replace(
                "</samlp:Response>",
                "<saml:EncryptedAssertion/></samlp:Response>",
            )
            .replace("<saml:OneTimeUse", "<saml:Whatever/><saml:OneTimeUse");
        let err = SamlXmlReader::default().read_saml_response(&xml).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("encrypted assertions"), "{message}");
    }

    #[test]
    fn wrong_root_element() {
        let xml = r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"/>"#;
        let err = SamlXmlReader::default().read_saml_response(xml).unwrap_err();
        assert!(matches!(err, SamlError::Structural(_)));
    }

    #[test]
    fn reads_back_authn_request() {
        let request = AuthnRequestBuilder::new()
            .auto_id()
            .issue_instant(time::macros::datetime!(2023-09-08 14:53:02 UTC))
            .issuer("https://sp.example.com/Metadata")
            .destination("https://idp.example.com/sso")
            .protocol_binding(ProtocolBinding::Post)
            .consumer_url("https://sp.example.com:8888/Saml2/Acs")
            .name_format(NAME_ID_FORMAT_EMAIL_ADDRESS)
            .build()
            .unwrap();
        let read = SamlXmlReader::default()
            .read_authn_request(&request.to_xml().unwrap())
            .unwrap();
        assert_eq!(read, request);
    }

    #[test]
    fn signed_authn_request_is_verified() {
        let request = AuthnRequestBuilder::new()
            .id("_req1")
            .issued_now()
            .issuer("https://sp.example.com/Metadata")
            .build()
            .unwrap();
        let signed =
            crate::signature::sign_enveloped(&request.to_xml().unwrap(), "_req1", &idp_credential())
                .unwrap();
        let read = SamlXmlReader::new(vec![idp_signing_key()])
            .read_authn_request(&signed)
            .unwrap();
        assert_eq!(read.id, "_req1");
    }

    #[test]
    fn unknown_protocol_binding_is_structural() {
        let xml = r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_req1" Version="2.0" IssueInstant="2023-09-08T14:53:02Z" ProtocolBinding="urn:example:carrier-pigeon"><saml:Issuer>https://sp.example.com/Metadata</saml:Issuer></samlp:AuthnRequest>"#;
        match SamlXmlReader::default().read_authn_request(xml) {
            Err(SamlError::Structural(errors)) => {
                assert!(errors.iter().any(|e| e.message.contains("carrier-pigeon")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
