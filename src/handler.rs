//! Service provider flows: challenge, assertion consumer, metadata.
//!
//! The handler never touches a transport. It reads a framework-neutral
//! [`HttpRequestData`] and answers with a [`CommandResult`].

use std::collections::BTreeMap;

use base64::{prelude::BASE64_STANDARD, Engine};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::{
    authn_request::{AuthnRequestBuilder, ProtocolBinding},
    binding::{HttpPostBinding, HttpRedirectBinding, MessageName},
    command_result::{CommandResult, CookieDirective, Principal},
    error::{SamlError, SamlResult, ValidationError},
    options::Saml2Options,
    request_state::{RequestStateStore, StoredRequestState},
    signature::{sign_enveloped, SignatureVerifier},
    sp_metadata::SpMetadataBuilder,
    validation::{SamlResponseValidator, SignaturePolicy, ValidationContext},
};

/// The parts of an incoming HTTP request the handler looks at.
#[derive(Debug, Clone, Default)]
pub struct HttpRequestData {
    pub method: String,
    /// Full request URL including the query string.
    pub url: String,
    /// Form-decoded body fields of a POST.
    pub form: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
}

impl HttpRequestData {
    fn cookies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cookies
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

#[derive(Debug)]
pub struct Saml2Handler {
    options: Saml2Options,
    validator: SamlResponseValidator,
}

impl Saml2Handler {
    pub fn new(options: Saml2Options) -> SamlResult<Self> {
        options.validate()?;
        Ok(Saml2Handler {
            options,
            validator: SamlResponseValidator::new(),
        })
    }

    /// Replaces the standard validation steps.
    pub fn with_validator(self, validator: SamlResponseValidator) -> Self {
        Saml2Handler { validator, ..self }
    }

    pub fn options(&self) -> &Saml2Options {
        &self.options
    }

    fn store<'a>(
        &self,
        cookies: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> RequestStateStore {
        RequestStateStore::from_cookies(
            self.options.state_protector.clone(),
            &self.options.cookie_name_base,
            self.options.max_outstanding_requests,
            cookies,
        )
    }

    /// Starts a sign-in: builds an AuthnRequest for the configured IdP,
    /// remembers it in a new state cookie and sends the browser off.
    pub fn challenge(
        &self,
        request: &HttpRequestData,
        return_url: Option<&str>,
        relay_data: BTreeMap<String, String>,
        now: OffsetDateTime,
    ) -> SamlResult<CommandResult> {
        let options = &self.options;
        let idp = &options.identity_provider;
        let mut builder = AuthnRequestBuilder::new()
            .auto_id()
            .issue_instant(now)
            .issuer(&options.entity_id)
            .destination(&idp.sso_service_url)
            .protocol_binding(ProtocolBinding::Post)
            .consumer_url(&options.assertion_consumer_service_url);
        if let Some(format) = &options.name_id_format {
            builder = builder.name_format(format);
        }
        let authn_request = builder.build()?;

        let state = StoredRequestState {
            message_id: authn_request.id.clone(),
            idp_entity_id: idp.entity_id.clone(),
            return_url: return_url.map(str::to_string),
            relay_data,
            created: now,
        };
        let entry = self.store(request.cookies()).store(&state)?;

        let xml = authn_request.to_xml()?;
        let credential = options.authn_request_signing.as_ref();
        let result = match idp.sso_service_binding {
            ProtocolBinding::Redirect => CommandResult::redirect(&HttpRedirectBinding::bind(
                &xml,
                MessageName::SamlRequest,
                &idp.sso_service_url,
                Some(&entry.name),
                credential,
            )?),
            ProtocolBinding::Post => {
                let xml = match credential {
                    Some(credential) => sign_enveloped(&xml, &authn_request.id, credential)?,
                    None => xml,
                };
                let form = HttpPostBinding::bind(
                    &xml,
                    MessageName::SamlRequest,
                    &idp.sso_service_url,
                    Some(&entry.name),
                );
                CommandResult::content("text/html; charset=utf-8", form.to_html())
            }
        };

        info!(
            request_id = %authn_request.id,
            idp = %idp.entity_id,
            binding = %idp.sso_service_binding,
            "issued AuthnRequest"
        );
        let cookie = CookieDirective {
            name: entry.name,
            value: entry.value,
            http_only: true,
            secure: options.secure_cookies,
            same_site_none: options.same_site_none,
            essential: true,
        };
        Ok(result
            .with_cookie(cookie, entry.evicted)
            .with_header("Cache-Control", "no-cache, no-store"))
    }

    /// Assertion consumer service: reads, verifies and validates an IdP
    /// response, then signs the user in.
    pub fn handle_response(
        &self,
        request: &HttpRequestData,
        now: OffsetDateTime,
    ) -> SamlResult<CommandResult> {
        let options = &self.options;
        let parameters = options.validation_parameters();

        let message = if request.method.eq_ignore_ascii_case("POST") {
            HttpPostBinding::unbind(request.form.iter().map(|(k, v)| (k.as_str(), v.as_str())))?
        } else {
            let verifier = SignatureVerifier::new(
                &parameters.trusted_signing_keys,
                &parameters.allowed_hash_algorithms,
            );
            HttpRedirectBinding::unbind(&request.url, Some(&verifier))?
        };
        if message.name != MessageName::SamlResponse {
            return Err(SamlError::Binding(format!(
                "expected SAMLResponse, got {}",
                message.name.param()
            )));
        }

        let mut response = parameters.reader().read_saml_response(&message.xml)?;
        if let Some(query_signature) = &message.query_signature {
            if response.signature.is_none() {
                response.signature = Some(query_signature.covering(&response.id));
            }
        }

        // Only the state of the request this response answers is bound to it.
        let stored = match response.in_response_to.as_deref() {
            Some(in_response_to) => {
                let store = self.store(request.cookies());
                let stored = message
                    .relay_state
                    .as_deref()
                    .and_then(|token| Some((token.to_string(), store.retrieve(token)?)))
                    .filter(|(_, state)| state.message_id == in_response_to)
                    .or_else(|| store.find_by_message_id(in_response_to));
                if stored.is_none() {
                    warn!(in_response_to, "no outstanding request state for response");
                }
                stored
            }
            None => None,
        };

        let context = ValidationContext {
            parameters: &parameters,
            now,
            stored_state: stored.as_ref().map(|(_, state)| state),
        };
        self.validator.validate(&response, &context)?;

        let principal = response
            .assertions
            .iter()
            .find_map(Principal::from_assertion)
            .ok_or_else(|| {
                SamlError::Validation(vec![ValidationError::Trust(
                    "no assertion identifies a subject".into(),
                )])
            })?;
        info!(
            subject = %principal.name_id.value,
            idp = %principal.issuer,
            response = %response.id,
            "user signed in"
        );

        let result = match stored {
            Some((token, state)) => {
                CommandResult::sign_in(principal, state.relay_data, state.return_url)
                    .with_clear_cookie(&token, options.secure_cookies)
            }
            None => CommandResult::sign_in(principal, BTreeMap::new(), None),
        };
        Ok(result)
    }

    /// The SP metadata document.
    pub fn metadata(&self) -> SamlResult<CommandResult> {
        let options = &self.options;
        let mut builder = SpMetadataBuilder::new()
            .entity_id(&options.entity_id)
            .acs_url(&options.assertion_consumer_service_url)
            .authn_requests_signed(options.authn_request_signing.is_some())
            .want_assertions_signed(options.signature_policy == SignaturePolicy::Assertions);
        if let Some(format) = &options.name_id_format {
            builder = builder.name_id_format(format);
        }
        if let Some(der) = options
            .authn_request_signing
            .as_ref()
            .and_then(|credential| credential.certificate_der())
        {
            builder = builder.signing_certificate(&BASE64_STANDARD.encode(der));
        }
        Ok(CommandResult::content(
            "application/samlmetadata+xml",
            builder.build()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        binding::InboundMessage,
        command_result::{AdapterAction, PrimaryEffect},
        options::IdentityProvider,
        reader::SamlXmlReader,
        request_state::RequestStateProtector,
        signature::{SigningCredential, SigningKey},
        test_support::{
            idp_credential, idp_signing_key, other_credential, sample_response, sign_response,
            ACS_URL, IDP_ENTITY_ID, IDP_SSO_URL, NOW, OTHER_CERT_PEM, SP_ENTITY_ID,
        },
        xml::XmlDocument,
    };

    fn options() -> Saml2Options {
        Saml2Options::new(
            SP_ENTITY_ID,
            ACS_URL,
            IdentityProvider::new(IDP_ENTITY_ID, IDP_SSO_URL)
                .sso_service_binding(ProtocolBinding::Redirect)
                .signing_key(idp_signing_key()),
        )
        .state_protector(RequestStateProtector::new([42; 32]))
    }

    fn handler() -> Saml2Handler {
        Saml2Handler::new(options()).unwrap()
    }

    fn cookies_of(result: &CommandResult) -> Vec<(String, String)> {
        result
            .set_cookie
            .iter()
            .map(|cookie| (cookie.name.clone(), cookie.value.clone()))
            .collect()
    }

    fn challenge(
        handler: &Saml2Handler,
        cookies: Vec<(String, String)>,
    ) -> (CommandResult, InboundMessage) {
        let request = HttpRequestData {
            method: "GET".into(),
            url: "https://sp.example.com:8888/path".into(),
            cookies,
            ..Default::default()
        };
        let relay_data = BTreeMap::from([("tenant".to_string(), "a".to_string())]);
        let result = handler
            .challenge(&request, Some("/after"), relay_data, NOW)
            .unwrap();
        let location = result.location.clone().unwrap();
        let message = HttpRedirectBinding::unbind(&location, None).unwrap();
        (result, message)
    }

    fn post_response(
        xml: &str,
        relay_state: Option<&str>,
        cookies: Vec<(String, String)>,
    ) -> HttpRequestData {
        let mut form = vec![("SAMLResponse".to_string(), BASE64_STANDARD.encode(xml))];
        if let Some(relay_state) = relay_state {
            form.push(("RelayState".to_string(), relay_state.to_string()));
        }
        HttpRequestData {
            method: "POST".into(),
            url: ACS_URL.into(),
            form,
            cookies,
        }
    }

    #[test]
    fn challenge_redirects_with_authn_request() {
        let handler = handler();
        let (result, message) = challenge(&handler, Vec::new());
        assert_eq!(result.status_code, 303);
        assert!(result
            .location
            .as_deref()
            .unwrap()
            .starts_with("https://idp.example.com/sso?SAMLRequest="));

        let request = SamlXmlReader::default()
            .read_authn_request(&message.xml)
            .unwrap();
        assert_eq!(request.issuer, SP_ENTITY_ID);
        assert_eq!(request.issue_instant, NOW);
        assert_eq!(request.assertion_consumer_service_url.as_deref(), Some(ACS_URL));
        assert_eq!(request.destination.as_deref(), Some(IDP_SSO_URL));

        let cookie = result.set_cookie.as_ref().unwrap();
        assert_eq!(message.relay_state.as_deref(), Some(cookie.name.as_str()));
        assert!(cookie.http_only && cookie.secure && cookie.same_site_none && cookie.essential);
    }

    #[test]
    fn challenge_with_post_binding_renders_form() {
        let mut options = options();
        options.identity_provider.sso_service_binding = ProtocolBinding::Post;
        let handler = Saml2Handler::new(options).unwrap();
        let result = handler
            .challenge(&HttpRequestData::default(), None, BTreeMap::new(), NOW)
            .unwrap();
        match &result.effect {
            PrimaryEffect::Content { content_type, body } => {
                assert!(content_type.starts_with("text/html"));
                assert!(body.contains(r#"action="https://idp.example.com/sso""#));
                assert!(body.contains(r#"name="SAMLRequest""#));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fourth_challenge_evicts_oldest_state() {
        let handler = handler();
        let mut cookies = Vec::new();
        for _ in 0..3 {
            let (result, _) = challenge(&handler, cookies.clone());
            cookies.extend(cookies_of(&result));
        }
        let (result, _) = challenge(&handler, cookies);
        assert_eq!(result.evicted_cookies, ["Saml2.RequestState.1"]);
        let actions = result.actions();
        let delete = actions
            .iter()
            .position(|a| matches!(a, AdapterAction::DeleteCookie { .. }))
            .unwrap();
        let append = actions
            .iter()
            .position(|a| matches!(a, AdapterAction::AppendCookie(_)))
            .unwrap();
        assert!(delete < append);
    }

    #[test]
    fn end_to_end_sign_in() {
        let handler = handler();
        let (challenge_result, message) = challenge(&handler, Vec::new());
        let request = SamlXmlReader::default()
            .read_authn_request(&message.xml)
            .unwrap();

        let xml = sign_response(&sample_response(Some(&request.id)), true, true);
        let relay_state = message.relay_state.as_deref();
        let callback = post_response(&xml, relay_state, cookies_of(&challenge_result));
        let result = handler.handle_response(&callback, NOW).unwrap();

        assert_eq!(result.location.as_deref(), Some("/after"));
        assert_eq!(result.clear_cookie, message.relay_state);
        match &result.effect {
            PrimaryEffect::SignIn {
                principal,
                relay_data,
            } => {
                assert_eq!(principal.name_id.value, "user@example.com");
                assert_eq!(principal.issuer, IDP_ENTITY_ID);
                assert_eq!(relay_data["tenant"], "a");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn correlates_by_in_response_to_without_relay_state() {
        let handler = handler();
        let (challenge_result, message) = challenge(&handler, Vec::new());
        let request_id = XmlDocument::parse(&message.xml)
            .unwrap()
            .root()
            .attribute("ID")
            .unwrap()
            .to_string();
        let xml = sign_response(&sample_response(Some(&request_id)), true, false);
        let callback = post_response(&xml, None, cookies_of(&challenge_result));
        assert!(handler.handle_response(&callback, NOW).is_ok());
    }

    #[test]
    fn unsolicited_response_leaves_relay_state_untouched() {
        let handler = handler();
        let (challenge_result, message) = challenge(&handler, Vec::new());
        let xml = sign_response(&sample_response(None), true, false);
        let relay_state = message.relay_state.as_deref();
        let callback = post_response(&xml, relay_state, cookies_of(&challenge_result));
        let result = handler.handle_response(&callback, NOW).unwrap();

        assert_eq!(result.clear_cookie, None);
        assert_eq!(result.location, None);
        match &result.effect {
            PrimaryEffect::SignIn { relay_data, .. } => assert!(relay_data.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn relay_state_of_another_request_is_not_bound() {
        let handler = handler();
        let (first, first_message) = challenge(&handler, Vec::new());
        let (second, second_message) = challenge(&handler, cookies_of(&first));
        let second_id = SamlXmlReader::default()
            .read_authn_request(&second_message.xml)
            .unwrap()
            .id;

        let mut cookies = cookies_of(&first);
        cookies.extend(cookies_of(&second));
        let xml = sign_response(&sample_response(Some(&second_id)), true, false);
        let callback = post_response(&xml, first_message.relay_state.as_deref(), cookies);
        let result = handler.handle_response(&callback, NOW).unwrap();
        assert_eq!(result.clear_cookie, second_message.relay_state);
    }

    #[test]
    fn redirect_query_signature_covers_response() {
        let xml = sample_response(None).to_xml().unwrap();
        let redirect = |credential: Option<&SigningCredential>| HttpRequestData {
            method: "GET".into(),
            url: HttpRedirectBinding::bind(
                &xml,
                MessageName::SamlResponse,
                ACS_URL,
                None,
                credential,
            )
            .unwrap(),
            ..Default::default()
        };

        let credential = idp_credential();
        let result = handler()
            .handle_response(&redirect(Some(&credential)), NOW)
            .unwrap();
        assert!(matches!(result.effect, PrimaryEffect::SignIn { .. }));

        let err = handler().handle_response(&redirect(None), NOW).unwrap_err();
        assert!(matches!(err.validation_errors(), [ValidationError::Trust(_)]));
    }

    #[test]
    fn rejects_response_to_unknown_request() {
        let xml = sign_response(&sample_response(Some("_never_stored")), true, false);
        let err = handler()
            .handle_response(&post_response(&xml, None, Vec::new()), NOW)
            .unwrap_err();
        assert!(matches!(
            err.validation_errors(),
            [ValidationError::Correlation(_)]
        ));
        assert_eq!(err.http_status(), 401);
    }

    #[test]
    fn rejects_expired_and_forged_responses() {
        let expired = sign_response(&sample_response(None), true, false);
        let err = handler()
            .handle_response(
                &post_response(&expired, None, Vec::new()),
                NOW + time::Duration::hours(1),
            )
            .unwrap_err();
        assert!(err
            .validation_errors()
            .iter()
            .all(|e| matches!(e, ValidationError::Conditions(_))));

        let forged = sign_response(&sample_response(None), true, false)
            .replace("user@example.com", "admin@example.com");
        let err = handler()
            .handle_response(&post_response(&forged, None, Vec::new()), NOW)
            .unwrap_err();
        assert!(matches!(err, SamlError::Signature(_)));

        let garbage = HttpRequestData {
            method: "POST".into(),
            form: vec![("SAMLResponse".into(), "***".into())],
            ..Default::default()
        };
        assert!(matches!(
            handler().handle_response(&garbage, NOW),
            Err(SamlError::Binding(_))
        ));
    }

    #[test]
    fn serves_metadata() {
        let result = handler().metadata().unwrap();
        match result.effect {
            PrimaryEffect::Content { content_type, body } => {
                assert_eq!(content_type, "application/samlmetadata+xml");
                let document = XmlDocument::parse(&body).unwrap();
                assert_eq!(document.root().attribute("entityID"), Some(SP_ENTITY_ID));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn signs_requests_and_publishes_certificate() {
        let credential = other_credential().certificate_pem(OTHER_CERT_PEM).unwrap();
        let options = options()
            .authn_request_signing(credential)
            .name_id_format(crate::NAME_ID_FORMAT_TRANSIENT);
        let handler = Saml2Handler::new(options).unwrap();
        let result = handler
            .challenge(&HttpRequestData::default(), None, BTreeMap::new(), NOW)
            .unwrap();
        let location = result.location.unwrap();
        assert!(location.contains("&SigAlg=") && location.contains("&Signature="));

        let sp_key = SigningKey::from_certificate_pem(OTHER_CERT_PEM).unwrap();
        let keys = [sp_key.clone()];
        let algorithms = &crate::signature::DigestAlgorithm::DEFAULT_ALLOWED;
        let verifier = SignatureVerifier::new(&keys, algorithms);
        let message = HttpRedirectBinding::unbind(&location, Some(&verifier)).unwrap();
        assert_eq!(
            message.query_signature.map(|signature| signature.key_fingerprint).as_deref(),
            Some(sp_key.fingerprint())
        );
        let request = SamlXmlReader::default()
            .read_authn_request(&message.xml)
            .unwrap();
        assert_eq!(
            request.name_id_policy.and_then(|policy| policy.format).as_deref(),
            Some(crate::NAME_ID_FORMAT_TRANSIENT)
        );

        let metadata = match handler.metadata().unwrap().effect {
            PrimaryEffect::Content { body, .. } => body,
            other => panic!("unexpected {other:?}"),
        };
        assert!(metadata.contains(r#"AuthnRequestsSigned="true""#));
        assert!(metadata.contains("X509Certificate"));
        assert!(metadata.contains(crate::NAME_ID_FORMAT_TRANSIENT));
    }
}
