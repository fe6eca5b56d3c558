use std::collections::HashMap;

use time::Duration;

use crate::{
    authn_request::ProtocolBinding,
    error::{SamlError, SamlResult},
    idp_metadata::IdpMetadata,
    request_state::{RequestStateProtector, DEFAULT_COOKIE_NAME_BASE, DEFAULT_MAX_OUTSTANDING},
    signature::{DigestAlgorithm, SigningCredential, SigningKey},
    validation::{SamlResponseValidationParameters, SignaturePolicy},
};

#[derive(Debug, Clone)]
pub struct IdentityProvider {
    pub entity_id: String,
    pub sso_service_url: String,
    pub sso_service_binding: ProtocolBinding,
    pub signing_keys: Vec<SigningKey>,
}

impl IdentityProvider {
    pub fn new(entity_id: &str, sso_service_url: &str) -> Self {
        IdentityProvider {
            entity_id: entity_id.to_string(),
            sso_service_url: sso_service_url.to_string(),
            sso_service_binding: ProtocolBinding::default(),
            signing_keys: Vec::new(),
        }
    }

    pub fn sso_service_binding(self, binding: ProtocolBinding) -> Self {
        IdentityProvider {
            sso_service_binding: binding,
            ..self
        }
    }

    pub fn signing_key(mut self, key: SigningKey) -> Self {
        self.signing_keys.push(key);
        self
    }

    /// Picks the Redirect SSO endpoint when advertised, POST otherwise.
    pub fn from_metadata(metadata: &IdpMetadata) -> SamlResult<Self> {
        let preferred = |bindings: &HashMap<ProtocolBinding, String>| {
            [ProtocolBinding::Redirect, ProtocolBinding::Post]
                .into_iter()
                .find_map(|binding| Some((binding, bindings.get(&binding)?.clone())))
        };
        let (binding, url) = preferred(&metadata.sso_bindings).ok_or_else(|| {
            SamlError::Configuration(format!(
                "IdP {} advertises no supported SSO binding",
                metadata.entity_id
            ))
        })?;
        Ok(IdentityProvider {
            entity_id: metadata.entity_id.clone(),
            sso_service_url: url,
            sso_service_binding: binding,
            signing_keys: metadata.signing_keys.clone(),
        })
    }
}

/// Service provider configuration.
#[derive(Debug, Clone)]
pub struct Saml2Options {
    pub entity_id: String,
    pub assertion_consumer_service_url: String,
    pub identity_provider: IdentityProvider,
    pub state_protector: RequestStateProtector,
    pub cookie_name_base: String,
    pub max_outstanding_requests: usize,
    pub secure_cookies: bool,
    /// Mark state cookies `SameSite=None` so they survive the IdP's cross-site POST.
    pub same_site_none: bool,
    pub clock_skew: Duration,
    pub allowed_hash_algorithms: Vec<DigestAlgorithm>,
    pub signature_policy: SignaturePolicy,
    pub authn_request_signing: Option<SigningCredential>,
    pub name_id_format: Option<String>,
    pub require_issuer: bool,
    pub allow_unsolicited: bool,
}

impl Saml2Options {
    pub fn new(
        entity_id: &str,
        assertion_consumer_service_url: &str,
        identity_provider: IdentityProvider,
    ) -> Self {
        Saml2Options {
            entity_id: entity_id.to_string(),
            assertion_consumer_service_url: assertion_consumer_service_url.to_string(),
            identity_provider,
            state_protector: RequestStateProtector::generate(),
            cookie_name_base: DEFAULT_COOKIE_NAME_BASE.to_string(),
            max_outstanding_requests: DEFAULT_MAX_OUTSTANDING,
            secure_cookies: true,
            same_site_none: true,
            clock_skew: Duration::minutes(2),
            allowed_hash_algorithms: DigestAlgorithm::DEFAULT_ALLOWED.to_vec(),
            signature_policy: SignaturePolicy::default(),
            authn_request_signing: None,
            name_id_format: None,
            require_issuer: false,
            allow_unsolicited: true,
        }
    }

    pub fn state_protector(self, protector: RequestStateProtector) -> Self {
        Saml2Options {
            state_protector: protector,
            ..self
        }
    }

    pub fn cookie_name_base(self, base: &str) -> Self {
        Saml2Options {
            cookie_name_base: base.into(),
            ..self
        }
    }

    pub fn max_outstanding_requests(self, max: usize) -> Self {
        Saml2Options {
            max_outstanding_requests: max,
            ..self
        }
    }

    pub fn secure_cookies(self, secure: bool) -> Self {
        Saml2Options {
            secure_cookies: secure,
            ..self
        }
    }

    pub fn same_site_none(self, same_site_none: bool) -> Self {
        Saml2Options {
            same_site_none,
            ..self
        }
    }

    pub fn clock_skew(self, skew: Duration) -> Self {
        Saml2Options {
            clock_skew: skew,
            ..self
        }
    }

    pub fn allowed_hash_algorithms(self, algorithms: &[DigestAlgorithm]) -> Self {
        Saml2Options {
            allowed_hash_algorithms: algorithms.to_vec(),
            ..self
        }
    }

    pub fn signature_policy(self, policy: SignaturePolicy) -> Self {
        Saml2Options {
            signature_policy: policy,
            ..self
        }
    }

    pub fn authn_request_signing(self, credential: SigningCredential) -> Self {
        Saml2Options {
            authn_request_signing: Some(credential),
            ..self
        }
    }

    pub fn name_id_format(self, format: &str) -> Self {
        Saml2Options {
            name_id_format: Some(format.into()),
            ..self
        }
    }

    pub fn require_issuer(self, require: bool) -> Self {
        Saml2Options {
            require_issuer: require,
            ..self
        }
    }

    pub fn allow_unsolicited(self, allow: bool) -> Self {
        Saml2Options {
            allow_unsolicited: allow,
            ..self
        }
    }

    pub fn validate(&self) -> SamlResult<()> {
        let error = |message: String| Err(SamlError::Configuration(message));
        for (name, value) in [
            ("entity id", &self.entity_id),
            ("IdP entity id", &self.identity_provider.entity_id),
        ] {
            if value.trim().is_empty() {
                return error(format!("{name} is required"));
            }
        }
        for (name, value) in [
            ("assertion consumer service URL", &self.assertion_consumer_service_url),
            ("IdP SSO service URL", &self.identity_provider.sso_service_url),
        ] {
            if let Err(e) = url::Url::parse(value) {
                return error(format!("{name} '{value}' is not an absolute URL: {e}"));
            }
        }
        if self.max_outstanding_requests == 0 {
            return error("at least one outstanding request must be allowed".into());
        }
        if self.cookie_name_base.is_empty()
            || self.cookie_name_base.ends_with(|c: char| c.is_ascii_digit())
        {
            return error(format!(
                "cookie name base '{}' must be non-empty and not end in a digit",
                self.cookie_name_base
            ));
        }
        if self.allowed_hash_algorithms.is_empty() {
            return error("no hash algorithm is allowed".into());
        }
        if self.signature_policy != SignaturePolicy::None
            && self.identity_provider.signing_keys.is_empty()
        {
            return error(format!(
                "signatures are required but no signing key is trusted for {}",
                self.identity_provider.entity_id
            ));
        }
        if self.same_site_none && !self.secure_cookies {
            return error("SameSite=None cookies must be secure".into());
        }
        Ok(())
    }

    pub fn validation_parameters(&self) -> SamlResponseValidationParameters {
        SamlResponseValidationParameters {
            clock_skew: self.clock_skew,
            allowed_hash_algorithms: self.allowed_hash_algorithms.clone(),
            signature_policy: self.signature_policy,
            require_issuer: self.require_issuer,
            allow_unsolicited: self.allow_unsolicited,
            assertion_consumer_service_url: Some(self.assertion_consumer_service_url.clone()),
            ..SamlResponseValidationParameters::new(
                &self.identity_provider.entity_id,
                &self.entity_id,
                self.identity_provider.signing_keys.clone(),
            )
        }
    }
}
