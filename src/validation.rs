//! Response and assertion validation.
//!
//! The validator runs an ordered list of steps. Every step sees the response
//! once on its own and then once per assertion, and returns the problems it
//! found. All steps always run so the caller gets the complete list, but any
//! single problem fails the validation.

use std::fmt;

use time::{Duration, OffsetDateTime};
use tracing::warn;

use crate::{
    assertion::{Assertion, NameId},
    error::{SamlError, SamlResult, ValidationError},
    reader::SamlXmlReader,
    request_state::StoredRequestState,
    response::SamlResponse,
    signature::{DigestAlgorithm, SigningKey},
    utils::format_date_time,
    CONFIRMATION_METHOD_BEARER,
};

/// Which elements must carry a verified signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignaturePolicy {
    /// A signed response covers its assertions; otherwise each assertion
    /// must be signed itself.
    #[default]
    ResponseOrAssertions,
    /// Every assertion must be signed, whatever the response carries.
    Assertions,
    /// Signatures are verified when present but never required.
    None,
}

/// Trust configuration for one validation call.
#[derive(Debug, Clone)]
pub struct SamlResponseValidationParameters {
    pub valid_issuer: String,
    pub valid_audience: String,
    pub trusted_signing_keys: Vec<SigningKey>,
    pub allowed_hash_algorithms: Vec<DigestAlgorithm>,
    pub clock_skew: Duration,
    pub signature_policy: SignaturePolicy,
    /// Reject responses without an `<Issuer>`. Off by default, in which case
    /// an absent issuer is not checked at all.
    pub require_issuer: bool,
    /// Accept responses without `InResponseTo`.
    pub allow_unsolicited: bool,
    /// Expected bearer `Recipient`, when known.
    pub assertion_consumer_service_url: Option<String>,
}

impl SamlResponseValidationParameters {
    pub fn new(
        valid_issuer: &str,
        valid_audience: &str,
        trusted_signing_keys: Vec<SigningKey>,
    ) -> Self {
        SamlResponseValidationParameters {
            valid_issuer: valid_issuer.to_string(),
            valid_audience: valid_audience.to_string(),
            trusted_signing_keys,
            allowed_hash_algorithms: DigestAlgorithm::DEFAULT_ALLOWED.to_vec(),
            clock_skew: Duration::minutes(2),
            signature_policy: SignaturePolicy::default(),
            require_issuer: false,
            allow_unsolicited: true,
            assertion_consumer_service_url: None,
        }
    }

    /// A reader that verifies signatures with these keys and algorithms.
    pub fn reader(&self) -> SamlXmlReader {
        SamlXmlReader::new(self.trusted_signing_keys.clone())
            .allowed_hash_algorithms(&self.allowed_hash_algorithms)
    }
}

/// Everything a step may look at besides the response itself.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    pub parameters: &'a SamlResponseValidationParameters,
    pub now: OffsetDateTime,
    /// State of the request the response answers, when one was found.
    pub stored_state: Option<&'a StoredRequestState>,
}

/// One check. Called with `assertion == None` for the response as a whole,
/// then once for every assertion.
pub trait ValidationStep: Send + Sync {
    fn validate(
        &self,
        response: &SamlResponse,
        assertion: Option<&Assertion>,
        context: &ValidationContext<'_>,
    ) -> Vec<ValidationError>;
}

impl<F> ValidationStep for F
where
    F: Fn(&SamlResponse, Option<&Assertion>, &ValidationContext<'_>) -> Vec<ValidationError>
        + Send
        + Sync,
{
    fn validate(
        &self,
        response: &SamlResponse,
        assertion: Option<&Assertion>,
        context: &ValidationContext<'_>,
    ) -> Vec<ValidationError> {
        self(response, assertion, context)
    }
}

/// Compares an issuer against the expected one. An absent issuer passes;
/// whether that is acceptable is decided by the caller.
pub fn validate_issuer(issuer: Option<&NameId>, expected: &str) -> Result<(), ValidationError> {
    match issuer {
        Some(issuer) if issuer.value != expected => Err(ValidationError::Issuer {
            expected: expected.to_string(),
            actual: issuer.value.clone(),
        }),
        _ => Ok(()),
    }
}

fn display_instant(instant: OffsetDateTime) -> String {
    format_date_time(instant).unwrap_or_else(|_| instant.to_string())
}

fn status_step(
    response: &SamlResponse,
    assertion: Option<&Assertion>,
    _: &ValidationContext<'_>,
) -> Vec<ValidationError> {
    if assertion.is_some() {
        return Vec::new();
    }
    let status = &response.status;
    if !status.is_success() {
        let mut message = status.code.clone();
        if let Some(second) = &status.second_level_code {
            message.push_str(&format!(" / {second}"));
        }
        if let Some(text) = &status.message {
            message.push_str(&format!(" ({text})"));
        }
        return vec![ValidationError::Status(message)];
    }
    if response.assertions.is_empty() {
        return vec![ValidationError::Status(
            "successful response contains no assertions".into(),
        )];
    }
    Vec::new()
}

fn issuer_step(
    response: &SamlResponse,
    assertion: Option<&Assertion>,
    context: &ValidationContext<'_>,
) -> Vec<ValidationError> {
    let expected = &context.parameters.valid_issuer;
    match assertion {
        None if response.issuer.is_none() && context.parameters.require_issuer => {
            vec![ValidationError::Trust(format!(
                "Response has no issuer, expected {expected}"
            ))]
        }
        None => validate_issuer(response.issuer.as_ref(), expected).err().into_iter().collect(),
        Some(assertion) => validate_issuer(Some(&assertion.issuer), expected)
            .err()
            .into_iter()
            .collect(),
    }
}

fn signature_step(
    response: &SamlResponse,
    assertion: Option<&Assertion>,
    context: &ValidationContext<'_>,
) -> Vec<ValidationError> {
    let parameters = context.parameters;
    let signature = match assertion {
        None => response.signature.as_ref(),
        Some(assertion) => assertion.signature.as_ref(),
    };

    let mut errors = Vec::new();
    if let Some(signature) = signature {
        let trusted = parameters
            .trusted_signing_keys
            .iter()
            .any(|key| key.fingerprint() == signature.key_fingerprint);
        if !trusted {
            errors.push(ValidationError::Trust(format!(
                "{} is signed by untrusted key {}",
                signature.reference_id, signature.key_fingerprint
            )));
        }
        if !parameters
            .allowed_hash_algorithms
            .contains(&signature.digest_algorithm)
        {
            errors.push(ValidationError::Trust(format!(
                "{} uses disallowed hash algorithm {}",
                signature.reference_id,
                signature.digest_algorithm.uri()
            )));
        }
    }

    if let Some(assertion) = assertion {
        let covered = match parameters.signature_policy {
            SignaturePolicy::None => true,
            SignaturePolicy::Assertions => assertion.signature.is_some(),
            SignaturePolicy::ResponseOrAssertions => {
                assertion.signature.is_some() || response.signature.is_some()
            }
        };
        if !covered {
            errors.push(ValidationError::Trust(format!(
                "assertion {} is not signed and not covered by a response signature",
                assertion.id
            )));
        }
    }
    errors
}

fn time_window_step(
    _: &SamlResponse,
    assertion: Option<&Assertion>,
    context: &ValidationContext<'_>,
) -> Vec<ValidationError> {
    let Some(conditions) = assertion.and_then(|assertion| assertion.conditions.as_ref()) else {
        return Vec::new();
    };
    let skew = context.parameters.clock_skew;
    let now = context.now;
    let mut errors = Vec::new();
    if let Some(not_before) = conditions.not_before {
        if now + skew < not_before {
            errors.push(ValidationError::Conditions(format!(
                "assertion is not valid before {}, current time is {}",
                display_instant(not_before),
                display_instant(now)
            )));
        }
    }
    if let Some(not_on_or_after) = conditions.not_on_or_after {
        if now - skew >= not_on_or_after {
            errors.push(ValidationError::Conditions(format!(
                "assertion expired at {}, current time is {}",
                display_instant(not_on_or_after),
                display_instant(now)
            )));
        }
    }
    errors
}

fn audience_step(
    _: &SamlResponse,
    assertion: Option<&Assertion>,
    context: &ValidationContext<'_>,
) -> Vec<ValidationError> {
    let Some(conditions) = assertion.and_then(|assertion| assertion.conditions.as_ref()) else {
        return Vec::new();
    };
    let restrictions = &conditions.audience_restrictions;
    let audience = &context.parameters.valid_audience;
    if restrictions.is_empty()
        || restrictions
            .iter()
            .any(|audiences| audiences.iter().any(|a| a == audience))
    {
        return Vec::new();
    }
    vec![ValidationError::Conditions(format!(
        "audience {audience} is not among the restricted audiences {}",
        restrictions.concat().join(", ")
    ))]
}

fn subject_confirmation_step(
    response: &SamlResponse,
    assertion: Option<&Assertion>,
    context: &ValidationContext<'_>,
) -> Vec<ValidationError> {
    let Some(assertion) = assertion else {
        return Vec::new();
    };
    let parameters = context.parameters;
    let skew = parameters.clock_skew;
    let bearers: Vec<_> = assertion
        .subject
        .iter()
        .flat_map(|subject| subject.confirmations.iter())
        .filter(|confirmation| confirmation.method == CONFIRMATION_METHOD_BEARER)
        .collect();
    if bearers.is_empty() {
        return vec![ValidationError::Conditions(format!(
            "assertion {} has no bearer subject confirmation",
            assertion.id
        ))];
    }

    let mut reasons = Vec::new();
    for bearer in bearers {
        let Some(data) = &bearer.data else {
            reasons.push("bearer confirmation has no SubjectConfirmationData".to_string());
            continue;
        };
        let mut problems = Vec::new();
        match data.not_on_or_after {
            Some(limit) if context.now - skew >= limit => {
                problems.push(format!("bearer confirmation expired at {}", display_instant(limit)));
            }
            Some(_) => {}
            None => problems.push("bearer confirmation has no NotOnOrAfter".to_string()),
        }
        if let Some(not_before) = data.not_before {
            if context.now + skew < not_before {
                problems.push(format!(
                    "bearer confirmation is not valid before {}",
                    display_instant(not_before)
                ));
            }
        }
        if let (Some(expected), Some(recipient)) =
            (&parameters.assertion_consumer_service_url, &data.recipient)
        {
            if expected != recipient {
                problems.push(format!(
                    "bearer recipient {recipient} does not match expected {expected}"
                ));
            }
        }
        if let Some(in_response_to) = &data.in_response_to {
            if response.in_response_to.as_ref() != Some(in_response_to) {
                problems.push(format!(
                    "bearer InResponseTo {in_response_to} does not match the response"
                ));
            }
        }
        if problems.is_empty() {
            return Vec::new();
        }
        reasons.extend(problems);
    }
    vec![ValidationError::Conditions(format!(
        "no valid bearer subject confirmation in assertion {}: {}",
        assertion.id,
        reasons.join("; ")
    ))]
}

fn correlation_step(
    response: &SamlResponse,
    assertion: Option<&Assertion>,
    context: &ValidationContext<'_>,
) -> Vec<ValidationError> {
    if assertion.is_some() {
        return Vec::new();
    }
    match (&response.in_response_to, context.stored_state) {
        (Some(in_response_to), Some(state)) if &state.message_id == in_response_to => Vec::new(),
        (Some(in_response_to), Some(state)) => vec![ValidationError::Correlation(format!(
            "InResponseTo {in_response_to} does not match stored request {}",
            state.message_id
        ))],
        (Some(in_response_to), None) => vec![ValidationError::Correlation(format!(
            "InResponseTo {in_response_to} does not match any outstanding request"
        ))],
        (None, _) if !context.parameters.allow_unsolicited => vec![ValidationError::Correlation(
            "unsolicited responses are not accepted".into(),
        )],
        (None, _) => Vec::new(),
    }
}

/// The request being answered must have been sent to the IdP that answers.
fn requested_idp_step(
    response: &SamlResponse,
    assertion: Option<&Assertion>,
    context: &ValidationContext<'_>,
) -> Vec<ValidationError> {
    let Some(state) = context.stored_state else {
        return Vec::new();
    };
    let issuer = match assertion {
        None => response.issuer.as_ref(),
        Some(assertion) => Some(&assertion.issuer),
    };
    match issuer {
        Some(issuer) if issuer.value != state.idp_entity_id => {
            vec![ValidationError::Correlation(format!(
                "request {} was sent to {}, but {} answered",
                state.message_id, state.idp_entity_id, issuer.value
            ))]
        }
        _ => Vec::new(),
    }
}

pub struct SamlResponseValidator {
    steps: Vec<Box<dyn ValidationStep>>,
}

impl Default for SamlResponseValidator {
    fn default() -> Self {
        SamlResponseValidator::empty()
            .with_step(status_step)
            .with_step(issuer_step)
            .with_step(signature_step)
            .with_step(time_window_step)
            .with_step(audience_step)
            .with_step(subject_confirmation_step)
            .with_step(correlation_step)
            .with_step(requested_idp_step)
    }
}

impl fmt::Debug for SamlResponseValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamlResponseValidator")
            .field("steps", &self.steps.len())
            .finish()
    }
}

impl SamlResponseValidator {
    /// The standard checks, in order: status, issuer, signature trust,
    /// time window, audience, subject confirmation, correlation and the
    /// IdP the correlated request was sent to.
    pub fn new() -> Self {
        Self::default()
    }

    /// A validator without any steps.
    pub fn empty() -> Self {
        SamlResponseValidator { steps: Vec::new() }
    }

    /// Appends a step that runs after the existing ones.
    pub fn with_step(mut self, step: impl ValidationStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Every problem found, in step order.
    pub fn errors(
        &self,
        response: &SamlResponse,
        context: &ValidationContext<'_>,
    ) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for step in &self.steps {
            errors.extend(step.validate(response, None, context));
            for assertion in &response.assertions {
                errors.extend(step.validate(response, Some(assertion), context));
            }
        }
        errors
    }

    pub fn validate(
        &self,
        response: &SamlResponse,
        context: &ValidationContext<'_>,
    ) -> SamlResult<()> {
        let errors = self.errors(response, context);
        if errors.is_empty() {
            return Ok(());
        }
        for error in &errors {
            warn!(response = %response.id, %error, "response validation failed");
        }
        Err(SamlError::Validation(errors))
    }
}
