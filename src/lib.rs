pub mod assertion;
pub mod authn_request;
pub mod binding;
pub mod c14n;
pub mod command_result;
pub mod error;
pub mod handler;
pub mod idp_metadata;
pub mod options;
pub mod reader;
pub mod request_state;
pub mod response;
pub mod signature;
pub mod sp_metadata;
pub mod traverser;
pub mod validation;
pub mod xml;

mod utils;

#[cfg(test)]
mod test_support;

pub use assertion::{
    Assertion, AuthnStatement, Conditions, NameId, SamlAttribute, Subject, SubjectConfirmation,
    SubjectConfirmationData,
};
pub use authn_request::{AuthnRequest, AuthnRequestBuilder, NameIdPolicy, ProtocolBinding};
pub use binding::{HttpPostBinding, HttpRedirectBinding, InboundMessage, MessageName, PostForm};
pub use command_result::{AdapterAction, CommandResult, CookieDirective, Principal, PrimaryEffect};
pub use error::{SamlError, SamlResult, Severity, ValidationError, XmlError};
pub use handler::{HttpRequestData, Saml2Handler};
pub use idp_metadata::{parse_idp_metadata, IdpMetadata};
pub use options::{IdentityProvider, Saml2Options};
pub use reader::SamlXmlReader;
pub use request_state::{RequestStateProtector, RequestStateStore, StoredRequestState};
pub use response::{SamlResponse, Status};
pub use signature::{
    sign_enveloped, DetachedSignature, DigestAlgorithm, SignatureAlgorithm, SignatureVerifier,
    SigningCredential, SigningKey, VerifiedSignature,
};
pub use sp_metadata::SpMetadataBuilder;
pub use validation::{
    validate_issuer, SamlResponseValidationParameters, SamlResponseValidator, SignaturePolicy,
    ValidationContext, ValidationStep,
};

use time::format_description::well_known::iso8601::{self, TimePrecision};

pub const SAMLP_NAMESPACE: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const SAML_NAMESPACE: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const METADATA_NAMESPACE: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
pub const DSIG_NAMESPACE: &str = "http://www.w3.org/2000/09/xmldsig#";

pub const NAME_ID_FORMAT_EMAIL_ADDRESS: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";
pub const NAME_ID_FORMAT_ENTITY: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:entity";
pub const NAME_ID_FORMAT_TRANSIENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:transient";

pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const CONFIRMATION_METHOD_BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

// xs:dateTime isn't actually ISO8601, because implementors often don't support higher precisions.
pub const DATE_TIME_FORMAT: iso8601::Iso8601<
    {
        iso8601::Config::DEFAULT
            .set_time_precision(TimePrecision::Second {
                decimal_digits: None,
            })
            .encode()
    },
> = iso8601::Iso8601;
