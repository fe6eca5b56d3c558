//! HTTP-Redirect and HTTP-POST binding codecs.
//!
//! Both codecs are pure functions over strings. Decoding works on untrusted
//! network input and reports every failure as [`SamlError::Binding`].

use std::io::Read;

use base64::{prelude::BASE64_STANDARD, Engine};
use deflate::deflate_bytes;
use flate2::read::DeflateDecoder;
use quick_xml::escape::escape;
use tracing::debug;

use crate::{
    authn_request::ProtocolBinding,
    error::{SamlError, SamlResult},
    signature::{DetachedSignature, SignatureVerifier, SigningCredential},
    utils::decode_xml_base64,
    xml::XmlDocument,
};

/// Upper bound for a decoded message, inflated or not.
const MAX_MESSAGE_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageName {
    SamlRequest,
    SamlResponse,
}

impl MessageName {
    pub const fn param(&self) -> &'static str {
        match self {
            MessageName::SamlRequest => "SAMLRequest",
            MessageName::SamlResponse => "SAMLResponse",
        }
    }

    fn from_param(name: &str) -> Option<Self> {
        [MessageName::SamlRequest, MessageName::SamlResponse]
            .into_iter()
            .find(|candidate| candidate.param().eq_ignore_ascii_case(name))
    }
}

/// A message taken off the wire, checked to be well-formed XML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub name: MessageName,
    pub xml: String,
    pub relay_state: Option<String>,
    pub binding: ProtocolBinding,
    /// A redirect query signature that validated against a trusted key.
    pub query_signature: Option<DetachedSignature>,
}

fn binding_error(message: impl Into<String>) -> SamlError {
    SamlError::Binding(message.into())
}

fn checked_xml(bytes: Vec<u8>) -> SamlResult<String> {
    let xml = String::from_utf8(bytes)
        .map_err(|e| binding_error(format!("message is not UTF-8: {e}")))?;
    XmlDocument::parse(&xml)
        .map_err(|e| binding_error(format!("message is not well-formed XML: {e}")))?;
    Ok(xml)
}

fn inflate(data: &[u8]) -> SamlResult<Vec<u8>> {
    let mut inflated = Vec::new();
    DeflateDecoder::new(data)
        .take(MAX_MESSAGE_SIZE + 1)
        .read_to_end(&mut inflated)
        .map_err(|e| binding_error(format!("decompression failed: {e}")))?;
    if inflated.len() as u64 > MAX_MESSAGE_SIZE {
        return Err(binding_error("inflated message exceeds the size limit"));
    }
    Ok(inflated)
}

/// Percent-decodes a query value. `+` means space only in free-text values;
/// inside base64 it is the literal alphabet character.
fn query_decode(value: &str, plus_is_space: bool) -> SamlResult<String> {
    let value = if plus_is_space {
        value.replace('+', " ")
    } else {
        value.to_string()
    };
    urlencoding::decode(&value)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| binding_error(format!("invalid URL encoding: {e}")))
}

pub struct HttpRedirectBinding;

impl HttpRedirectBinding {
    /// Builds the redirect location carrying `xml`.
    ///
    /// With a credential the query string is signed: the signature covers
    /// `SAMLRequest=..&RelayState=..&SigAlg=..` exactly as URL-encoded.
    pub fn bind(
        xml: &str,
        name: MessageName,
        destination: &str,
        relay_state: Option<&str>,
        credential: Option<&SigningCredential>,
    ) -> SamlResult<String> {
        let encoded = BASE64_STANDARD.encode(deflate_bytes(xml.as_bytes()));
        let mut query = format!("{}={}", name.param(), urlencoding::encode(&encoded));
        if let Some(relay_state) = relay_state {
            query.push_str(&format!("&RelayState={}", urlencoding::encode(relay_state)));
        }
        if let Some(credential) = credential {
            let algorithm = credential.signature_algorithm().uri();
            query.push_str(&format!("&SigAlg={}", urlencoding::encode(algorithm)));
            let signature = BASE64_STANDARD.encode(credential.sign(query.as_bytes())?);
            query.push_str(&format!("&Signature={}", urlencoding::encode(&signature)));
        }

        let separator = if destination.contains('?') { '&' } else { '?' };
        Ok(format!("{destination}{separator}{query}"))
    }

    /// Decodes the message carried by a redirect URL or bare query string.
    ///
    /// A query signature is verified when a verifier is supplied; without one
    /// it is ignored and the message counts as unsigned.
    pub fn unbind(
        url_or_query: &str,
        verifier: Option<&SignatureVerifier<'_>>,
    ) -> SamlResult<InboundMessage> {
        let query = match url_or_query.split_once('?') {
            Some((_, query)) => query,
            None => url_or_query,
        };
        let query = query.split('#').next().unwrap_or_default();

        let mut message = None;
        let mut relay_state = None;
        let mut sig_alg = None;
        let mut signature = None;
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if let Some(name) = MessageName::from_param(key) {
                if message.replace((name, key, value)).is_some() {
                    return Err(binding_error("more than one SAML message in query"));
                }
            } else {
                match key {
                    "RelayState" => relay_state = Some((key, value)),
                    "SigAlg" => sig_alg = Some((key, value)),
                    "Signature" => signature = Some(value),
                    _ => {}
                }
            }
        }
        let (name, raw_key, raw_message) =
            message.ok_or_else(|| binding_error("no SAMLRequest or SAMLResponse parameter"))?;

        let compressed = decode_xml_base64(&query_decode(raw_message, false)?)
            .map_err(|e| binding_error(format!("invalid base64: {e}")))?;
        let xml = checked_xml(inflate(&compressed)?)?;

        let query_signature = match (signature, verifier) {
            (Some(signature), Some(verifier)) => {
                let (_, raw_alg) =
                    sig_alg.ok_or_else(|| binding_error("Signature without SigAlg"))?;
                let mut signed = format!("{raw_key}={raw_message}");
                if let Some((key, value)) = relay_state {
                    signed.push_str(&format!("&{key}={value}"));
                }
                signed.push_str(&format!("&SigAlg={raw_alg}"));
                let signature = decode_xml_base64(&query_decode(signature, false)?)
                    .map_err(|e| binding_error(format!("invalid signature encoding: {e}")))?;
                Some(verifier.verify_detached(
                    signed.as_bytes(),
                    &query_decode(raw_alg, true)?,
                    &signature,
                )?)
            }
            _ => None,
        };

        let relay_state = relay_state
            .map(|(_, value)| query_decode(value, true))
            .transpose()?;
        debug!(
            message = name.param(),
            signed = query_signature.is_some(),
            "unbound redirect message"
        );
        Ok(InboundMessage {
            name,
            xml,
            relay_state,
            binding: ProtocolBinding::Redirect,
            query_signature,
        })
    }
}

/// An auto-submitting form for the HTTP-POST binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostForm {
    pub action: String,
    /// Form fields in submission order.
    pub fields: Vec<(String, String)>,
}

impl PostForm {
    pub fn to_html(&self) -> String {
        let inputs: String = self
            .fields
            .iter()
            .map(|(name, value)| {
                format!(
                    r#"<input type="hidden" name="{}" value="{}"/>"#,
                    escape(name),
                    escape(value)
                )
            })
            .collect();
        format!(
            concat!(
                r#"<!DOCTYPE html><html><head><meta charset="utf-8"/></head>"#,
                r#"<body onload="document.forms[0].submit()">"#,
                r#"<form method="post" action="{}">{}"#,
                r#"<noscript><input type="submit" value="Continue"/></noscript>"#,
                r#"</form></body></html>"#
            ),
            escape(&self.action),
            inputs
        )
    }
}

pub struct HttpPostBinding;

impl HttpPostBinding {
    pub fn bind(
        xml: &str,
        name: MessageName,
        destination: &str,
        relay_state: Option<&str>,
    ) -> PostForm {
        let mut fields = vec![(name.param().to_string(), BASE64_STANDARD.encode(xml))];
        if let Some(relay_state) = relay_state {
            fields.push(("RelayState".to_string(), relay_state.to_string()));
        }
        PostForm {
            action: destination.to_string(),
            fields,
        }
    }

    /// Decodes the message from already form-decoded POST fields.
    pub fn unbind<'a>(
        fields: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> SamlResult<InboundMessage> {
        let mut message = None;
        let mut relay_state = None;
        for (key, value) in fields {
            if let Some(name) = MessageName::from_param(key) {
                if message.replace((name, value)).is_some() {
                    return Err(binding_error("more than one SAML message in form"));
                }
            } else if key == "RelayState" {
                relay_state = Some(value.to_string());
            }
        }
        let (name, encoded) =
            message.ok_or_else(|| binding_error("no SAMLRequest or SAMLResponse field"))?;
        if encoded.len() as u64 > MAX_MESSAGE_SIZE * 4 / 3 + 4 {
            return Err(binding_error("posted message exceeds the size limit"));
        }
        let decoded =
            decode_xml_base64(encoded).map_err(|e| binding_error(format!("invalid base64: {e}")))?;
        let xml = checked_xml(decoded)?;
        debug!(message = name.param(), "unbound POST message");
        Ok(InboundMessage {
            name,
            xml,
            relay_state,
            binding: ProtocolBinding::Post,
            query_signature: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        signature::{algorithms, DigestAlgorithm, SignatureAlgorithm},
        test_support::{idp_credential, idp_signing_key, other_credential},
    };

    const XML: &str = r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_r1">text &amp; more</samlp:AuthnRequest>"#;

    #[test]
    fn redirect_round_trip() {
        let location = HttpRedirectBinding::bind(
            XML,
            MessageName::SamlRequest,
            "https://idp.example.com/sso",
            Some("state 1+2&3"),
            None,
        )
        .unwrap();
        assert!(location.starts_with("https://idp.example.com/sso?SAMLRequest="));

        let message = HttpRedirectBinding::unbind(&location, None).unwrap();
        assert_eq!(message.name, MessageName::SamlRequest);
        assert_eq!(message.xml, XML);
        assert_eq!(message.relay_state.as_deref(), Some("state 1+2&3"));
        assert_eq!(message.binding, ProtocolBinding::Redirect);
        assert!(message.query_signature.is_none());
    }

    #[test]
    fn redirect_keeps_existing_query() {
        let location = HttpRedirectBinding::bind(
            XML,
            MessageName::SamlRequest,
            "https://idp.example.com/sso?tenant=a",
            None,
            None,
        )
        .unwrap();
        assert!(location.starts_with("https://idp.example.com/sso?tenant=a&SAMLRequest="));
        assert_eq!(HttpRedirectBinding::unbind(&location, None).unwrap().xml, XML);
    }

    #[test]
    fn signed_redirect_query() {
        let credential = idp_credential().algorithm(SignatureAlgorithm::RsaSha256);
        let location = HttpRedirectBinding::bind(
            XML,
            MessageName::SamlRequest,
            "https://idp.example.com/sso",
            Some("relay"),
            Some(&credential),
        )
        .unwrap();
        let sig_alg = format!("SigAlg={}", urlencoding::encode(algorithms::RSA_SHA256));
        assert!(location.contains(&sig_alg));

        let keys = [idp_signing_key()];
        let verifier = SignatureVerifier::new(&keys, &DigestAlgorithm::DEFAULT_ALLOWED);
        let message = HttpRedirectBinding::unbind(&location, Some(&verifier)).unwrap();
        assert_eq!(
            message.query_signature.map(|signature| signature.key_fingerprint).as_deref(),
            Some(keys[0].fingerprint())
        );

        let tampered = location.replace("RelayState=relay", "RelayState=other");
        assert!(matches!(
            HttpRedirectBinding::unbind(&tampered, Some(&verifier)),
            Err(SamlError::Signature(_))
        ));

        let foreign = HttpRedirectBinding::bind(
            XML,
            MessageName::SamlRequest,
            "https://idp.example.com/sso",
            None,
            Some(&other_credential()),
        )
        .unwrap();
        assert!(HttpRedirectBinding::unbind(&foreign, Some(&verifier)).is_err());
    }

    #[test]
    fn redirect_decoding_failures_are_binding_errors() {
        for query in [
            "RelayState=x",
            "SAMLRequest=!!!not-base64",
            // valid base64, not deflate
            "SAMLRequest=aGVsbG8gd29ybGQ%3D",
        ] {
            assert!(
                matches!(HttpRedirectBinding::unbind(query, None), Err(SamlError::Binding(_))),
                "{query}"
            );
        }

        let not_xml = BASE64_STANDARD.encode(deflate_bytes(b"<unclosed>"));
        let query = format!("SAMLResponse={}", urlencoding::encode(&not_xml));
        let err = HttpRedirectBinding::unbind(&query, None).unwrap_err();
        assert!(err.to_string().contains("well-formed"), "{err}");
    }

    #[test]
    fn post_round_trip() {
        let form = HttpPostBinding::bind(
            XML,
            MessageName::SamlResponse,
            "https://sp.example.com:8888/Saml2/Acs",
            Some("relay"),
        );
        assert_eq!(form.fields[0].0, "SAMLResponse");
        assert_eq!(form.fields[0].1, BASE64_STANDARD.encode(XML));

        let fields = form.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()));
        let message = HttpPostBinding::unbind(fields).unwrap();
        assert_eq!(message.xml, XML);
        assert_eq!(message.relay_state.as_deref(), Some("relay"));
        assert_eq!(message.binding, ProtocolBinding::Post);
    }

    #[test]
    fn post_form_is_escaped() {
        let form = HttpPostBinding::bind(
            XML,
            MessageName::SamlResponse,
            "https://sp/acs?a=1&b=2",
            Some("\"><script>"),
        );
        let html = form.to_html();
        assert!(html.contains(r#"action="https://sp/acs?a=1&amp;b=2""#));
        assert!(html.contains("&quot;&gt;&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn post_decoding_failures_are_binding_errors() {
        assert!(matches!(
            HttpPostBinding::unbind([("RelayState", "x")]),
            Err(SamlError::Binding(_))
        ));
        assert!(matches!(
            HttpPostBinding::unbind([("SAMLResponse", "%%%")]),
            Err(SamlError::Binding(_))
        ));
        let not_xml = BASE64_STANDARD.encode("plain text");
        assert!(matches!(
            HttpPostBinding::unbind([("SAMLResponse", not_xml.as_str())]),
            Err(SamlError::Binding(_))
        ));
    }
}
