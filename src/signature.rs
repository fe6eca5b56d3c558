//! XML digital signatures.
//!
//! Verification only ever accepts an enveloped signature whose single
//! reference points at the very element being processed, and refuses
//! documents where that element's ID is not unique. Anything else is treated
//! as a possible signature-wrapping attempt.

use std::fmt;

use base64::{prelude::BASE64_STANDARD, Engine};
use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs1v15,
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey},
    signature::{SignatureEncoding, Signer, Verifier},
    RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::debug;

use crate::{
    c14n::{canonicalize, CanonicalizationMethod},
    error::{SamlError, SamlResult},
    utils::decode_xml_base64,
    xml::{Element, XmlDocument},
    DSIG_NAMESPACE, SAML_NAMESPACE,
};

pub mod algorithms {
    pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
    pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
    pub const RSA_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384";
    pub const RSA_SHA512: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512";
    pub const SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
    pub const SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#sha384";
    pub const SHA512: &str = "http://www.w3.org/2001/04/xmlenc#sha512";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    /// The allow-list used when none is configured.
    pub const DEFAULT_ALLOWED: [DigestAlgorithm; 3] = [Self::Sha256, Self::Sha384, Self::Sha512];

    pub const fn uri(&self) -> &'static str {
        match self {
            Self::Sha256 => algorithms::SHA256,
            Self::Sha384 => algorithms::SHA384,
            Self::Sha512 => algorithms::SHA512,
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            algorithms::SHA256 => Some(Self::Sha256),
            algorithms::SHA384 => Some(Self::Sha384),
            algorithms::SHA512 => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SignatureAlgorithm {
    #[default]
    RsaSha256,
    RsaSha384,
    RsaSha512,
}

impl SignatureAlgorithm {
    pub const ALL: [SignatureAlgorithm; 3] = [Self::RsaSha256, Self::RsaSha384, Self::RsaSha512];

    pub const fn uri(&self) -> &'static str {
        match self {
            Self::RsaSha256 => algorithms::RSA_SHA256,
            Self::RsaSha384 => algorithms::RSA_SHA384,
            Self::RsaSha512 => algorithms::RSA_SHA512,
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            algorithms::RSA_SHA256 => Some(Self::RsaSha256),
            algorithms::RSA_SHA384 => Some(Self::RsaSha384),
            algorithms::RSA_SHA512 => Some(Self::RsaSha512),
            _ => None,
        }
    }

    pub const fn digest_algorithm(&self) -> DigestAlgorithm {
        match self {
            Self::RsaSha256 => DigestAlgorithm::Sha256,
            Self::RsaSha384 => DigestAlgorithm::Sha384,
            Self::RsaSha512 => DigestAlgorithm::Sha512,
        }
    }
}

/// A public key trusted to sign messages, scoped to a set of algorithms.
#[derive(Clone)]
pub struct SigningKey {
    public_key: RsaPublicKey,
    fingerprint: String,
    algorithms: Vec<SignatureAlgorithm>,
}

fn certificate_der_from_pem(pem: &str) -> SamlResult<Vec<u8>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| SamlError::Crypto(format!("invalid certificate PEM: {e}")))?;
    if pem.label != "CERTIFICATE" {
        return Err(SamlError::Crypto(format!(
            "expected a CERTIFICATE PEM block, found {}",
            pem.label
        )));
    }
    Ok(pem.contents)
}

impl SigningKey {
    /// Trusts `public_key` for every supported algorithm.
    pub fn from_public_key(public_key: RsaPublicKey) -> SamlResult<Self> {
        let spki = public_key
            .to_public_key_der()
            .map_err(|e| SamlError::Crypto(format!("cannot encode public key: {e}")))?;
        Ok(SigningKey {
            fingerprint: hex::encode(Sha256::digest(spki.as_bytes())),
            public_key,
            algorithms: SignatureAlgorithm::ALL.to_vec(),
        })
    }

    pub fn from_certificate_der(der: &[u8]) -> SamlResult<Self> {
        let (_, certificate) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| SamlError::Crypto(format!("cannot parse certificate: {e}")))?;
        let public_key = RsaPublicKey::from_public_key_der(certificate.public_key().raw)
            .map_err(|e| SamlError::Crypto(format!("certificate does not hold an RSA key: {e}")))?;
        Self::from_public_key(public_key)
    }

    pub fn from_certificate_pem(pem: &str) -> SamlResult<Self> {
        Self::from_certificate_der(&certificate_der_from_pem(pem)?)
    }

    /// Restricts the algorithms this key is trusted for.
    pub fn with_algorithms(self, algorithms: impl IntoIterator<Item = SignatureAlgorithm>) -> Self {
        SigningKey {
            algorithms: algorithms.into_iter().collect(),
            ..self
        }
    }

    /// Hex SHA-256 of the key's SubjectPublicKeyInfo.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn trusts(&self, algorithm: SignatureAlgorithm) -> bool {
        self.algorithms.contains(&algorithm)
    }

    fn verify(&self, algorithm: SignatureAlgorithm, data: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = pkcs1v15::Signature::try_from(signature) else {
            return false;
        };
        let key = self.public_key.clone();
        match algorithm {
            SignatureAlgorithm::RsaSha256 => pkcs1v15::VerifyingKey::<Sha256>::new(key)
                .verify(data, &signature)
                .is_ok(),
            SignatureAlgorithm::RsaSha384 => pkcs1v15::VerifyingKey::<Sha384>::new(key)
                .verify(data, &signature)
                .is_ok(),
            SignatureAlgorithm::RsaSha512 => pkcs1v15::VerifyingKey::<Sha512>::new(key)
                .verify(data, &signature)
                .is_ok(),
        }
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("fingerprint", &self.fingerprint)
            .field("algorithms", &self.algorithms)
            .finish()
    }
}

/// A private key the service provider signs with.
#[derive(Clone)]
pub struct SigningCredential {
    private_key: RsaPrivateKey,
    algorithm: SignatureAlgorithm,
    certificate_der: Option<Vec<u8>>,
}

impl SigningCredential {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        SigningCredential {
            private_key,
            algorithm: SignatureAlgorithm::default(),
            certificate_der: None,
        }
    }

    /// Loads a PKCS#8 (`PRIVATE KEY`) or PKCS#1 (`RSA PRIVATE KEY`) PEM key.
    pub fn from_pem(pem: &str) -> SamlResult<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| SamlError::Crypto(format!("invalid private key PEM: {e}")))?;
        Ok(Self::new(private_key))
    }

    pub fn algorithm(self, algorithm: SignatureAlgorithm) -> Self {
        SigningCredential { algorithm, ..self }
    }

    /// Certificate published in `<ds:KeyInfo>` of produced signatures.
    pub fn certificate_pem(self, pem: &str) -> SamlResult<Self> {
        Ok(SigningCredential {
            certificate_der: Some(certificate_der_from_pem(pem)?),
            ..self
        })
    }

    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    pub fn certificate_der(&self) -> Option<&[u8]> {
        self.certificate_der.as_deref()
    }

    /// The matching public key, e.g. for publishing in metadata or for tests.
    pub fn signing_key(&self) -> SamlResult<SigningKey> {
        SigningKey::from_public_key(self.private_key.to_public_key())
    }

    pub fn sign(&self, data: &[u8]) -> SamlResult<Vec<u8>> {
        let key = self.private_key.clone();
        let signature = match self.algorithm {
            SignatureAlgorithm::RsaSha256 => pkcs1v15::SigningKey::<Sha256>::new(key)
                .try_sign(data)
                .map(|s| s.to_vec()),
            SignatureAlgorithm::RsaSha384 => pkcs1v15::SigningKey::<Sha384>::new(key)
                .try_sign(data)
                .map(|s| s.to_vec()),
            SignatureAlgorithm::RsaSha512 => pkcs1v15::SigningKey::<Sha512>::new(key)
                .try_sign(data)
                .map(|s| s.to_vec()),
        };
        signature.map_err(|e| SamlError::Crypto(format!("signing failed: {e}")))
    }
}

impl fmt::Debug for SigningCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredential")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// What a successful verification established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    pub reference_id: String,
    pub signature_algorithm: SignatureAlgorithm,
    pub digest_algorithm: DigestAlgorithm,
    pub key_fingerprint: String,
}

/// A verified signature over a redirect query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedSignature {
    pub signature_algorithm: SignatureAlgorithm,
    pub key_fingerprint: String,
}

impl DetachedSignature {
    /// The trust this signature gives the message with ID `id`, the same an
    /// enveloped signature on it would.
    pub fn covering(&self, id: &str) -> VerifiedSignature {
        VerifiedSignature {
            reference_id: id.to_string(),
            signature_algorithm: self.signature_algorithm,
            digest_algorithm: self.signature_algorithm.digest_algorithm(),
            key_fingerprint: self.key_fingerprint.clone(),
        }
    }
}

fn signature_error(message: impl Into<String>) -> SamlError {
    SamlError::Signature(message.into())
}

fn single_child<'d>(parent: Element<'d>, local_name: &str) -> SamlResult<Element<'d>> {
    let mut matches = parent
        .child_elements()
        .filter(|child| child.is(DSIG_NAMESPACE, local_name));
    match (matches.next(), matches.next()) {
        (Some(child), None) => Ok(child),
        (None, _) => Err(signature_error(format!("missing {local_name} element"))),
        (Some(_), Some(_)) => Err(signature_error(format!("more than one {local_name} element"))),
    }
}

fn algorithm_attribute<'d>(element: Element<'d>) -> SamlResult<&'d str> {
    element.attribute("Algorithm").ok_or_else(|| {
        signature_error(format!("{} has no Algorithm attribute", element.local_name()))
    })
}

fn inclusive_prefixes(method: Element<'_>) -> Vec<String> {
    method
        .child_elements()
        .find(|child| child.local_name() == "InclusiveNamespaces")
        .and_then(|child| child.attribute("PrefixList"))
        .map(|list| list.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Rejects documents where `id` names more than one element.
fn ensure_unique_id(document: &XmlDocument, id: &str) -> SamlResult<()> {
    let count = document
        .root()
        .descendants()
        .into_iter()
        .filter(|element| {
            ["ID", "Id", "AssertionID"]
                .iter()
                .any(|name| element.attribute(name) == Some(id))
        })
        .count();
    if count > 1 {
        return Err(signature_error(format!("ID '{id}' is used by {count} elements")));
    }
    Ok(())
}

/// Checks signatures against a set of trusted keys and allowed algorithms.
///
/// Holds no mutable state; one instance can serve concurrent calls.
#[derive(Debug, Clone, Copy)]
pub struct SignatureVerifier<'k> {
    trusted_keys: &'k [SigningKey],
    allowed_hash_algorithms: &'k [DigestAlgorithm],
}

impl<'k> SignatureVerifier<'k> {
    pub fn new(
        trusted_keys: &'k [SigningKey],
        allowed_hash_algorithms: &'k [DigestAlgorithm],
    ) -> Self {
        SignatureVerifier {
            trusted_keys,
            allowed_hash_algorithms,
        }
    }

    fn check_allowed(&self, digest: DigestAlgorithm) -> SamlResult<()> {
        if self.allowed_hash_algorithms.contains(&digest) {
            Ok(())
        } else {
            Err(signature_error(format!(
                "hash algorithm {} is not allowed",
                digest.uri()
            )))
        }
    }

    fn verify_with_trusted_keys(
        &self,
        algorithm: SignatureAlgorithm,
        data: &[u8],
        signature: &[u8],
    ) -> SamlResult<&'k SigningKey> {
        self.trusted_keys
            .iter()
            .filter(|key| key.trusts(algorithm))
            .find(|key| key.verify(algorithm, data, signature))
            .ok_or_else(|| signature_error("no trusted signing key validates the signature"))
    }

    /// Verifies the enveloped signature that is a direct child of `element`.
    ///
    /// Returns `Ok(None)` when the element carries no signature, or when no
    /// trusted keys are configured so nothing can be established about it.
    /// Whether an unsigned element is acceptable is the caller's policy.
    pub fn verify_enveloped(&self, element: Element<'_>) -> SamlResult<Option<VerifiedSignature>> {
        let mut signatures = element
            .child_elements()
            .filter(|child| child.is(DSIG_NAMESPACE, "Signature"));
        let Some(signature) = signatures.next() else {
            return Ok(None);
        };
        if signatures.next().is_some() {
            return Err(signature_error(format!(
                "{} carries more than one Signature",
                element.local_name()
            )));
        }
        if self.trusted_keys.is_empty() {
            debug!(
                element = element.local_name(),
                "signature present but no trusted keys configured, leaving it unverified"
            );
            return Ok(None);
        }

        let id = element.attribute("ID").ok_or_else(|| {
            signature_error(format!("signed {} has no ID attribute", element.local_name()))
        })?;
        ensure_unique_id(element.document(), id)?;

        let signed_info = single_child(signature, "SignedInfo")?;
        let c14n_element = single_child(signed_info, "CanonicalizationMethod")?;
        let c14n_uri = algorithm_attribute(c14n_element)?;
        let c14n = CanonicalizationMethod::from_uri(c14n_uri).ok_or_else(|| {
            signature_error(format!("unsupported canonicalization algorithm {c14n_uri}"))
        })?;

        let method_uri = algorithm_attribute(single_child(signed_info, "SignatureMethod")?)?;
        let signature_algorithm = SignatureAlgorithm::from_uri(method_uri).ok_or_else(|| {
            signature_error(format!("signature algorithm {method_uri} is not allowed"))
        })?;
        self.check_allowed(signature_algorithm.digest_algorithm())?;

        let reference = single_child(signed_info, "Reference")?;
        let reference_uri = reference.attribute("URI").unwrap_or_default();
        if reference_uri.strip_prefix('#') != Some(id) {
            return Err(signature_error(format!(
                "reference '{reference_uri}' does not point at the signed element '{id}'"
            )));
        }

        let mut enveloped = false;
        let mut transform_c14n = None;
        if let Some(transforms) = reference
            .child_elements()
            .find(|child| child.is(DSIG_NAMESPACE, "Transforms"))
        {
            let transforms: Vec<_> = transforms.child_elements().collect();
            if transforms.len() > 2 {
                return Err(signature_error("too many transforms"));
            }
            for transform in transforms {
                let uri = algorithm_attribute(transform)?;
                if uri == algorithms::ENVELOPED_SIGNATURE {
                    enveloped = true;
                } else if let Some(method) = CanonicalizationMethod::from_uri(uri) {
                    transform_c14n = Some((method, inclusive_prefixes(transform)));
                } else {
                    return Err(signature_error(format!("unsupported transform {uri}")));
                }
            }
        }

        let digest_uri = algorithm_attribute(single_child(reference, "DigestMethod")?)?;
        let digest_algorithm = DigestAlgorithm::from_uri(digest_uri)
            .ok_or_else(|| signature_error(format!("hash algorithm {digest_uri} is not allowed")))?;
        self.check_allowed(digest_algorithm)?;

        let expected_digest = decode_xml_base64(&single_child(reference, "DigestValue")?.text())
            .map_err(|e| signature_error(format!("invalid DigestValue: {e}")))?;
        let (method, prefixes) =
            transform_c14n.unwrap_or((CanonicalizationMethod::C14N, Vec::new()));
        let signed_content =
            canonicalize(element, method, &prefixes, enveloped.then_some(signature));
        let computed_digest = digest_algorithm.digest(signed_content.as_bytes());
        if computed_digest != expected_digest {
            return Err(signature_error(format!(
                "digest mismatch for reference '{reference_uri}' (computed {})",
                hex::encode(&computed_digest)
            )));
        }

        let signature_value =
            decode_xml_base64(&single_child(signature, "SignatureValue")?.text())
                .map_err(|e| signature_error(format!("invalid SignatureValue: {e}")))?;
        let canonical_signed_info =
            canonicalize(signed_info, c14n, &inclusive_prefixes(c14n_element), None);
        let key = self.verify_with_trusted_keys(
            signature_algorithm,
            canonical_signed_info.as_bytes(),
            &signature_value,
        )?;

        debug!(
            reference = id,
            key = key.fingerprint(),
            algorithm = signature_algorithm.uri(),
            "signature verified"
        );
        Ok(Some(VerifiedSignature {
            reference_id: id.to_string(),
            signature_algorithm,
            digest_algorithm,
            key_fingerprint: key.fingerprint().to_string(),
        }))
    }

    /// Verifies a signature computed over raw bytes, as used by the
    /// HTTP-Redirect binding. Returns the fingerprint of the validating key.
    pub fn verify_detached(
        &self,
        signed_data: &[u8],
        algorithm_uri: &str,
        signature: &[u8],
    ) -> SamlResult<DetachedSignature> {
        let algorithm = SignatureAlgorithm::from_uri(algorithm_uri).ok_or_else(|| {
            signature_error(format!("signature algorithm {algorithm_uri} is not allowed"))
        })?;
        self.check_allowed(algorithm.digest_algorithm())?;
        let key = self.verify_with_trusted_keys(algorithm, signed_data, signature)?;
        Ok(DetachedSignature {
            signature_algorithm: algorithm,
            key_fingerprint: key.fingerprint().to_string(),
        })
    }
}

/// Signs the element with the given ID, inserting an enveloped
/// `<ds:Signature>` right after its `<saml:Issuer>` (or as first child).
pub fn sign_enveloped(xml: &str, id: &str, credential: &SigningCredential) -> SamlResult<String> {
    let document = XmlDocument::parse(xml)?;
    ensure_unique_id(&document, id)?;
    let element = document
        .root()
        .descendants()
        .into_iter()
        .find(|element| element.attribute("ID") == Some(id))
        .ok_or_else(|| signature_error(format!("no element with ID '{id}'")))?;
    if element.content_start() == element.end() {
        return Err(signature_error("cannot sign an empty element"));
    }

    let method = CanonicalizationMethod::ExclusiveC14N;
    let algorithm = credential.signature_algorithm();
    let digest = algorithm
        .digest_algorithm()
        .digest(canonicalize(element, method, &[], None).as_bytes());

    let signed_info = format!(
        concat!(
            r#"<ds:SignedInfo xmlns:ds="{ds}">"#,
            r#"<ds:CanonicalizationMethod Algorithm="{c14n}"/>"#,
            r#"<ds:SignatureMethod Algorithm="{signature}"/>"#,
            r##"<ds:Reference URI="#{id}">"##,
            r#"<ds:Transforms><ds:Transform Algorithm="{enveloped}"/><ds:Transform Algorithm="{c14n}"/></ds:Transforms>"#,
            r#"<ds:DigestMethod Algorithm="{digest_method}"/>"#,
            r#"<ds:DigestValue>{digest}</ds:DigestValue>"#,
            r#"</ds:Reference></ds:SignedInfo>"#
        ),
        ds = DSIG_NAMESPACE,
        c14n = method.uri(),
        signature = algorithm.uri(),
        id = quick_xml::escape::escape(id),
        enveloped = algorithms::ENVELOPED_SIGNATURE,
        digest_method = algorithm.digest_algorithm().uri(),
        digest = BASE64_STANDARD.encode(digest),
    );
    let signed_info_document = XmlDocument::parse(&signed_info)?;
    let signature_value = credential.sign(
        canonicalize(signed_info_document.root(), method, &[], None).as_bytes(),
    )?;

    let key_info = credential
        .certificate_der
        .as_ref()
        .map(|der| {
            format!(
                "<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>",
                BASE64_STANDARD.encode(der)
            )
        })
        .unwrap_or_default();
    let signature = format!(
        r#"<ds:Signature xmlns:ds="{DSIG_NAMESPACE}">{signed_info}<ds:SignatureValue>{}</ds:SignatureValue>{key_info}</ds:Signature>"#,
        BASE64_STANDARD.encode(signature_value)
    );

    let position = match element.child_elements().next() {
        Some(issuer) if issuer.is(SAML_NAMESPACE, "Issuer") => issuer.end(),
        _ => element.content_start(),
    };
    let mut signed = String::with_capacity(xml.len() + signature.len());
    signed.push_str(&xml[..position]);
    signed.push_str(&signature);
    signed.push_str(&xml[position..]);
    Ok(signed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{idp_credential, idp_signing_key, other_credential};

    const DOCUMENT: &str = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_r1"><saml:Issuer xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion">https://idp.example.com</saml:Issuer><samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status></samlp:Response>"#;

    fn verify(
        xml: &str,
        keys: &[SigningKey],
        allowed: &[DigestAlgorithm],
    ) -> SamlResult<Option<VerifiedSignature>> {
        let document = XmlDocument::parse(xml)?;
        SignatureVerifier::new(keys, allowed).verify_enveloped(document.root())
    }

    #[test]
    fn verifies_own_signature() {
        let signed = sign_enveloped(DOCUMENT, "_r1", &idp_credential()).unwrap();
        assert!(signed.contains("</saml:Issuer><ds:Signature"));

        let key = idp_signing_key();
        let verified = verify(&signed, &[key.clone()], &DigestAlgorithm::DEFAULT_ALLOWED)
            .unwrap()
            .unwrap();
        assert_eq!(verified.reference_id, "_r1");
        assert_eq!(verified.signature_algorithm, SignatureAlgorithm::RsaSha256);
        assert_eq!(verified.key_fingerprint, key.fingerprint());
    }

    #[test]
    fn tries_every_trusted_key() {
        let signed = sign_enveloped(DOCUMENT, "_r1", &idp_credential()).unwrap();
        let keys = [other_credential().signing_key().unwrap(), idp_signing_key()];
        assert!(verify(&signed, &keys, &DigestAlgorithm::DEFAULT_ALLOWED)
            .unwrap()
            .is_some());
    }

    #[test]
    fn rejects_modified_content() {
        let signed = sign_enveloped(DOCUMENT, "_r1", &idp_credential()).unwrap();
        let tampered = signed.replace("status:Success", "status:Requester");
        let err = verify(&tampered, &[idp_signing_key()], &DigestAlgorithm::DEFAULT_ALLOWED)
            .unwrap_err();
        assert!(err.to_string().contains("digest mismatch"), "{err}");
    }

    #[test]
    fn rejects_untrusted_key() {
        let signed = sign_enveloped(DOCUMENT, "_r1", &other_credential()).unwrap();
        let err = verify(&signed, &[idp_signing_key()], &DigestAlgorithm::DEFAULT_ALLOWED)
            .unwrap_err();
        assert!(matches!(err, SamlError::Signature(ref m) if m.contains("no trusted")));
    }

    #[test]
    fn rejects_hash_outside_allow_list() {
        let signed = sign_enveloped(DOCUMENT, "_r1", &idp_credential()).unwrap();
        let err = verify(&signed, &[idp_signing_key()], &[DigestAlgorithm::Sha512]).unwrap_err();
        assert!(err.to_string().contains("not allowed"), "{err}");
    }

    #[test]
    fn rejects_key_outside_its_algorithm_scope() {
        let signed = sign_enveloped(DOCUMENT, "_r1", &idp_credential()).unwrap();
        let key = idp_signing_key().with_algorithms([SignatureAlgorithm::RsaSha512]);
        assert!(verify(&signed, &[key], &DigestAlgorithm::DEFAULT_ALLOWED).is_err());
    }

    #[test]
    fn rejects_reference_to_another_element() {
        let signed = sign_enveloped(DOCUMENT, "_r1", &idp_credential()).unwrap();
        let moved = signed.replace(r##"URI="#_r1""##, r##"URI="#_other""##);
        let err = verify(&moved, &[idp_signing_key()], &DigestAlgorithm::DEFAULT_ALLOWED)
            .unwrap_err();
        assert!(err.to_string().contains("does not point at"), "{err}");
    }

    #[test]
    fn rejects_duplicate_ids() {
        let signed = sign_enveloped(DOCUMENT, "_r1", &idp_credential()).unwrap();
        let wrapped = signed.replace(
            "<samlp:Status>",
            r#"<samlp:Extensions><x ID="_r1"/></samlp:Extensions><samlp:Status>"#,
        );
        let err = verify(&wrapped, &[idp_signing_key()], &DigestAlgorithm::DEFAULT_ALLOWED)
            .unwrap_err();
        assert!(err.to_string().contains("used by 2 elements"), "{err}");
    }

    #[test]
    fn unsigned_or_unconfigured_yields_nothing() {
        assert!(verify(DOCUMENT, &[idp_signing_key()], &DigestAlgorithm::DEFAULT_ALLOWED)
            .unwrap()
            .is_none());
        let signed = sign_enveloped(DOCUMENT, "_r1", &idp_credential()).unwrap();
        assert!(verify(&signed, &[], &DigestAlgorithm::DEFAULT_ALLOWED)
            .unwrap()
            .is_none());
    }

    #[test]
    fn detached_signatures() {
        let credential = idp_credential().algorithm(SignatureAlgorithm::RsaSha512);
        let data = b"SAMLRequest=abc&SigAlg=x";
        let signature = credential.sign(data).unwrap();
        let keys = [idp_signing_key()];
        let verifier = SignatureVerifier::new(&keys, &DigestAlgorithm::DEFAULT_ALLOWED);
        let verified = verifier
            .verify_detached(data, algorithms::RSA_SHA512, &signature)
            .unwrap();
        assert_eq!(verified.key_fingerprint, keys[0].fingerprint());
        let covering = verified.covering("_r1");
        assert_eq!(covering.reference_id, "_r1");
        assert_eq!(covering.digest_algorithm, DigestAlgorithm::Sha512);
        assert!(verifier
            .verify_detached(b"SAMLRequest=abd&SigAlg=x", algorithms::RSA_SHA512, &signature)
            .is_err());
        assert!(verifier
            .verify_detached(data, "http://www.w3.org/2000/09/xmldsig#rsa-sha1", &signature)
            .is_err());
    }

    #[test]
    fn certificate_and_private_key_agree() {
        assert_eq!(
            idp_credential().signing_key().unwrap().fingerprint(),
            idp_signing_key().fingerprint()
        );
        assert_ne!(
            other_credential().signing_key().unwrap().fingerprint(),
            idp_signing_key().fingerprint()
        );
    }

    #[test]
    fn verifies_response_signed_by_external_tooling() {
        let xml = include_str!("../static/external_signed_response.xml");
        let document = XmlDocument::parse(xml).unwrap();
        let keys = [idp_signing_key()];
        let verifier = SignatureVerifier::new(&keys, &DigestAlgorithm::DEFAULT_ALLOWED);

        let response = verifier.verify_enveloped(document.root()).unwrap().unwrap();
        assert_eq!(response.reference_id, "_ext-response-4b2e");
        assert_eq!(response.signature_algorithm, SignatureAlgorithm::RsaSha256);
        assert_eq!(response.key_fingerprint, keys[0].fingerprint());

        let assertion = document
            .root()
            .child_elements()
            .find(|child| child.is(SAML_NAMESPACE, "Assertion"))
            .unwrap();
        let verified = verifier.verify_enveloped(assertion).unwrap().unwrap();
        assert_eq!(verified.reference_id, "_ext-assertion-7d1c");

        let tampered = xml.replace("jane.doe@example.com", "john.doe@example.com");
        let document = XmlDocument::parse(&tampered).unwrap();
        assert!(matches!(
            verifier.verify_enveloped(document.root()),
            Err(SamlError::Signature(_))
        ));
    }

    #[test]
    fn certificate_pem_must_hold_a_certificate() {
        use crate::test_support::{IDP_CERT_PEM, IDP_KEY_PEM};
        assert!(SigningKey::from_certificate_pem(IDP_CERT_PEM).is_ok());
        assert!(matches!(
            SigningKey::from_certificate_pem(IDP_KEY_PEM),
            Err(SamlError::Crypto(_))
        ));
        assert!(matches!(
            SigningKey::from_certificate_pem("-----BEGIN CERTIFICATE-----\n%%%\n"),
            Err(SamlError::Crypto(_))
        ));
        assert!(idp_credential().certificate_pem(IDP_KEY_PEM).is_err());
    }

    #[test]
    fn publishes_certificate_in_key_info() {
        let credential = idp_credential()
            .certificate_pem(crate::test_support::IDP_CERT_PEM)
            .unwrap();
        let signed = sign_enveloped(DOCUMENT, "_r1", &credential).unwrap();
        assert!(signed.contains("<ds:X509Certificate>"));
        assert!(verify(&signed, &[idp_signing_key()], &DigestAlgorithm::DEFAULT_ALLOWED)
            .unwrap()
            .is_some());
    }
}
