use std::collections::HashMap;

use tracing::debug;

use crate::{
    authn_request::ProtocolBinding,
    error::{SamlError, SamlResult},
    signature::SigningKey,
    utils::decode_xml_base64,
    xml::{Element, XmlDocument},
    DSIG_NAMESPACE, METADATA_NAMESPACE,
};

#[derive(Debug)]
#[non_exhaustive]
pub struct IdpMetadata {
    pub entity_id: String,
    pub signing_keys: Vec<SigningKey>,
    pub sso_bindings: HashMap<ProtocolBinding, String>,
}

fn invalid(message: impl Into<String>) -> SamlError {
    SamlError::Configuration(format!("invalid IdP metadata: {}", message.into()))
}

fn child<'d>(
    element: Element<'d>,
    namespace: &'static str,
    local_name: &'static str,
) -> impl Iterator<Item = Element<'d>> {
    element
        .child_elements()
        .filter(move |child| child.is(namespace, local_name))
}

fn signing_certificates<'d>(descriptor: Element<'d>) -> impl Iterator<Item = Element<'d>> {
    child(descriptor, METADATA_NAMESPACE, "KeyDescriptor")
        .filter(|key| matches!(key.attribute("use"), None | Some("signing")))
        .flat_map(|key| child(key, DSIG_NAMESPACE, "KeyInfo"))
        .flat_map(|info| child(info, DSIG_NAMESPACE, "X509Data"))
        .flat_map(|data| child(data, DSIG_NAMESPACE, "X509Certificate"))
}

pub fn parse_idp_metadata(input: &[u8]) -> SamlResult<IdpMetadata> {
    let input = std::str::from_utf8(input).map_err(|e| invalid(e.to_string()))?;
    let document = XmlDocument::parse(input)?;
    let root = document.root();
    if !root.is(METADATA_NAMESPACE, "EntityDescriptor") {
        return Err(invalid(format!("unexpected root element {}", root.local_name())));
    }
    let entity_id = root
        .attribute("entityID")
        .ok_or_else(|| invalid("EntityDescriptor has no entityID"))?
        .to_string();
    let descriptor = child(root, METADATA_NAMESPACE, "IDPSSODescriptor")
        .next()
        .ok_or_else(|| invalid("no IDPSSODescriptor"))?;

    let signing_keys = signing_certificates(descriptor)
        .map(|certificate| {
            let der = decode_xml_base64(&certificate.text())
                .map_err(|e| invalid(format!("signing certificate is not base64: {e}")))?;
            SigningKey::from_certificate_der(&der)
        })
        .collect::<SamlResult<Vec<_>>>()?;

    let mut sso_bindings = HashMap::new();
    for service in child(descriptor, METADATA_NAMESPACE, "SingleSignOnService") {
        let binding = service
            .attribute("Binding")
            .ok_or_else(|| invalid("SingleSignOnService has no Binding"))?;
        let location = service
            .attribute("Location")
            .ok_or_else(|| invalid("SingleSignOnService has no Location"))?;
        match binding.parse() {
            Ok(binding) => {
                sso_bindings.insert(binding, location.to_string());
            }
            Err(_) => debug!(binding, "skipping unsupported SSO binding"),
        }
    }

    Ok(IdpMetadata {
        entity_id,
        signing_keys,
        sso_bindings,
    })
}
