//! XML canonicalization of element subtrees.
//!
//! Supports Canonical XML 1.0 and Exclusive Canonical XML 1.0, each with and
//! without comments. The node set is always an element and everything below
//! it, minus an optional excluded subtree (the enveloped signature).

use std::collections::BTreeMap;

use crate::xml::{Element, Node, XML_NAMESPACE};

pub mod algorithms {
    pub const C14N: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
    pub const C14N_WITH_COMMENTS: &str =
        "http://www.w3.org/TR/2001/REC-xml-c14n-20010315#WithComments";
    pub const EXCLUSIVE_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
    pub const EXCLUSIVE_C14N_WITH_COMMENTS: &str =
        "http://www.w3.org/2001/10/xml-exc-c14n#WithComments";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CanonicalizationMethod {
    C14N,
    C14NWithComments,
    #[default]
    ExclusiveC14N,
    ExclusiveC14NWithComments,
}

impl CanonicalizationMethod {
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::C14N => algorithms::C14N,
            Self::C14NWithComments => algorithms::C14N_WITH_COMMENTS,
            Self::ExclusiveC14N => algorithms::EXCLUSIVE_C14N,
            Self::ExclusiveC14NWithComments => algorithms::EXCLUSIVE_C14N_WITH_COMMENTS,
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            algorithms::C14N => Some(Self::C14N),
            algorithms::C14N_WITH_COMMENTS => Some(Self::C14NWithComments),
            algorithms::EXCLUSIVE_C14N => Some(Self::ExclusiveC14N),
            algorithms::EXCLUSIVE_C14N_WITH_COMMENTS => Some(Self::ExclusiveC14NWithComments),
            _ => None,
        }
    }

    pub const fn is_exclusive(&self) -> bool {
        matches!(self, Self::ExclusiveC14N | Self::ExclusiveC14NWithComments)
    }

    pub const fn with_comments(&self) -> bool {
        matches!(self, Self::C14NWithComments | Self::ExclusiveC14NWithComments)
    }
}

/// Namespaces rendered by the nearest output ancestor, keyed by prefix.
type Rendered<'d> = BTreeMap<Option<&'d str>, &'d str>;

struct Canonicalizer<'a, 'd> {
    method: CanonicalizationMethod,
    inclusive_prefixes: &'a [String],
    exclude: Option<Element<'d>>,
    output: String,
}

struct OutputAttribute<'d> {
    namespace: &'d str,
    local_name: &'d str,
    prefix: Option<&'d str>,
    value: &'d str,
}

/// Canonical form of `apex` and its descendants.
///
/// `inclusive_prefixes` is the `InclusiveNamespaces PrefixList` of exclusive
/// canonicalization (`#default` names the default namespace); it is ignored
/// by the inclusive methods.
pub fn canonicalize(
    apex: Element<'_>,
    method: CanonicalizationMethod,
    inclusive_prefixes: &[String],
    exclude: Option<Element<'_>>,
) -> String {
    let mut canonicalizer = Canonicalizer {
        method,
        inclusive_prefixes,
        exclude,
        output: String::new(),
    };
    canonicalizer.write_element(apex, &Rendered::new(), true);
    canonicalizer.output
}

impl<'a, 'd> Canonicalizer<'a, 'd> {
    fn namespace_changes(&self, element: Element<'d>, rendered: &Rendered<'d>) -> Rendered<'d> {
        let mut candidates: Vec<Option<&'d str>> = Vec::new();
        let in_scope = element.in_scope_namespaces();

        if self.method.is_exclusive() {
            candidates.push(element.prefix());
            candidates.extend(
                element
                    .attributes()
                    .iter()
                    .filter_map(|a| a.prefix.as_deref())
                    .filter(|p| *p != "xml")
                    .map(Some),
            );
            for listed in self.inclusive_prefixes {
                if listed == "#default" {
                    candidates.push(None);
                } else if let Some((prefix, _)) =
                    in_scope.iter().find(|(p, _)| *p == Some(listed.as_str()))
                {
                    candidates.push(*prefix);
                }
            }
        } else {
            candidates.extend(in_scope.iter().map(|(prefix, _)| *prefix));
            candidates.push(None);
        }

        let mut changes = Rendered::new();
        for prefix in candidates {
            if prefix == Some("xml") {
                continue;
            }
            let uri = in_scope
                .iter()
                .find(|(p, _)| *p == prefix)
                .map(|(_, uri)| *uri)
                .unwrap_or("");
            let previous = rendered.get(&prefix).copied().unwrap_or("");
            if uri != previous {
                changes.insert(prefix, uri);
            }
        }
        changes
    }

    fn output_attributes(&self, element: Element<'d>, is_apex: bool) -> Vec<OutputAttribute<'d>> {
        let mut attributes: Vec<OutputAttribute<'d>> = element
            .attributes()
            .iter()
            .map(|a| OutputAttribute {
                namespace: a.namespace.as_deref().unwrap_or(""),
                local_name: &a.local_name,
                prefix: a.prefix.as_deref(),
                value: &a.value,
            })
            .collect();

        // Canonical XML 1.0 carries xml:* attributes of omitted ancestors onto the apex.
        if is_apex && !self.method.is_exclusive() {
            let mut ancestor = element.parent();
            while let Some(current) = ancestor {
                for inherited in current.attributes() {
                    if inherited.namespace.as_deref() == Some(XML_NAMESPACE)
                        && !attributes.iter().any(|a| {
                            a.namespace == XML_NAMESPACE && a.local_name == inherited.local_name
                        })
                    {
                        attributes.push(OutputAttribute {
                            namespace: XML_NAMESPACE,
                            local_name: &inherited.local_name,
                            prefix: Some("xml"),
                            value: &inherited.value,
                        });
                    }
                }
                ancestor = current.parent();
            }
        }

        attributes.sort_by(|a, b| (a.namespace, a.local_name).cmp(&(b.namespace, b.local_name)));
        attributes
    }

    fn write_qname(&mut self, prefix: Option<&str>, local_name: &str) {
        if let Some(prefix) = prefix {
            self.output.push_str(prefix);
            self.output.push(':');
        }
        self.output.push_str(local_name);
    }

    fn write_element(&mut self, element: Element<'d>, rendered: &Rendered<'d>, is_apex: bool) {
        let changes = self.namespace_changes(element, rendered);

        self.output.push('<');
        self.write_qname(element.prefix(), element.local_name());
        for (prefix, uri) in &changes {
            match prefix {
                Some(prefix) => {
                    self.output.push_str(" xmlns:");
                    self.output.push_str(prefix);
                }
                None => self.output.push_str(" xmlns"),
            }
            self.output.push_str("=\"");
            escape_attribute(uri, &mut self.output);
            self.output.push('"');
        }
        for attribute in self.output_attributes(element, is_apex) {
            self.output.push(' ');
            self.write_qname(attribute.prefix, attribute.local_name);
            self.output.push_str("=\"");
            escape_attribute(attribute.value, &mut self.output);
            self.output.push('"');
        }
        self.output.push('>');

        let mut inner = rendered.clone();
        inner.extend(changes);

        for child in element.children() {
            match child {
                Node::Element(child) if Some(child) == self.exclude => {}
                Node::Element(child) => self.write_element(child, &inner, false),
                Node::Text(text) => escape_text(text, &mut self.output),
                Node::Comment(text) if self.method.with_comments() => {
                    self.output.push_str("<!--");
                    self.output.push_str(text);
                    self.output.push_str("-->");
                }
                Node::Comment(_) => {}
            }
        }

        self.output.push_str("</");
        self.write_qname(element.prefix(), element.local_name());
        self.output.push('>');
    }
}

fn escape_text(text: &str, output: &mut String) {
    for c in text.chars() {
        match c {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '\r' => output.push_str("&#xD;"),
            _ => output.push(c),
        }
    }
}

fn escape_attribute(value: &str, output: &mut String) {
    for c in value.chars() {
        match c {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '"' => output.push_str("&quot;"),
            '\t' => output.push_str("&#x9;"),
            '\n' => output.push_str("&#xA;"),
            '\r' => output.push_str("&#xD;"),
            _ => output.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::XmlDocument;

    fn first_child(doc: &XmlDocument) -> Element<'_> {
        doc.root().child_elements().next().unwrap()
    }

    #[test]
    fn exclusive_ignores_unrelated_ancestor_namespaces() {
        let one = XmlDocument::parse(
            r#"<a:Root xmlns:a="urn:a" xmlns:unused="urn:u"><s:Item xmlns:s="urn:s" ID="1">x</s:Item></a:Root>"#,
        )
        .unwrap();
        let two = XmlDocument::parse(
            r#"<Root xmlns:s="urn:s" xmlns:other="urn:o" xmlns="urn:d"><s:Item ID="1">x</s:Item></Root>"#,
        )
        .unwrap();

        let expected = r#"<s:Item xmlns:s="urn:s" ID="1">x</s:Item>"#;
        let method = CanonicalizationMethod::ExclusiveC14N;
        assert_eq!(canonicalize(first_child(&one), method, &[], None), expected);
        assert_eq!(canonicalize(first_child(&two), method, &[], None), expected);
    }

    #[test]
    fn inclusive_renders_every_namespace_in_scope() {
        let doc = XmlDocument::parse(
            r#"<a:Root xmlns:a="urn:a" xmlns:unused="urn:u" xml:lang="en"><s:Item xmlns:s="urn:s" ID="1">x</s:Item></a:Root>"#,
        )
        .unwrap();
        assert_eq!(
            canonicalize(first_child(&doc), CanonicalizationMethod::C14N, &[], None),
            r#"<s:Item xmlns:a="urn:a" xmlns:s="urn:s" xmlns:unused="urn:u" ID="1" xml:lang="en">x</s:Item>"#
        );
    }

    #[test]
    fn prefix_list_forces_namespace_output() {
        let doc = XmlDocument::parse(
            r#"<a:Root xmlns:a="urn:a" xmlns:unused="urn:u"><s:Item xmlns:s="urn:s">x</s:Item></a:Root>"#,
        )
        .unwrap();
        assert_eq!(
            canonicalize(
                first_child(&doc),
                CanonicalizationMethod::ExclusiveC14N,
                &["unused".to_string()],
                None
            ),
            r#"<s:Item xmlns:s="urn:s" xmlns:unused="urn:u">x</s:Item>"#
        );
    }

    #[test]
    fn sorts_attributes_and_escapes_values() {
        let doc = XmlDocument::parse(
            r#"<r b="2" a="&lt;&quot;&#x9;" xmlns:z="urn:z" z:c="3" xmlns:y="urn:y" y:d="4">a &amp; b &gt; c &#xD;<e/></r>"#,
        )
        .unwrap();
        assert_eq!(
            canonicalize(doc.root(), CanonicalizationMethod::ExclusiveC14N, &[], None),
            r#"<r xmlns:y="urn:y" xmlns:z="urn:z" a="&lt;&quot;&#x9;" b="2" y:d="4" z:c="3">a &amp; b &gt; c &#xD;<e></e></r>"#
        );
    }

    #[test]
    fn undeclares_default_namespace_where_needed() {
        let doc = XmlDocument::parse(r#"<r xmlns="urn:d"><c xmlns=""/><d/></r>"#).unwrap();
        assert_eq!(
            canonicalize(doc.root(), CanonicalizationMethod::ExclusiveC14N, &[], None),
            r#"<r xmlns="urn:d"><c xmlns=""></c><d></d></r>"#
        );
    }

    #[test]
    fn comments_and_exclusions() {
        let doc = XmlDocument::parse("<r><!-- note --><sig>x</sig><keep/></r>").unwrap();
        let sig = first_child(&doc);
        assert_eq!(
            canonicalize(doc.root(), CanonicalizationMethod::ExclusiveC14N, &[], Some(sig)),
            "<r><keep></keep></r>"
        );
        assert_eq!(
            canonicalize(
                doc.root(),
                CanonicalizationMethod::ExclusiveC14NWithComments,
                &[],
                None
            ),
            "<r><!-- note --><sig>x</sig><keep></keep></r>"
        );
    }

    #[test]
    fn algorithm_uris() {
        for method in [
            CanonicalizationMethod::C14N,
            CanonicalizationMethod::C14NWithComments,
            CanonicalizationMethod::ExclusiveC14N,
            CanonicalizationMethod::ExclusiveC14NWithComments,
        ] {
            assert_eq!(CanonicalizationMethod::from_uri(method.uri()), Some(method));
        }
        assert_eq!(CanonicalizationMethod::from_uri("urn:unknown"), None);
    }

    // Outputs of libxml2 (`xmllint --c14n` / `--exc-c14n`) for static/c14n/input.xml.
    const LIBXML2_INPUT: &str = include_str!("../static/c14n/input.xml");
    const LIBXML2_INCLUSIVE: &str = include_str!("../static/c14n/inclusive_with_comments.xml");
    const LIBXML2_EXCLUSIVE: &str = include_str!("../static/c14n/exclusive_with_comments.xml");

    #[test]
    fn matches_libxml2_output() {
        let doc = XmlDocument::parse(LIBXML2_INPUT).unwrap();
        let root = doc.root();
        let cases = [
            (CanonicalizationMethod::C14NWithComments, LIBXML2_INCLUSIVE),
            (CanonicalizationMethod::ExclusiveC14NWithComments, LIBXML2_EXCLUSIVE),
        ];
        for (method, expected) in cases {
            assert_eq!(canonicalize(root, method, &[], None), expected, "{method:?}");
        }

        let without_comments = |output: &str| output.replace("<!-- inner comment -->", "");
        assert_eq!(
            canonicalize(root, CanonicalizationMethod::C14N, &[], None),
            without_comments(LIBXML2_INCLUSIVE)
        );
        assert_eq!(
            canonicalize(root, CanonicalizationMethod::ExclusiveC14N, &[], None),
            without_comments(LIBXML2_EXCLUSIVE)
        );
    }
}
