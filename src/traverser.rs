//! Schema-guided cursor over an [`XmlDocument`](crate::xml::XmlDocument).
//!
//! Every failed expectation is recorded instead of returned, so one pass over
//! a message reports all of its structural problems. Callers read values,
//! then call [`XmlTraverser::throw_on_errors`] before trusting any of them.

use std::{cell::RefCell, rc::Rc};

use time::{format_description::well_known::Iso8601, OffsetDateTime};

use crate::{
    error::{SamlError, SamlResult, Severity, XmlError},
    xml::{Element, Node},
};

type ErrorSink = Rc<RefCell<Vec<XmlError>>>;

#[derive(Debug, Clone)]
pub struct XmlTraverser<'d> {
    element: Element<'d>,
    path: String,
    errors: ErrorSink,
}

impl<'d> XmlTraverser<'d> {
    pub fn new(element: Element<'d>) -> Self {
        XmlTraverser {
            path: format!("/{}", element.local_name()),
            element,
            errors: Rc::default(),
        }
    }

    fn child(&self, element: Element<'d>, path: String) -> Self {
        XmlTraverser {
            element,
            path,
            errors: Rc::clone(&self.errors),
        }
    }

    pub fn element(&self) -> Element<'d> {
        self.element
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn record(&self, severity: Severity, message: String) {
        self.errors.borrow_mut().push(XmlError {
            severity,
            path: self.path.clone(),
            message,
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.record(Severity::Error, message.into());
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.record(Severity::Warning, message.into());
    }

    /// Records an error unless the element has the expected name.
    pub fn ensure_name(&self, namespace: &str, local_name: &str) -> bool {
        if self.element.is(namespace, local_name) {
            return true;
        }
        self.error(format!(
            "expected element {{{namespace}}}{local_name}, found {{{}}}{}",
            self.element.namespace().unwrap_or_default(),
            self.element.local_name()
        ));
        false
    }

    pub fn optional_attribute(&self, name: &str) -> Option<&'d str> {
        self.element.attribute(name)
    }

    pub fn required_attribute(&self, name: &str) -> Option<&'d str> {
        let value = self.element.attribute(name);
        if value.is_none() {
            self.error(format!("missing required attribute {name}"));
        }
        value
    }

    fn parse_date_time(&self, name: &str, value: &str) -> Option<OffsetDateTime> {
        match OffsetDateTime::parse(value.trim(), &Iso8601::DEFAULT) {
            Ok(instant) => Some(instant),
            Err(_) => {
                self.error(format!("attribute {name} value '{value}' is not a valid xs:dateTime"));
                None
            }
        }
    }

    pub fn optional_date_time(&self, name: &str) -> Option<OffsetDateTime> {
        self.optional_attribute(name)
            .and_then(|value| self.parse_date_time(name, value))
    }

    pub fn required_date_time(&self, name: &str) -> Option<OffsetDateTime> {
        self.required_attribute(name)
            .and_then(|value| self.parse_date_time(name, value))
    }

    pub fn optional_bool(&self, name: &str) -> Option<bool> {
        match self.optional_attribute(name)?.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            other => {
                self.error(format!("attribute {name} value '{other}' is not a valid xs:boolean"));
                None
            }
        }
    }

    fn check_uri(&self, name: &str, value: &'d str) -> Option<&'d str> {
        match url::Url::parse(value) {
            Ok(_) => Some(value),
            Err(_) => {
                self.error(format!("attribute {name} value '{value}' is not an absolute URI"));
                None
            }
        }
    }

    pub fn optional_uri(&self, name: &str) -> Option<&'d str> {
        self.optional_attribute(name)
            .and_then(|value| self.check_uri(name, value))
    }

    pub fn required_uri(&self, name: &str) -> Option<&'d str> {
        self.required_attribute(name)
            .and_then(|value| self.check_uri(name, value))
    }

    /// Trimmed text content of a simple-content element.
    pub fn text(&self) -> String {
        if self.element.child_elements().next().is_some() {
            self.error("expected text content, found child elements");
        }
        self.element.text().trim().to_string()
    }

    /// Cursor over the child elements, in document order.
    pub fn children(&self) -> ChildElements<'d> {
        let mut elements = Vec::new();
        for node in self.element.children() {
            match node {
                Node::Element(element) => elements.push(element),
                Node::Text(text) if !text.trim().is_empty() => {
                    self.error(format!("unexpected text content '{}'", text.trim()));
                }
                _ => {}
            }
        }
        ChildElements {
            parent: self.clone(),
            elements,
            position: 0,
        }
    }

    /// Everything recorded so far by this traverser and the ones derived from it.
    pub fn errors(&self) -> Vec<XmlError> {
        self.errors.borrow().clone()
    }

    pub fn has_errors(&self) -> bool {
        self.errors
            .borrow()
            .iter()
            .any(|e| e.severity == Severity::Error)
    }

    /// Turns the accumulated errors into a single failure. Warnings alone pass.
    pub fn throw_on_errors(&self) -> SamlResult<()> {
        if self.has_errors() {
            return Err(SamlError::Structural(
                self.errors
                    .borrow()
                    .iter()
                    .filter(|e| e.severity == Severity::Error)
                    .cloned()
                    .collect(),
            ));
        }
        Ok(())
    }
}

/// Ordered cursor over the child elements of one element.
#[derive(Debug)]
pub struct ChildElements<'d> {
    parent: XmlTraverser<'d>,
    elements: Vec<Element<'d>>,
    position: usize,
}

impl<'d> ChildElements<'d> {
    pub fn peek(&self) -> Option<Element<'d>> {
        self.elements.get(self.position).copied()
    }

    pub fn next_is(&self, namespace: &str, local_name: &str) -> bool {
        self.peek()
            .is_some_and(|element| element.is(namespace, local_name))
    }

    fn take(&mut self, suffix: &str) -> Option<XmlTraverser<'d>> {
        let element = self.peek()?;
        self.position += 1;
        let path = format!("{}/{}{suffix}", self.parent.path, element.local_name());
        Some(self.parent.child(element, path))
    }

    /// Consumes the next element, whatever it is.
    pub fn next_any(&mut self) -> Option<XmlTraverser<'d>> {
        self.take("")
    }

    pub fn optional(&mut self, namespace: &str, local_name: &str) -> Option<XmlTraverser<'d>> {
        if self.next_is(namespace, local_name) {
            self.take("")
        } else {
            None
        }
    }

    pub fn required(&mut self, namespace: &str, local_name: &str) -> Option<XmlTraverser<'d>> {
        if self.next_is(namespace, local_name) {
            return self.take("");
        }
        match self.peek() {
            Some(found) => self.parent.error(format!(
                "expected element {local_name}, found {}",
                found.local_name()
            )),
            None => self
                .parent
                .error(format!("missing required element {local_name}")),
        }
        None
    }

    pub fn zero_or_more(&mut self, namespace: &str, local_name: &str) -> Vec<XmlTraverser<'d>> {
        let mut result = Vec::new();
        while self.next_is(namespace, local_name) {
            let suffix = format!("[{}]", result.len() + 1);
            if let Some(child) = self.take(&suffix) {
                result.push(child);
            }
        }
        result
    }

    pub fn one_or_more(&mut self, namespace: &str, local_name: &str) -> Vec<XmlTraverser<'d>> {
        let result = self.zero_or_more(namespace, local_name);
        if result.is_empty() {
            self.required(namespace, local_name);
        }
        result
    }

    /// Records every element not consumed yet as unexpected.
    pub fn finish(mut self) {
        while let Some(extra) = self.take("") {
            extra.error(format!("unexpected element {}", extra.element().local_name()));
        }
    }
}
