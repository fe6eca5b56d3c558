//! Side-effect free description of what the web framework must do.

use std::collections::BTreeMap;

use crate::{assertion::{Assertion, NameId}, error::SamlError};

/// The authenticated user, as established by one assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name_id: NameId,
    pub issuer: String,
    pub session_index: Option<String>,
    /// Attribute values by attribute name, in document order.
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl Principal {
    /// `None` when the assertion names no subject.
    pub fn from_assertion(assertion: &Assertion) -> Option<Self> {
        let name_id = assertion.subject_name_id()?.clone();
        let mut attributes: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for attribute in &assertion.attributes {
            attributes
                .entry(attribute.name.clone())
                .or_default()
                .extend(attribute.values.iter().cloned());
        }
        Some(Principal {
            name_id,
            issuer: assertion.issuer.value.clone(),
            session_index: assertion
                .authn_statements
                .iter()
                .find_map(|statement| statement.session_index.clone()),
            attributes,
        })
    }
}

/// A cookie to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieDirective {
    pub name: String,
    pub value: String,
    pub http_only: bool,
    pub secure: bool,
    pub same_site_none: bool,
    /// Not subject to cookie consent.
    pub essential: bool,
}

/// The one thing a result is mainly about.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PrimaryEffect {
    #[default]
    None,
    /// Send the browser to [`CommandResult::location`].
    Redirect,
    Content {
        content_type: String,
        body: String,
    },
    /// Establish a session, then continue at [`CommandResult::location`].
    SignIn {
        principal: Principal,
        relay_data: BTreeMap<String, String>,
    },
    SignOut,
}

/// One step of applying a [`CommandResult`], see [`CommandResult::actions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterAction {
    SetStatus(u16),
    SetLocation(String),
    DeleteCookie { name: String, secure: bool },
    AppendCookie(CookieDirective),
    SetHeader { name: String, value: String },
    ClearCookie { name: String, secure: bool },
    WriteBody { content_type: String, body: String },
    SignIn {
        principal: Principal,
        relay_data: BTreeMap<String, String>,
        redirect_uri: Option<String>,
    },
    SignOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub status_code: u16,
    pub location: Option<String>,
    pub headers: Vec<(String, String)>,
    pub set_cookie: Option<CookieDirective>,
    /// Older state cookies to delete before `set_cookie` is appended.
    pub evicted_cookies: Vec<String>,
    pub clear_cookie: Option<String>,
    /// Secure flag used on delete directives so they match the cookie set.
    pub cookie_secure: bool,
    pub effect: PrimaryEffect,
}

impl Default for CommandResult {
    fn default() -> Self {
        CommandResult {
            status_code: 200,
            location: None,
            headers: Vec::new(),
            set_cookie: None,
            evicted_cookies: Vec::new(),
            clear_cookie: None,
            cookie_secure: true,
            effect: PrimaryEffect::None,
        }
    }
}

impl CommandResult {
    pub fn redirect(location: &str) -> Self {
        CommandResult {
            status_code: 303,
            location: Some(location.to_string()),
            effect: PrimaryEffect::Redirect,
            ..Default::default()
        }
    }

    pub fn content(content_type: &str, body: String) -> Self {
        CommandResult {
            effect: PrimaryEffect::Content {
                content_type: content_type.to_string(),
                body,
            },
            ..Default::default()
        }
    }

    pub fn sign_in(
        principal: Principal,
        relay_data: BTreeMap<String, String>,
        return_url: Option<String>,
    ) -> Self {
        CommandResult {
            status_code: 303,
            location: return_url,
            effect: PrimaryEffect::SignIn {
                principal,
                relay_data,
            },
            ..Default::default()
        }
    }

    pub fn sign_out(return_url: Option<String>) -> Self {
        CommandResult {
            status_code: if return_url.is_some() { 303 } else { 200 },
            location: return_url,
            effect: PrimaryEffect::SignOut,
            ..Default::default()
        }
    }

    /// Plain-text error answer with the status matching the error.
    pub fn error(error: &SamlError) -> Self {
        CommandResult {
            status_code: error.http_status(),
            ..Self::content("text/plain; charset=utf-8", error.to_string())
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_cookie(self, cookie: CookieDirective, evicted: Vec<String>) -> Self {
        CommandResult {
            cookie_secure: cookie.secure,
            set_cookie: Some(cookie),
            evicted_cookies: evicted,
            ..self
        }
    }

    pub fn with_clear_cookie(self, name: &str, secure: bool) -> Self {
        CommandResult {
            clear_cookie: Some(name.to_string()),
            cookie_secure: secure,
            ..self
        }
    }

    /// The order an adapter must apply this result in: status, location,
    /// evictions, new cookie, headers, cookie clearing, body, sign-in (which
    /// continues at the location), sign-out.
    pub fn actions(&self) -> Vec<AdapterAction> {
        let mut actions = vec![AdapterAction::SetStatus(self.status_code)];
        if let Some(location) = &self.location {
            actions.push(AdapterAction::SetLocation(location.clone()));
        }
        if let Some(cookie) = &self.set_cookie {
            actions.extend(self.evicted_cookies.iter().map(|name| AdapterAction::DeleteCookie {
                name: name.clone(),
                secure: self.cookie_secure,
            }));
            actions.push(AdapterAction::AppendCookie(cookie.clone()));
        }
        actions.extend(self.headers.iter().map(|(name, value)| AdapterAction::SetHeader {
            name: name.clone(),
            value: value.clone(),
        }));
        if let Some(name) = &self.clear_cookie {
            actions.push(AdapterAction::ClearCookie {
                name: name.clone(),
                secure: self.cookie_secure,
            });
        }
        match &self.effect {
            PrimaryEffect::Content { content_type, body } => actions.push(AdapterAction::WriteBody {
                content_type: content_type.clone(),
                body: body.clone(),
            }),
            PrimaryEffect::SignIn {
                principal,
                relay_data,
            } => actions.push(AdapterAction::SignIn {
                principal: principal.clone(),
                relay_data: relay_data.clone(),
                redirect_uri: self.location.clone(),
            }),
            PrimaryEffect::SignOut => actions.push(AdapterAction::SignOut),
            PrimaryEffect::None | PrimaryEffect::Redirect => {}
        }
        actions
    }
}
