//! Authentication tokens sent in HELLO (Bolt < 5.1) or LOGON.

use std::fmt;

use crate::types::{BoltDict, BoltValue};

/// Credentials presented to the server.
#[derive(Clone, PartialEq)]
pub struct AuthToken {
    pub scheme: String,
    pub principal: Option<String>,
    pub credentials: Option<String>,
    pub realm: Option<String>,
    /// Extra scheme-specific fields.
    pub parameters: BoltDict,
}

impl AuthToken {
    /// No authentication.
    pub fn none() -> Self {
        Self::custom("none", None, None, None, BoltDict::new())
    }

    pub fn basic(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self::custom(
            "basic",
            Some(user.into()),
            Some(password.into()),
            None,
            BoltDict::new(),
        )
    }

    pub fn basic_with_realm(
        user: impl Into<String>,
        password: impl Into<String>,
        realm: impl Into<String>,
    ) -> Self {
        Self::custom(
            "basic",
            Some(user.into()),
            Some(password.into()),
            Some(realm.into()),
            BoltDict::new(),
        )
    }

    /// Single sign-on token.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::custom("bearer", None, Some(token.into()), None, BoltDict::new())
    }

    /// Base64-encoded Kerberos ticket.
    pub fn kerberos(ticket: impl Into<String>) -> Self {
        Self::custom(
            "kerberos",
            Some(String::new()),
            Some(ticket.into()),
            None,
            BoltDict::new(),
        )
    }

    pub fn custom(
        scheme: impl Into<String>,
        principal: Option<String>,
        credentials: Option<String>,
        realm: Option<String>,
        parameters: BoltDict,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            principal,
            credentials,
            realm,
            parameters,
        }
    }

    /// The token as the dictionary the server expects.
    pub fn to_dict(&self) -> BoltDict {
        let mut dict = BoltDict::from([("scheme".to_string(), BoltValue::from(self.scheme.as_str()))]);
        if let Some(p) = &self.principal {
            dict.insert("principal".into(), BoltValue::from(p.as_str()));
        }
        if let Some(c) = &self.credentials {
            dict.insert("credentials".into(), BoltValue::from(c.as_str()));
        }
        if let Some(r) = &self.realm {
            dict.insert("realm".into(), BoltValue::from(r.as_str()));
        }
        if !self.parameters.is_empty() {
            dict.insert("parameters".into(), BoltValue::Dict(self.parameters.clone()));
        }
        dict
    }
}

impl Default for AuthToken {
    fn default() -> Self {
        Self::none()
    }
}

// Credentials stay out of logs.
impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("scheme", &self.scheme)
            .field("principal", &self.principal)
            .field("credentials", &self.credentials.as_ref().map(|_| "***"))
            .field("realm", &self.realm)
            .finish_non_exhaustive()
    }
}
