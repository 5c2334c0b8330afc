//! The `project[:stack[:context]]` naming scheme shared by services,
//! channels, locks, and agent identities, plus pattern matching and the
//! pattern-to-SQL `LIKE` translation used by bulk queries.

use serde::{Deserialize, Serialize};

/// Maximum length of a full identity or pattern string.
pub const MAX_IDENTITY_LEN: usize = 200;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity is empty")]
    Empty,

    #[error("identity exceeds {MAX_IDENTITY_LEN} characters")]
    TooLong,

    #[error("invalid component `{0}`: allowed characters are [A-Za-z0-9._-]")]
    BadComponent(String),

    #[error("identity has more than three components")]
    TooManyComponents,

    #[error("wildcard `*` is not allowed in an exact identity")]
    WildcardInIdentity,
}

/// True when `s` is a valid single name component (`[A-Za-z0-9._-]+`).
///
/// Channel, lock, and agent names share this character class.
pub fn valid_component(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Validate a bare name (channel, lock, agent id) against the shared
/// character class and length limit.
pub fn validate_name(s: &str) -> Result<(), IdentityError> {
    if s.is_empty() {
        return Err(IdentityError::Empty);
    }
    if s.len() > MAX_IDENTITY_LEN {
        return Err(IdentityError::TooLong);
    }
    if !valid_component(s) {
        return Err(IdentityError::BadComponent(s.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A parsed semantic identity: `project`, `project:stack`, or
/// `project:stack:context`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub project: String,
    pub stack: Option<String>,
    pub context: Option<String>,
}

impl Identity {
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        if s.is_empty() {
            return Err(IdentityError::Empty);
        }
        if s.len() > MAX_IDENTITY_LEN {
            return Err(IdentityError::TooLong);
        }
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() > 3 {
            return Err(IdentityError::TooManyComponents);
        }
        for part in &parts {
            if *part == "*" {
                return Err(IdentityError::WildcardInIdentity);
            }
            if !valid_component(part) {
                return Err(IdentityError::BadComponent(part.to_string()));
            }
        }
        Ok(Self {
            project: parts[0].to_string(),
            stack: parts.get(1).map(|s| s.to_string()),
            context: parts.get(2).map(|s| s.to_string()),
        })
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.project)?;
        if let Some(stack) = &self.stack {
            write!(f, ":{stack}")?;
        }
        if let Some(context) = &self.context {
            write!(f, ":{context}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pattern
// ---------------------------------------------------------------------------

/// An identity pattern where `*` substitutes for a whole component
/// (`*:api:main`) or, as the last component, for any remaining suffix
/// (`myapp:*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    components: Vec<String>,
}

impl Pattern {
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        if s.is_empty() {
            return Err(IdentityError::Empty);
        }
        if s.len() > MAX_IDENTITY_LEN {
            return Err(IdentityError::TooLong);
        }
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() > 3 {
            return Err(IdentityError::TooManyComponents);
        }
        for part in &parts {
            if *part != "*" && !valid_component(part) {
                return Err(IdentityError::BadComponent(part.to_string()));
            }
        }
        Ok(Self {
            components: parts.into_iter().map(String::from).collect(),
        })
    }

    /// True when the pattern contains no wildcard at all.
    pub fn is_exact(&self) -> bool {
        self.components.iter().all(|c| c != "*")
    }

    /// Translate to a SQL `LIKE` expression: `*` becomes `%`; literal `%`,
    /// `_`, and `\` in components are escaped (`ESCAPE '\'` must accompany
    /// the clause).
    pub fn to_like(&self) -> String {
        let mut out = String::new();
        for (i, comp) in self.components.iter().enumerate() {
            if i > 0 {
                out.push(':');
            }
            if comp == "*" {
                out.push('%');
            } else {
                for c in comp.chars() {
                    if matches!(c, '%' | '_' | '\\') {
                        out.push('\\');
                    }
                    out.push(c);
                }
            }
        }
        out
    }

    /// Component-wise match against an exact identity string.
    ///
    /// A trailing `*` matches any remaining components (so `myapp:*` matches
    /// both `myapp:api` and `myapp:api:main`, but not `myapp` itself).
    pub fn matches(&self, identity: &str) -> bool {
        let id_parts: Vec<&str> = identity.split(':').collect();
        let last = self.components.len() - 1;
        for (i, comp) in self.components.iter().enumerate() {
            if comp == "*" && i == last {
                return id_parts.len() > i;
            }
            match id_parts.get(i) {
                Some(part) if comp == "*" || comp == part => continue,
                _ => return false,
            }
        }
        id_parts.len() == self.components.len()
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.components.join(":"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_three_forms() {
        let id = Identity::parse("myapp").unwrap();
        assert_eq!(id.project, "myapp");
        assert!(id.stack.is_none());

        let id = Identity::parse("myapp:api").unwrap();
        assert_eq!(id.stack.as_deref(), Some("api"));
        assert!(id.context.is_none());

        let id = Identity::parse("myapp:api:main").unwrap();
        assert_eq!(id.context.as_deref(), Some("main"));
        assert_eq!(id.to_string(), "myapp:api:main");
    }

    #[test]
    fn rejects_bad_identities() {
        assert_eq!(Identity::parse(""), Err(IdentityError::Empty));
        assert_eq!(
            Identity::parse("a:b:c:d"),
            Err(IdentityError::TooManyComponents)
        );
        assert_eq!(
            Identity::parse("my app"),
            Err(IdentityError::BadComponent("my app".into()))
        );
        assert_eq!(
            Identity::parse("myapp:*"),
            Err(IdentityError::WildcardInIdentity)
        );
        assert_eq!(Identity::parse("a:"), Err(IdentityError::BadComponent(String::new())));
        assert!(Identity::parse(&"x".repeat(MAX_IDENTITY_LEN + 1)).is_err());
    }

    #[test]
    fn component_charset() {
        assert!(valid_component("web-2.0_rc"));
        assert!(!valid_component("a/b"));
        assert!(!valid_component("a b"));
        assert!(!valid_component(""));
    }

    #[test]
    fn pattern_to_like() {
        assert_eq!(Pattern::parse("myapp:*").unwrap().to_like(), "myapp:%");
        assert_eq!(Pattern::parse("*:api:main").unwrap().to_like(), "%:api:main");
        assert_eq!(
            Pattern::parse("my_app:*").unwrap().to_like(),
            "my\\_app:%"
        );
    }

    #[test]
    fn pattern_matching() {
        let p = Pattern::parse("myapp:*").unwrap();
        assert!(p.matches("myapp:api"));
        assert!(p.matches("myapp:api:main"));
        assert!(!p.matches("myapp"));
        assert!(!p.matches("other:api"));

        let p = Pattern::parse("*:api:main").unwrap();
        assert!(p.matches("myapp:api:main"));
        assert!(!p.matches("myapp:web:main"));
        assert!(!p.matches("myapp:api"));

        let p = Pattern::parse("myapp:api:*").unwrap();
        assert!(p.matches("myapp:api:main"));
        assert!(!p.matches("myapp:api"));

        let exact = Pattern::parse("myapp:api").unwrap();
        assert!(exact.is_exact());
        assert!(exact.matches("myapp:api"));
        assert!(!exact.matches("myapp:api:main"));
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("build-lock.1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("no spaces").is_err());
    }
}
