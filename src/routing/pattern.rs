//! Path patterns and rewrite templates.
//!
//! Patterns are deliberately small: a static prefix optionally followed by a
//! single trailing `/**` capture, or an exact path. Anything richer is a
//! configuration error at load time rather than a surprise at request time.

use std::fmt;

use thiserror::Error;

/// Placeholder replaced by the wildcard capture in a rewrite template.
pub const SEGMENT_PLACEHOLDER: &str = "{segment}";

const WILDCARD_SUFFIX: &str = "/**";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern must start with '/': '{0}'")]
    MissingLeadingSlash(String),

    #[error("'*' is only allowed as a single trailing '/**': '{0}'")]
    MisplacedWildcard(String),

    #[error("rewrite template must start with '/': '{0}'")]
    InvalidRewrite(String),
}

/// A parsed route path pattern.
///
/// | Pattern               | Matches                                        |
/// |-----------------------|------------------------------------------------|
/// | `/api/v1/customers/**`| `/api/v1/customers`, `/api/v1/customers/42/x`  |
/// | `/api/v1/status`      | `/api/v1/status` only                          |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    prefix: String,
    wildcard: bool,
}

impl PathPattern {
    /// Parse a pattern string.
    ///
    /// # Errors
    ///
    /// Returns `PatternError` when the pattern does not start with `/` or uses
    /// `*` anywhere other than one trailing `/**`.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if !pattern.starts_with('/') {
            return Err(PatternError::MissingLeadingSlash(pattern.to_string()));
        }

        let (prefix, wildcard) = match pattern.strip_suffix(WILDCARD_SUFFIX) {
            Some(prefix) => (prefix, true),
            None => (pattern, false),
        };

        if prefix.contains('*') {
            return Err(PatternError::MisplacedWildcard(pattern.to_string()));
        }

        Ok(Self {
            prefix: prefix.to_string(),
            wildcard,
        })
    }

    /// Match `path` and return the wildcard capture.
    ///
    /// Exact patterns capture the empty string. The capture never carries a
    /// leading slash, so `/api/v1/customers/42/orders` against
    /// `/api/v1/customers/**` yields `42/orders`.
    pub fn capture<'p>(&self, path: &'p str) -> Option<&'p str> {
        if !self.wildcard {
            return (path == self.prefix).then_some("");
        }

        let rest = path.strip_prefix(self.prefix.as_str())?;
        if rest.is_empty() {
            return Some("");
        }
        // Segment boundary: `/customers/**` must not match `/customersX`.
        rest.strip_prefix('/')
    }

    /// Length of the static part, used for longest-prefix precedence.
    pub fn static_len(&self) -> usize {
        self.prefix.len()
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wildcard {
            write!(f, "{}{WILDCARD_SUFFIX}", self.prefix)
        } else {
            f.write_str(&self.prefix)
        }
    }
}

/// How the matched path is rewritten before forwarding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RewriteRule {
    /// Forward the original path unchanged.
    #[default]
    PassThrough,
    /// Substitute the capture into a template such as `/customers/{segment}`.
    Template(String),
}

impl RewriteRule {
    /// Build a rule from an optional template.
    ///
    /// # Errors
    ///
    /// Returns `PatternError::InvalidRewrite` if the template does not start with `/`.
    pub fn from_template(template: Option<&str>) -> Result<Self, PatternError> {
        match template {
            None => Ok(RewriteRule::PassThrough),
            Some(t) if t.starts_with('/') => Ok(RewriteRule::Template(t.to_string())),
            Some(t) => Err(PatternError::InvalidRewrite(t.to_string())),
        }
    }

    /// Produce the upstream path (without query string).
    pub fn apply(&self, original_path: &str, capture: &str) -> String {
        match self {
            RewriteRule::PassThrough => original_path.to_string(),
            RewriteRule::Template(template) => {
                let mut rewritten = template.replace(SEGMENT_PLACEHOLDER, capture);
                if capture.is_empty() && rewritten.len() > 1 && rewritten.ends_with('/') {
                    rewritten.pop();
                }
                rewritten
            }
        }
    }
}

/// True if any segment is `.` or `..`, including their percent-encoded forms.
pub fn has_dot_segment(path: &str) -> bool {
    path.split('/').any(|segment| {
        let lowered = segment.to_ascii_lowercase();
        let decoded = lowered.replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}
