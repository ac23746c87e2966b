use istio_config_k8s_api::{authentication::TriggerRule as ApiTriggerRule, StringMatch};
use regex::Regex;
use std::fmt;

/// The ordered trigger rules of a JWT authentication method.
///
/// Patterns are compiled once, when the owning resource is loaded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TriggerRules(Vec<TriggerRule>);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TriggerRule {
    excluded: Vec<PathMatch>,
    included: Included,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Included {
    /// No `includedPaths` were configured.
    #[default]
    Any,

    /// At least one of these must match. An empty list matches nothing.
    OneOf(Vec<PathMatch>),
}

#[derive(Clone, Debug)]
pub enum PathMatch {
    Exact(String),
    Prefix(String),

    /// Must match the whole path.
    Regex(Regex),
}

#[derive(Debug, thiserror::Error)]
#[error("invalid regex pattern {pattern:?}: {source}")]
pub struct InvalidRegexPattern {
    pub pattern: String,
    source: regex::Error,
}

/// Returns true if JWT validation must be triggered for `path`.
pub fn should_validate(rules: &[TriggerRule], path: &str) -> bool {
    rules.is_empty() || rules.iter().any(|rule| rule.is_satisfied(path))
}

// === impl TriggerRules ===

impl TriggerRules {
    /// Compiles every rule, returning the errors for any malformed patterns
    /// alongside.
    ///
    /// A malformed pattern never matches: it neither exempts a path when
    /// excluded nor selects one when included.
    pub fn compile(rules: Vec<ApiTriggerRule>) -> (Self, Vec<InvalidRegexPattern>) {
        let mut errors = Vec::new();
        let rules = rules
            .into_iter()
            .map(|rule| TriggerRule::compile(rule, &mut errors))
            .collect();
        (Self(rules), errors)
    }

    /// Like `compile`, but fails on the first malformed pattern.
    pub fn try_compile(rules: Vec<ApiTriggerRule>) -> Result<Self, InvalidRegexPattern> {
        let (rules, errors) = Self::compile(rules);
        match errors.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(rules),
        }
    }

    #[inline]
    pub fn should_validate(&self, path: &str) -> bool {
        should_validate(&self.0, path)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TriggerRule> {
        self.0.iter()
    }
}

impl FromIterator<TriggerRule> for TriggerRules {
    fn from_iter<T: IntoIterator<Item = TriggerRule>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

// === impl TriggerRule ===

impl TriggerRule {
    /// An empty `included` list places no constraint on the path.
    pub fn new(excluded: Vec<PathMatch>, included: Vec<PathMatch>) -> Self {
        let included = if included.is_empty() {
            Included::Any
        } else {
            Included::OneOf(included)
        };
        Self { excluded, included }
    }

    pub fn is_satisfied(&self, path: &str) -> bool {
        if self.excluded.iter().any(|m| m.matches(path)) {
            return false;
        }
        match self.included {
            Included::Any => true,
            Included::OneOf(ref included) => included.iter().any(|m| m.matches(path)),
        }
    }

    pub fn excluded(&self) -> &[PathMatch] {
        &self.excluded
    }

    pub fn included(&self) -> &Included {
        &self.included
    }

    fn compile(
        ApiTriggerRule {
            excluded_paths,
            included_paths,
        }: ApiTriggerRule,
        errors: &mut Vec<InvalidRegexPattern>,
    ) -> Self {
        let excluded = compile_all(excluded_paths, errors);
        let included = if included_paths.is_empty() {
            Included::Any
        } else {
            Included::OneOf(compile_all(included_paths, errors))
        };
        Self { excluded, included }
    }
}

fn compile_all(
    matches: Vec<StringMatch>,
    errors: &mut Vec<InvalidRegexPattern>,
) -> Vec<PathMatch> {
    matches
        .into_iter()
        .filter_map(|m| match PathMatch::try_from(m) {
            Ok(m) => Some(m),
            Err(error) => {
                errors.push(error);
                None
            }
        })
        .collect()
}

// === impl PathMatch ===

impl PathMatch {
    /// Compiles `pattern` so that it only matches whole paths.
    pub fn regex(pattern: &str) -> Result<Self, InvalidRegexPattern> {
        Regex::new(&format!("^(?:{})$", pattern))
            .map(Self::Regex)
            .map_err(|source| InvalidRegexPattern {
                pattern: pattern.to_string(),
                source,
            })
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(exact) => path == exact,
            Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
            Self::Regex(re) => re.is_match(path),
        }
    }
}

impl TryFrom<StringMatch> for PathMatch {
    type Error = InvalidRegexPattern;

    fn try_from(m: StringMatch) -> Result<Self, Self::Error> {
        match m {
            StringMatch::Exact(exact) => Ok(Self::Exact(exact)),
            StringMatch::Prefix(prefix) => Ok(Self::Prefix(prefix)),
            StringMatch::Regex(pattern) => Self::regex(&pattern),
        }
    }
}

impl PartialEq for PathMatch {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(l0), Self::Exact(r0)) => l0 == r0,
            (Self::Prefix(l0), Self::Prefix(r0)) => l0 == r0,
            (Self::Regex(l0), Self::Regex(r0)) => l0.as_str() == r0.as_str(),
            _ => false,
        }
    }
}

impl Eq for PathMatch {}

impl fmt::Display for PathMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(exact) => write!(f, "exact:{}", exact),
            Self::Prefix(prefix) => write!(f, "prefix:{}", prefix),
            Self::Regex(re) => write!(f, "regex:{}", re.as_str()),
        }
    }
}
