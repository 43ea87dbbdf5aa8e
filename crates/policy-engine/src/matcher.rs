use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors raised while turning a configuration string into a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern must not be empty")]
    Empty,

    #[error("unknown direction '{0}'; expected 'incoming', 'outgoing' or '*'")]
    UnknownDirection(String),

    #[error("wildcard is only allowed as the whole pattern or as a trailing '.*' segment: '{0}'")]
    MisplacedWildcard(String),

    #[error("interface '{0}' contains an empty segment")]
    EmptySegment(String),

    #[error("object path '{0}' must be '*' or start with '/'")]
    RelativePath(String),
}

/// Which way a message travels, relative to the contained peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Outside bus -> contained peer.
    Incoming,
    /// Contained peer -> outside bus.
    Outgoing,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }

    /// The direction a reply to a message travelling this way would take.
    pub fn reverse(self) -> Self {
        match self {
            Direction::Incoming => Direction::Outgoing,
            Direction::Outgoing => Direction::Incoming,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction component of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionPattern {
    Incoming,
    Outgoing,
    Any,
}

impl DirectionPattern {
    pub fn matches(self, direction: Direction) -> bool {
        match self {
            DirectionPattern::Any => true,
            DirectionPattern::Incoming => direction == Direction::Incoming,
            DirectionPattern::Outgoing => direction == Direction::Outgoing,
        }
    }
}

impl FromStr for DirectionPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "*" => Ok(DirectionPattern::Any),
            "incoming" => Ok(DirectionPattern::Incoming),
            "outgoing" => Ok(DirectionPattern::Outgoing),
            "" => Err(PatternError::Empty),
            other => Err(PatternError::UnknownDirection(other.to_string())),
        }
    }
}

/// Interface component of a rule.
///
/// `Subtree("a.b")` comes from the configuration string `"a.b.*"` and
/// matches `a.b` itself plus every interface nested below it (`a.b.c`,
/// `a.b.c.d`, ...). It never matches a sibling that merely shares the
/// textual prefix, such as `a.bc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfacePattern {
    Any,
    Exact(String),
    Subtree(String),
}

impl InterfacePattern {
    pub fn matches(&self, interface: &str) -> bool {
        match self {
            InterfacePattern::Any => true,
            InterfacePattern::Exact(name) => interface == name,
            InterfacePattern::Subtree(prefix) => match interface.strip_prefix(prefix.as_str()) {
                Some("") => true,
                Some(rest) => rest.len() > 1 && rest.starts_with('.'),
                None => false,
            },
        }
    }
}

impl FromStr for InterfacePattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PatternError::Empty);
        }
        if s == "*" {
            return Ok(InterfacePattern::Any);
        }

        let (name, subtree) = match s.strip_suffix(".*") {
            Some(prefix) => (prefix, true),
            None => (s, false),
        };

        if name.contains('*') {
            return Err(PatternError::MisplacedWildcard(s.to_string()));
        }
        if name.split('.').any(str::is_empty) {
            return Err(PatternError::EmptySegment(s.to_string()));
        }

        Ok(if subtree {
            InterfacePattern::Subtree(name.to_string())
        } else {
            InterfacePattern::Exact(name.to_string())
        })
    }
}

/// Object-path component of a rule. Paths are compared verbatim; there is
/// no hierarchical path matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Any,
    Exact(String),
}

impl PathPattern {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Any => true,
            PathPattern::Exact(expected) => path == expected,
        }
    }
}

impl FromStr for PathPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(PatternError::Empty),
            "*" => Ok(PathPattern::Any),
            p if p.starts_with('/') => {
                if p.contains('*') {
                    Err(PatternError::MisplacedWildcard(p.to_string()))
                } else {
                    Ok(PathPattern::Exact(p.to_string()))
                }
            }
            other => Err(PatternError::RelativePath(other.to_string())),
        }
    }
}

/// Method component of a rule.
///
/// A single configured name and a one-element list both end up as a
/// one-element set, so the two spellings can never decide differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodPattern {
    Any,
    Names(BTreeSet<String>),
}

impl MethodPattern {
    /// Build a pattern from configured names. `"*"` anywhere widens the
    /// pattern to every method; an empty list matches nothing. An empty
    /// name is invalid wherever it appears.
    pub fn from_names<I, S>(names: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        let mut any = false;
        for name in names {
            match name.as_ref() {
                "*" => any = true,
                "" => return Err(PatternError::Empty),
                n if n.contains('*') => return Err(PatternError::MisplacedWildcard(n.to_string())),
                n => {
                    set.insert(n.to_string());
                }
            }
        }
        Ok(if any { MethodPattern::Any } else { MethodPattern::Names(set) })
    }

    pub fn matches(&self, method: &str) -> bool {
        match self {
            MethodPattern::Any => true,
            MethodPattern::Names(names) => names.contains(method),
        }
    }
}

impl FromStr for MethodPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MethodPattern::from_names([s])
    }
}
