use crate::matcher::{Direction, DirectionPattern, InterfacePattern, MethodPattern, PathPattern};

/// The fields of a message that rules are matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Query<'a> {
    pub direction: Direction,
    /// Fully qualified interface; empty when the message carries none.
    pub interface: &'a str,
    pub object_path: &'a str,
    pub method: &'a str,
}

impl<'a> Query<'a> {
    pub fn new(direction: Direction, interface: &'a str, object_path: &'a str, method: &'a str) -> Self {
        Self {
            direction,
            interface,
            object_path,
            method,
        }
    }
}

/// One allow entry of a policy. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    direction: DirectionPattern,
    interface: InterfacePattern,
    object_path: PathPattern,
    method: MethodPattern,
}

impl Rule {
    pub fn new(
        direction: DirectionPattern,
        interface: InterfacePattern,
        object_path: PathPattern,
        method: MethodPattern,
    ) -> Self {
        Self {
            direction,
            interface,
            object_path,
            method,
        }
    }

    /// A rule that matches every message.
    pub fn allow_all() -> Self {
        Self::new(
            DirectionPattern::Any,
            InterfacePattern::Any,
            PathPattern::Any,
            MethodPattern::Any,
        )
    }

    pub fn direction(&self) -> DirectionPattern {
        self.direction
    }

    pub fn interface(&self) -> &InterfacePattern {
        &self.interface
    }

    pub fn object_path(&self) -> &PathPattern {
        &self.object_path
    }

    pub fn method(&self) -> &MethodPattern {
        &self.method
    }

    /// All four components must match.
    pub fn matches(&self, query: &Query<'_>) -> bool {
        self.direction.matches(query.direction) && self.matches_ignoring_direction(query)
    }

    /// Interface, path and method match; direction is not consulted.
    pub fn matches_ignoring_direction(&self, query: &Query<'_>) -> bool {
        self.interface.matches(query.interface)
            && self.object_path.matches(query.object_path)
            && self.method.matches(query.method)
    }
}
