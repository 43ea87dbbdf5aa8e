use std::fmt;
use std::str::FromStr;

use tracing::trace;

use crate::decision::{Decision, PolicyDecision};
use crate::rule::{Query, Rule};

/// Which of the two independent rule lists a message is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    Session,
    System,
}

impl BusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BusKind::Session => "session",
            BusKind::System => "system",
        }
    }

    /// Key of this bus kind's rule list in the configuration document.
    pub fn config_key(self) -> &'static str {
        match self {
            BusKind::Session => "dbus-gateway-config-session",
            BusKind::System => "dbus-gateway-config-system",
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(format!(
                "unknown bus kind '{other}'; expected 'session' or 'system'"
            )),
        }
    }
}

/// An immutable set of allow rules, one list per bus kind.
///
/// A message is admitted when at least one rule of its bus kind matches.
/// The lists behave as sets of allow predicates: rule order never affects
/// the outcome, a broader rule is never overridden by a narrower one, and
/// an empty list denies everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    session: Vec<Rule>,
    system: Vec<Rule>,
}

impl Policy {
    pub fn new(session: Vec<Rule>, system: Vec<Rule>) -> Self {
        Self { session, system }
    }

    /// A policy with both lists empty.
    pub fn deny_all() -> Self {
        Self::default()
    }

    pub fn rules(&self, bus: BusKind) -> &[Rule] {
        match bus {
            BusKind::Session => &self.session,
            BusKind::System => &self.system,
        }
    }

    pub fn decide(&self, bus: BusKind, query: &Query<'_>) -> Decision {
        if self.rules(bus).iter().any(|rule| rule.matches(query)) {
            Decision::Admit
        } else {
            Decision::Deny
        }
    }

    /// Like [`decide`](Self::decide), but also reports which rule admitted
    /// the message or, for a denial, whether some rule would have matched
    /// had the direction been different.
    pub fn evaluate(&self, bus: BusKind, query: &Query<'_>) -> PolicyDecision {
        let rules = self.rules(bus);
        if rules.is_empty() {
            return PolicyDecision::deny(format!("no {bus} rules configured"));
        }

        let mut direction_only_miss = false;
        for (index, rule) in rules.iter().enumerate() {
            if rule.matches(query) {
                trace!(bus = %bus, rule = index, "rule matched");
                return PolicyDecision::admit(index);
            }
            if rule.matches_ignoring_direction(query) {
                direction_only_miss = true;
            }
        }

        if direction_only_miss {
            PolicyDecision::deny(format!(
                "direction '{}' does not match but everything else does",
                query.direction
            ))
        } else {
            PolicyDecision::deny("no rule matched")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::parse_str;
    use crate::matcher::Direction;

    fn rule(direction: &str, interface: &str, path: &str, method: &str) -> Rule {
        Rule::new(
            direction.parse().unwrap(),
            interface.parse().unwrap(),
            path.parse().unwrap(),
            method.parse().unwrap(),
        )
    }

    fn outgoing<'a>(interface: &'a str, path: &'a str, method: &'a str) -> Query<'a> {
        Query::new(Direction::Outgoing, interface, path, method)
    }

    fn sample_queries() -> Vec<Query<'static>> {
        let mut out = Vec::new();
        for direction in [Direction::Incoming, Direction::Outgoing] {
            for interface in [
                "com.service.TestInterface1",
                "com.service.TestInterface1._1",
                "com.service.TestInterface1._1._2",
                "com.service.TestInterface2._1",
                "",
            ] {
                for path in ["/Object1", "/Object2"] {
                    for method in ["Method1", "Method2"] {
                        out.push(Query::new(direction, interface, path, method));
                    }
                }
            }
        }
        out
    }

    #[test]
    fn example_scenario() {
        let policy = parse_str(
            r#"{"dbus-gateway-config-session":[{"direction":"outgoing","interface":"com.X.A","object-path":"*","method":"*"}],"dbus-gateway-config-system":[]}"#,
        )
        .unwrap();

        let admitted = outgoing("com.X.A", "/Some", "Call");
        let deeper = outgoing("com.X.A.B", "/Some", "Call");
        let incoming = Query::new(Direction::Incoming, "com.X.A", "/Some", "Call");

        assert_eq!(policy.decide(BusKind::Session, &admitted), Decision::Admit);
        assert_eq!(policy.decide(BusKind::Session, &deeper), Decision::Deny);
        assert_eq!(policy.decide(BusKind::Session, &incoming), Decision::Deny);
    }

    #[test]
    fn empty_list_denies_everything() {
        let policy = Policy::new(vec![Rule::allow_all()], Vec::new());
        for q in sample_queries() {
            assert_eq!(policy.decide(BusKind::System, &q), Decision::Deny);
            assert_eq!(policy.decide(BusKind::Session, &q), Decision::Admit);
        }
        assert_eq!(
            Policy::deny_all().decide(BusKind::Session, &outgoing("a.b", "/", "M")),
            Decision::Deny
        );
    }

    #[test]
    fn bus_kinds_are_disjoint() {
        let policy = Policy::new(Vec::new(), vec![rule("*", "org.example.*", "*", "*")]);
        let q = outgoing("org.example.Foo", "/", "Bar");
        assert_eq!(policy.decide(BusKind::System, &q), Decision::Admit);
        assert_eq!(policy.decide(BusKind::Session, &q), Decision::Deny);
    }

    #[test]
    fn broader_rule_wins_in_either_order() {
        let broad = rule("outgoing", "com.service.TestInterface1.*", "*", "*");
        let narrow = rule("outgoing", "com.service.TestInterface1._1", "*", "*");
        let q = outgoing("com.service.TestInterface1._1._2", "/Object1", "Method2");

        let first = Policy::new(vec![broad.clone(), narrow.clone()], Vec::new());
        let last = Policy::new(vec![narrow.clone(), broad], Vec::new());
        let narrow_only = Policy::new(vec![narrow], Vec::new());

        assert_eq!(first.decide(BusKind::Session, &q), Decision::Admit);
        assert_eq!(last.decide(BusKind::Session, &q), Decision::Admit);
        assert_eq!(narrow_only.decide(BusKind::Session, &q), Decision::Deny);
    }

    #[test]
    fn rule_order_never_changes_decisions() {
        let rules = [
            rule("outgoing", "com.service.TestInterface1.*", "*", "*"),
            rule("outgoing", "com.service.TestInterface1._1", "*", "Method1"),
            rule("incoming", "*", "/Object2", "*"),
            rule("*", "com.service.TestInterface2._1", "/Object1", "*"),
        ];

        for (i, a) in rules.iter().enumerate() {
            for b in rules.iter().skip(i + 1) {
                let ab = Policy::new(vec![a.clone(), b.clone()], Vec::new());
                let ba = Policy::new(vec![b.clone(), a.clone()], Vec::new());
                for q in sample_queries() {
                    assert_eq!(
                        ab.decide(BusKind::Session, &q),
                        ba.decide(BusKind::Session, &q),
                        "order changed the decision for {q:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn union_of_admitting_and_non_admitting_rule_admits() {
        let admits = rule("*", "*", "/Object1", "*");
        let other = rule("incoming", "com.nothing", "/Nowhere", "Nope");
        let q = outgoing("com.service.TestInterface1._1", "/Object1", "Method1");

        assert_eq!(
            Policy::new(vec![other.clone()], Vec::new()).decide(BusKind::Session, &q),
            Decision::Deny
        );
        assert_eq!(
            Policy::new(vec![other, admits], Vec::new()).decide(BusKind::Session, &q),
            Decision::Admit
        );
    }

    #[test]
    fn evaluate_agrees_with_decide() {
        let policy = Policy::new(
            vec![
                rule("outgoing", "com.service.TestInterface1._1", "*", "*"),
                rule("*", "*", "/Object2", "Method2"),
            ],
            Vec::new(),
        );
        for q in sample_queries() {
            assert_eq!(
                policy.evaluate(BusKind::Session, &q).decision,
                policy.decide(BusKind::Session, &q)
            );
        }
    }

    #[test]
    fn evaluate_explains_direction_miss() {
        let policy = Policy::new(vec![rule("outgoing", "com.X.A", "*", "*")], Vec::new());
        let d = policy.evaluate(
            BusKind::Session,
            &Query::new(Direction::Incoming, "com.X.A", "/", "M"),
        );
        assert_eq!(d.decision, Decision::Deny);
        assert!(d.reason.contains("direction 'incoming' does not match"), "{}", d.reason);

        let d = policy.evaluate(BusKind::Session, &outgoing("com.X.A", "/", "M"));
        assert_eq!(d.matched_rule, Some(0));
    }

    #[test]
    fn bus_kind_parse_and_keys() {
        assert_eq!("session".parse::<BusKind>().unwrap(), BusKind::Session);
        assert_eq!("system".parse::<BusKind>().unwrap(), BusKind::System);
        assert!("starter".parse::<BusKind>().is_err());
        assert_eq!(BusKind::System.config_key(), "dbus-gateway-config-system");
    }
}
