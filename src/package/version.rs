//! Dotted-numeric versions and the constraint expressions matched against them.
//!
//! Parsing is lenient: a component that is not a non-negative
//! integer counts as zero (with a warning), so any two version strings can
//! always be ordered.

use log::warn;
use std::cmp::Ordering;
use std::fmt;

/// A parsed dotted version such as `1.10.2`.
///
/// Missing trailing components compare as zero, so `1.2` and `1.2.0` are equal.
#[derive(Debug, Clone, Default)]
pub struct Version {
    components: Vec<u64>,
}

impl Version {
    /// Parse a version string, coercing every unusable component to zero.
    pub fn parse(s: &str) -> Self {
        let components = s.split('.').map(parse_component).collect();
        Version { components }
    }

    pub fn components(&self) -> &[u64] {
        &self.components
    }

    fn component(&self, index: usize) -> u64 {
        self.components.get(index).copied().unwrap_or(0)
    }
}

fn parse_component(part: &str) -> u64 {
    if part.is_empty() {
        return 0;
    }
    match part.parse::<u64>() {
        Ok(n) => n,
        Err(e) => {
            warn!("Version component {:?} is not a number ({}), using 0", part, e);
            0
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.components.iter().map(u64::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Compare two version strings component by component.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    Version::parse(a).cmp(&Version::parse(b))
}

/// Relational operator of a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    GreaterOrEqual,
    LessOrEqual,
    Greater,
    Less,
}

impl Operator {
    // Two-character operators first so `>=` is never read as `>`.
    const PREFIXES: [(&'static str, Operator); 4] = [
        (">=", Operator::GreaterOrEqual),
        ("<=", Operator::LessOrEqual),
        (">", Operator::Greater),
        ("<", Operator::Less),
    ];

    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Operator::GreaterOrEqual => ordering.is_ge(),
            Operator::LessOrEqual => ordering.is_le(),
            Operator::Greater => ordering.is_gt(),
            Operator::Less => ordering.is_lt(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::GreaterOrEqual => ">=",
            Operator::LessOrEqual => "<=",
            Operator::Greater => ">",
            Operator::Less => "<",
        }
    }
}

/// A requested version, as written in an update configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    /// Empty constraint: any version is acceptable.
    Any,
    /// No operator: the archive version must be the identical string.
    /// `1.1` does not match `1.10`, nor `1.01`.
    Exact(String),
    /// `>=`, `<=`, `>` or `<` followed by a version, compared numerically.
    Relational(Operator, String),
    /// Leading punctuation that is not a supported operator (e.g. `=1.2`, `~1.2`).
    /// Never matches.
    Unsupported(String),
}

impl VersionConstraint {
    pub fn parse(s: &str) -> Self {
        if s.is_empty() {
            return VersionConstraint::Any;
        }
        for (prefix, op) in Operator::PREFIXES {
            if let Some(rest) = s.strip_prefix(prefix) {
                return VersionConstraint::Relational(op, rest.to_string());
            }
        }
        match s.chars().next() {
            Some(c) if c.is_ascii_punctuation() => VersionConstraint::Unsupported(s.to_string()),
            _ => VersionConstraint::Exact(s.to_string()),
        }
    }

    pub fn matches(&self, actual: &str) -> bool {
        match self {
            VersionConstraint::Any => true,
            VersionConstraint::Exact(required) => required == actual,
            VersionConstraint::Relational(op, required) => {
                op.accepts(compare_versions(actual, required))
            }
            VersionConstraint::Unsupported(_) => false,
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Any => write!(f, "*"),
            VersionConstraint::Exact(v) | VersionConstraint::Unsupported(v) => write!(f, "{}", v),
            VersionConstraint::Relational(op, v) => write!(f, "{}{}", op.as_str(), v),
        }
    }
}

/// Check `actual` against a constraint string.
pub fn check_version(required: &str, actual: &str) -> bool {
    VersionConstraint::parse(required).matches(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_numeric_not_lexicographic() {
        assert_eq!(compare_versions("1.9", "1.10"), Ordering::Less);
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("2.0", "10.0"), Ordering::Less);
    }

    #[test]
    fn test_compare_equal_values_different_format() {
        assert_eq!(compare_versions("1.10", "1.010"), Ordering::Equal);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("1", "1.0.0.0"), Ordering::Equal);
    }

    #[test]
    fn test_compare_shorter_operand_padded_with_zero() {
        assert_eq!(compare_versions("1.2", "1.2.1"), Ordering::Less);
        assert_eq!(compare_versions("1.2.1", "1.2"), Ordering::Greater);
    }

    #[test_log::test]
    fn test_compare_invalid_components_are_zero() {
        assert_eq!(compare_versions("1.beta", "1.0"), Ordering::Equal);
        assert_eq!(compare_versions("1..2", "1.0.2"), Ordering::Equal);
        assert_eq!(compare_versions("", "0"), Ordering::Equal);
        assert_eq!(compare_versions("1.-1", "1.0"), Ordering::Equal);
        assert_eq!(compare_versions("x", "0.1"), Ordering::Less);
    }

    #[test]
    fn test_version_display_and_components() {
        let v = Version::parse("1.010.x");
        assert_eq!(v.components(), &[1, 10, 0]);
        assert_eq!(v.to_string(), "1.10.0");
    }

    #[test]
    fn test_version_sorting() {
        let mut versions: Vec<Version> = ["1.10", "1.9", "1.11", "0.1"]
            .iter()
            .map(|s| Version::parse(s))
            .collect();
        versions.sort();
        let sorted: Vec<String> = versions.iter().map(Version::to_string).collect();
        assert_eq!(sorted, vec!["0.1", "1.9", "1.10", "1.11"]);
    }

    #[test]
    fn test_parse_constraint() {
        assert_eq!(VersionConstraint::parse(""), VersionConstraint::Any);
        assert_eq!(
            VersionConstraint::parse("1.2"),
            VersionConstraint::Exact("1.2".into())
        );
        assert_eq!(
            VersionConstraint::parse(">=1.2"),
            VersionConstraint::Relational(Operator::GreaterOrEqual, "1.2".into())
        );
        assert_eq!(
            VersionConstraint::parse("<=1.2"),
            VersionConstraint::Relational(Operator::LessOrEqual, "1.2".into())
        );
        assert_eq!(
            VersionConstraint::parse(">1.2"),
            VersionConstraint::Relational(Operator::Greater, "1.2".into())
        );
        assert_eq!(
            VersionConstraint::parse("<1.2"),
            VersionConstraint::Relational(Operator::Less, "1.2".into())
        );
        assert_eq!(
            VersionConstraint::parse("=1.2"),
            VersionConstraint::Unsupported("=1.2".into())
        );
        assert_eq!(
            VersionConstraint::parse("~1.2"),
            VersionConstraint::Unsupported("~1.2".into())
        );
    }

    #[test]
    fn test_constraint_display() {
        assert_eq!(VersionConstraint::parse("").to_string(), "*");
        assert_eq!(VersionConstraint::parse(">=1.2").to_string(), ">=1.2");
        assert_eq!(VersionConstraint::parse("1.2").to_string(), "1.2");
    }

    #[test]
    fn test_check_version_table() {
        let cases = [
            // empty constraint
            ("", "1.12", true),
            ("", "", true),
            // plain equality is exact-string
            ("1.12", "1.12", true),
            ("1.12", "1.13", false),
            ("1.12", "1.120", false),
            ("1.1", "1.10", false),
            ("1.10", "1.010", false),
            ("3.1", "3.1", true),
            // >=
            (">=1.12", "1.12", true),
            (">=1.12", "1.13", true),
            (">=1.12", "1.11", false),
            (">=3.1", "3.2", true),
            // >
            (">1.12", "1.13", true),
            (">1.12", "1.12", false),
            (">1.12", "1.11", false),
            // <=
            ("<=1.12", "1.12", true),
            ("<=1.12", "1.11", true),
            ("<=1.12", "1.13", false),
            // <
            ("<1.12", "1.11", true),
            ("<1.12", "1.12", false),
            ("<1.12", "1.13", false),
            // relational comparison is numeric
            (">=1.10", "1.010", true),
            ("<1.10", "1.9", true),
            // unsupported operator
            ("=1.12", "1.12", false),
            ("=1.12", "=1.12", false),
            // empty actual version compares as zero
            (">1.12", "", false),
            (">=1.12", "", false),
            ("<1.12", "", true),
            ("<=1.12", "", true),
        ];

        for (required, actual, want) in cases {
            assert_eq!(
                check_version(required, actual),
                want,
                "check_version({:?}, {:?})",
                required,
                actual
            );
        }
    }
}
