// Purpose: Parse loose semver versions/constraints and select concrete versions.
// Inputs/Outputs: Raw version labels and constraints in, `semver` types and picks out.
// Invariants: Selection is deterministic for a given policy and label set.
// Gotchas: `v` prefixes are tolerated everywhere; bare versions mean an exact match.

use semver::{BuildMetadata, Op, Version, VersionReq};

use crate::error::ResolutionError;

/// Tie-break policy for constraint resolution. Injected through `Config`
/// rather than hard-coded; `Highest` is the default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionPolicy {
    Highest,
    Lowest,
}

pub fn parse_version_loose(raw: &str) -> Option<Version> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    let t = t.strip_prefix('v').unwrap_or(t);
    Version::parse(t).ok()
}

fn is_semver_boundary(ch: char) -> bool {
    ch.is_ascii_whitespace() || matches!(ch, ',' | '<' | '>' | '=' | '^' | '~')
}

fn normalize_req_for_semver(raw: &str) -> String {
    let chars: Vec<char> = raw.trim().chars().collect();
    let mut out = String::with_capacity(chars.len());
    for (i, &ch) in chars.iter().enumerate() {
        if ch == 'v'
            && i + 1 < chars.len()
            && chars[i + 1].is_ascii_digit()
            && (i == 0 || is_semver_boundary(chars[i - 1]))
        {
            continue;
        }
        out.push(ch);
    }
    out
}

pub fn parse_constraint(raw: &str) -> Option<VersionReq> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    if let Some(v) = parse_version_loose(t) {
        return VersionReq::parse(&format!("={}", v)).ok();
    }
    let normalized = normalize_req_for_semver(t);
    VersionReq::parse(&normalized).ok()
}

fn req_lower_bound(req: &VersionReq) -> Version {
    let mut best = Version::new(0, 0, 0);
    for c in &req.comparators {
        let mut v = Version {
            major: c.major,
            minor: c.minor.unwrap_or(0),
            patch: c.patch.unwrap_or(0),
            pre: c.pre.clone(),
            build: BuildMetadata::EMPTY,
        };
        match c.op {
            Op::Exact | Op::GreaterEq | Op::Caret | Op::Tilde | Op::Wildcard => {}
            Op::Greater => {
                if c.patch.is_some() {
                    v.patch = v.patch.saturating_add(1);
                    v.pre = Default::default();
                } else if c.minor.is_some() {
                    v.minor = v.minor.saturating_add(1);
                    v.patch = 0;
                    v.pre = Default::default();
                } else {
                    v.major = v.major.saturating_add(1);
                    v.minor = 0;
                    v.patch = 0;
                    v.pre = Default::default();
                }
            }
            Op::Less | Op::LessEq => {
                continue;
            }
            _ => {}
        }
        if v > best {
            best = v;
        }
    }
    best
}

pub fn constraint_min_version(raw: &str) -> Option<Version> {
    let req = parse_constraint(raw)?;
    Some(req_lower_bound(&req))
}

/// Merge two constraints for the same module: keep the one with the higher
/// minimum version so duplicate requirements converge deterministically.
pub fn merge_constraints(current: &str, candidate: &str) -> String {
    if current == candidate {
        return current.to_string();
    }
    match (
        constraint_min_version(current),
        constraint_min_version(candidate),
    ) {
        (Some(a), Some(b)) => {
            if b > a {
                candidate.to_string()
            } else {
                current.to_string()
            }
        }
        _ => current.to_string(),
    }
}

/// Pick a concrete version label satisfying `constraint` from `labels`,
/// per `policy`. Labels that do not parse as versions are ignored.
pub fn select_version(
    policy: SelectionPolicy,
    module: &str,
    constraint: &str,
    labels: &[String],
) -> Result<String, ResolutionError> {
    let req = parse_constraint(constraint).ok_or_else(|| ResolutionError::InvalidConstraint {
        module: module.to_string(),
        constraint: constraint.to_string(),
    })?;
    let mut best: Option<(Version, String)> = None;
    for label in labels {
        let Some(ver) = parse_version_loose(label) else {
            continue;
        };
        if !req.matches(&ver) {
            continue;
        }
        let better = match (&best, policy) {
            (None, _) => true,
            (Some((bver, _)), SelectionPolicy::Highest) => ver > *bver,
            (Some((bver, _)), SelectionPolicy::Lowest) => ver < *bver,
        };
        if better {
            best = Some((ver, label.clone()));
        }
    }
    best.map(|(_, label)| label)
        .ok_or_else(|| ResolutionError::NoMatchingVersion {
            module: module.to_string(),
            constraint: constraint.to_string(),
            available: if labels.is_empty() {
                "none".to_string()
            } else {
                labels.join(", ")
            },
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn constraint_min_version_parses_v_prefix_and_ranges() {
        assert_eq!(
            constraint_min_version("v1.2.3").expect("min for exact"),
            Version::new(1, 2, 3)
        );
        assert_eq!(
            constraint_min_version("^v1.2").expect("min for caret"),
            Version::new(1, 2, 0)
        );
        assert_eq!(
            constraint_min_version(">=v1.4, <2.0").expect("min for comparator range"),
            Version::new(1, 4, 0)
        );
    }

    #[test]
    fn merge_constraints_prefers_higher_floor() {
        assert_eq!(merge_constraints("v1.2.0", "^1.3"), "^1.3");
        assert_eq!(merge_constraints("^1.3", "v1.2.0"), "^1.3");
        assert_eq!(merge_constraints("^1.2", "^1.2"), "^1.2");
    }

    #[test]
    fn select_version_picks_highest_satisfying() {
        let got = select_version(
            SelectionPolicy::Highest,
            "example.com/acme/greeter",
            "^1.0.0",
            &labels(&["1.0.0", "1.2.0", "2.0.0"]),
        )
        .expect("selection");
        assert_eq!(got, "1.2.0");
    }

    #[test]
    fn select_version_fails_when_nothing_satisfies() {
        let err = select_version(
            SelectionPolicy::Highest,
            "example.com/acme/greeter",
            "^1.0.0",
            &labels(&["0.9.0"]),
        )
        .expect_err("no match");
        match err {
            ResolutionError::NoMatchingVersion { available, .. } => {
                assert_eq!(available, "0.9.0");
            }
            other => panic!("expected NoMatchingVersion, got {other}"),
        }
    }

    #[test]
    fn select_version_honors_lowest_policy() {
        let got = select_version(
            SelectionPolicy::Lowest,
            "example.com/acme/greeter",
            "^1.0",
            &labels(&["v1.0.0", "v1.2.0"]),
        )
        .expect("selection");
        assert_eq!(got, "v1.0.0");
    }

    #[test]
    fn bare_versions_mean_exact() {
        let err = select_version(
            SelectionPolicy::Highest,
            "m",
            "1.1.0",
            &labels(&["1.0.0", "1.2.0"]),
        )
        .expect_err("exact mismatch");
        assert!(matches!(err, ResolutionError::NoMatchingVersion { .. }));
    }
}
