//! Package environment capture and semantic-version matching.
//!
//! The environment snapshot collaborator hands us a YAML-shaped export: a
//! `dependencies` list of `name=version[=build]` strings with a nested
//! pinned `pip:` sub-list of `name==version` lines. Only that shape is
//! parsed. Version strings in the wild are frequently not valid semver, so
//! comparisons run through an explicit coercion step instead of failing.

use anyhow::{Context, Result};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

/// Flat package-name to version-string mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    packages: BTreeMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            packages: pairs
                .into_iter()
                .map(|(name, version)| (name.into(), version.into()))
                .collect(),
        }
    }

    /// Parses an environment export document.
    ///
    /// Terminal escape sequences are stripped first; exports captured from a
    /// live terminal tend to carry color codes.
    pub fn from_export(text: &str) -> Result<Self> {
        let clean = strip_ansi(text);
        let doc: serde_yaml::Value =
            serde_yaml::from_str(&clean).context("parse environment export")?;
        let deps = doc
            .get("dependencies")
            .and_then(|value| value.as_sequence())
            .context("environment export has no dependencies list")?;

        let mut packages = BTreeMap::new();
        for item in deps {
            if let Some(line) = item.as_str() {
                let mut parts = line.splitn(3, '=');
                let name = parts.next().unwrap_or_default();
                match parts.next() {
                    Some(version) if !name.is_empty() => {
                        packages.insert(name.to_string(), version.to_string());
                    }
                    _ => tracing::warn!(line, "skipping unversioned dependency line"),
                }
            } else if let Some(mapping) = item.as_mapping() {
                let pinned = mapping
                    .iter()
                    .find(|(key, _)| key.as_str() == Some("pip"))
                    .and_then(|(_, value)| value.as_sequence());
                if let Some(pinned) = pinned {
                    for line in pinned.iter().filter_map(|value| value.as_str()) {
                        if let Some((name, version)) = line.split_once("==") {
                            packages.insert(name.to_string(), version.to_string());
                        } else {
                            tracing::warn!(line, "skipping unpinned sub-list line");
                        }
                    }
                }
            }
        }
        Ok(Self { packages })
    }

    pub fn from_export_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read environment export {}", path.display()))?;
        Self::from_export(&text)
    }

    pub fn package_version(&self, package: &str) -> Option<&str> {
        self.packages.get(package).map(String::as_str)
    }

    pub fn insert(&mut self, package: impl Into<String>, version: impl Into<String>) {
        self.packages.insert(package.into(), version.into());
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.packages
            .iter()
            .map(|(name, version)| (name.as_str(), version.as_str()))
    }

    /// Checks whether the installed version of `package` satisfies `spec`.
    ///
    /// Supported specs: `>=`, `>`, `<=`, `<`, `~` (same-minor range), and
    /// `==`/bare exact. A missing package never fulfils.
    pub fn fulfils(&self, package: &str, spec: &str) -> bool {
        let Some(installed) = self.package_version(package) else {
            tracing::warn!(package, "package not present in environment");
            return false;
        };
        let spec = VersionSpec::parse_lenient(package, spec);
        spec.matches(&Version::coerce(installed))
    }

    /// Conjunction of [`fulfils`](Self::fulfils) over all required packages.
    /// No requirement is trivially satisfied. Mismatches are logged per
    /// package, never silently dropped.
    pub fn fulfils_environment(&self, required: Option<&Environment>) -> bool {
        let Some(required) = required else {
            return true;
        };
        let mut satisfied = true;
        for (package, spec) in required.iter() {
            if !self.fulfils(package, spec) {
                tracing::warn!(
                    package,
                    required = spec,
                    installed = self.package_version(package).unwrap_or("<missing>"),
                    "package does not fulfil requirement"
                );
                satisfied = false;
            }
        }
        satisfied
    }
}

fn strip_ansi(text: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let pattern = ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("valid pattern"));
    pattern.replace_all(text, "").into_owned()
}

/// A coerced three-component version with optional pre-release and build
/// metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Vec<PreIdentifier>,
    pub build: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreIdentifier {
    Numeric(u64),
    Alpha(String),
}

impl Version {
    pub fn release(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: Vec::new(),
            build: String::new(),
        }
    }

    /// Coerces an arbitrary version string into canonical form.
    ///
    /// Rules: missing minor/patch components become zero; any character
    /// outside `[a-zA-Z0-9.+-]` becomes `-`; numeric dot components past
    /// the third move to the build part; extra `+` in the build part
    /// becomes `.`.
    pub fn coerce(raw: &str) -> Self {
        let cleaned: String = raw
            .trim()
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '+' | '-') {
                    ch
                } else {
                    '-'
                }
            })
            .collect();

        let (main, build_raw) = match cleaned.split_once('+') {
            Some((main, build)) => (main, build.replace('+', ".")),
            None => (cleaned.as_str(), String::new()),
        };

        let mut rest = main;
        let mut components = [0u64; 3];
        let mut matched = 0;
        while matched < components.len() {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            if digits.is_empty() {
                break;
            }
            components[matched] = digits.parse().unwrap_or(0);
            matched += 1;
            rest = &rest[digits.len()..];
            // The separator before a fourth numeric component stays in
            // `rest` so that component lands in the build part below.
            if matched == components.len() {
                break;
            }
            match rest.strip_prefix('.') {
                Some(stripped) if stripped.starts_with(|ch: char| ch.is_ascii_digit()) => {
                    rest = stripped;
                }
                _ => break,
            }
        }

        // Extra numeric dot components belong to the build part.
        let mut build_extra = Vec::new();
        if matched == 3 {
            while let Some(stripped) = rest.strip_prefix('.') {
                let digits: String = stripped.chars().take_while(char::is_ascii_digit).collect();
                if digits.is_empty() {
                    break;
                }
                build_extra.push(digits.clone());
                rest = &stripped[digits.len()..];
            }
        }

        let pre_raw = rest.trim_start_matches(['-', '.']);
        let pre = if pre_raw.is_empty() {
            Vec::new()
        } else {
            pre_raw
                .split(['.', '-'])
                .filter(|segment| !segment.is_empty())
                .map(|segment| match segment.parse::<u64>() {
                    Ok(number) => PreIdentifier::Numeric(number),
                    Err(_) => PreIdentifier::Alpha(segment.to_string()),
                })
                .collect()
        };

        let mut build = build_extra.join(".");
        if !build_raw.is_empty() {
            if !build.is_empty() {
                build.push('.');
            }
            build.push_str(&build_raw);
        }

        Self {
            major: components[0],
            minor: components[1],
            patch: components[2],
            pre,
            build,
        }
    }

    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| compare_prerelease(&self.pre, &other.pre))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A release outranks any pre-release of the same triple; pre-release
/// identifiers compare numerically when both sides are numeric, lexically
/// otherwise, with numeric identifiers ranking below alphanumeric ones.
fn compare_prerelease(a: &[PreIdentifier], b: &[PreIdentifier]) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }
    for pair in a.iter().zip(b.iter()) {
        let ordering = match pair {
            (PreIdentifier::Numeric(x), PreIdentifier::Numeric(y)) => x.cmp(y),
            (PreIdentifier::Numeric(_), PreIdentifier::Alpha(_)) => Ordering::Less,
            (PreIdentifier::Alpha(_), PreIdentifier::Numeric(_)) => Ordering::Greater,
            (PreIdentifier::Alpha(x), PreIdentifier::Alpha(y)) => x.cmp(y),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpecOp {
    Exact,
    Ge,
    Gt,
    Le,
    Lt,
    Tilde,
}

/// A single version constraint.
#[derive(Debug, Clone)]
pub struct VersionSpec {
    op: SpecOp,
    version: Version,
}

impl VersionSpec {
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        let (op, rest) = if let Some(rest) = spec.strip_prefix(">=") {
            (SpecOp::Ge, rest)
        } else if let Some(rest) = spec.strip_prefix("<=") {
            (SpecOp::Le, rest)
        } else if let Some(rest) = spec.strip_prefix("==") {
            (SpecOp::Exact, rest)
        } else if let Some(rest) = spec.strip_prefix('>') {
            (SpecOp::Gt, rest)
        } else if let Some(rest) = spec.strip_prefix('<') {
            (SpecOp::Lt, rest)
        } else if let Some(rest) = spec.strip_prefix('~') {
            (SpecOp::Tilde, rest)
        } else {
            (SpecOp::Exact, spec)
        };
        let rest = rest.trim();
        if rest.is_empty() || !rest.starts_with(|ch: char| ch.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            op,
            version: Version::coerce(rest),
        })
    }

    /// Parses a spec, falling back to coercing it into an exact constraint
    /// with a logged warning instead of failing.
    pub fn parse_lenient(package: &str, spec: &str) -> Self {
        match Self::parse(spec) {
            Some(parsed) => parsed,
            None => {
                let coerced = Version::coerce(spec);
                tracing::warn!(
                    package,
                    spec,
                    "could not parse version spec, coercing to exact match"
                );
                Self {
                    op: SpecOp::Exact,
                    version: coerced,
                }
            }
        }
    }

    pub fn matches(&self, installed: &Version) -> bool {
        match self.op {
            SpecOp::Exact => installed == &self.version,
            SpecOp::Ge => installed >= &self.version,
            SpecOp::Gt => installed > &self.version,
            SpecOp::Le => installed <= &self.version,
            SpecOp::Lt => installed < &self.version,
            SpecOp::Tilde => {
                let upper = Version::release(self.version.major, self.version.minor + 1, 0);
                installed >= &self.version && installed < &upper
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = "\
name: study-env
channels:
  - conda-forge
dependencies:
  - python=3.11.4=h2755cc3_0
  - numpy=1.26.0=py311h64a7726_0
  - scipy=1.11.3
  - pip:
      - chromapy==0.8.0
      - solverkit==2.1.0
";

    #[test]
    fn parses_both_sections_into_one_mapping() {
        let env = Environment::from_export(EXPORT).unwrap();
        assert_eq!(env.package_version("python"), Some("3.11.4"));
        assert_eq!(env.package_version("numpy"), Some("1.26.0"));
        assert_eq!(env.package_version("scipy"), Some("1.11.3"));
        assert_eq!(env.package_version("chromapy"), Some("0.8.0"));
        assert_eq!(env.package_version("solverkit"), Some("2.1.0"));
    }

    #[test]
    fn strips_terminal_escape_sequences() {
        let colored = format!("\x1b[32m{EXPORT}\x1b[0m");
        let env = Environment::from_export(&colored).unwrap();
        assert_eq!(env.package_version("numpy"), Some("1.26.0"));
    }

    #[test]
    fn coercion_normalizes_nonstandard_strings() {
        assert_eq!(Version::coerce("2023.1"), Version::release(2023, 1, 0));
        assert_eq!(Version::coerce("4"), Version::release(4, 0, 0));

        let with_underscore = Version::coerce("4.12.0_0");
        assert_eq!((with_underscore.major, with_underscore.minor), (4, 12));
        assert!(with_underscore.is_prerelease());

        let four_components = Version::coerce("1.2.3.4");
        assert_eq!(four_components.build, "4");
        assert!(!four_components.is_prerelease());
        assert!(four_components >= Version::coerce("1.2.3"));

        let rc = Version::coerce("0.8.0rc1");
        assert_eq!(
            rc.pre,
            vec![
                PreIdentifier::Alpha("rc1".to_string()),
            ]
        );
    }

    #[test]
    fn prerelease_sorts_below_release() {
        assert!(Version::coerce("1.0.0-rc1") < Version::coerce("1.0.0"));
        assert!(Version::coerce("1.0.0-rc1") > Version::coerce("0.9.9"));
    }

    #[test]
    fn fulfils_applies_semantic_comparison() {
        let env = Environment::from_pairs([("numpy", "1.26.0"), ("pandas", "2.1.0rc0")]);
        assert!(env.fulfils("numpy", ">=1.20"));
        assert!(env.fulfils("numpy", "~1.26.0"));
        assert!(env.fulfils("numpy", "1.26.0"));
        assert!(!env.fulfils("numpy", ">=2.0"));
        assert!(!env.fulfils("numpy", "~1.25.0"));
        // Exact match must match pre-release suffixes.
        assert!(!env.fulfils("pandas", "2.1.0"));
        assert!(!env.fulfils("absent", ">=0.1"));
    }

    #[test]
    fn environment_requirement_is_a_conjunction() {
        let env = Environment::from_pairs([("numpy", "1.26.0"), ("scipy", "1.11.3")]);
        let satisfied = Environment::from_pairs([("numpy", ">=1.20"), ("scipy", "~1.11.0")]);
        let unsatisfied = Environment::from_pairs([("numpy", ">=1.20"), ("scipy", ">=2.0")]);
        assert!(env.fulfils_environment(Some(&satisfied)));
        assert!(!env.fulfils_environment(Some(&unsatisfied)));
        assert!(env.fulfils_environment(None));
    }
}
