//! Fleethelm core capabilities: validation seam, versioned packages, tie-break.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A validation failure for a single configuration entity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{entity}: {reason}")]
pub struct ValidationError {
    pub entity: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { entity: entity.into(), reason: reason.into() }
    }
}

/// Implemented by every configuration entity. `validate` may prune invalid
/// children from owned collections as a side effect, so it takes `&mut self`.
pub trait Validatable {
    /// Short human label used in logs and error messages.
    fn describe(&self) -> String;
    /// Validate this entity bottom-up. Failures of children pruned along the
    /// way are appended to `report`; the returned list holds only failures
    /// that invalidate this entity itself (empty = valid). Failures are
    /// accumulated, never cut short at the first one.
    fn validate(&mut self, report: &mut Vec<ValidationError>) -> Vec<ValidationError>;
}

/// Rebuild `items` keeping only entities that validate. Every invalid
/// entity's own failures land in `report` exactly once (descendant failures
/// were already reported by the entity's `validate`). Collections are rebuilt
/// rather than index-deleted in place.
pub fn retain_valid<T: Validatable>(items: &mut Vec<T>, report: &mut Vec<ValidationError>) {
    let drained: Vec<T> = items.drain(..).collect();
    for mut item in drained {
        let errs = item.validate(report);
        if errs.is_empty() {
            items.push(item);
        } else {
            tracing::warn!(entity = %item.describe(), failures = errs.len(), "dropping entity that failed validation");
            report.extend(errs);
        }
    }
}

/// A deployable package identified by name, version and last-modified time.
/// Implemented by registry records and deployed releases alike, so the two
/// can be compared without downcasting.
pub trait VersionedPackage {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn modified(&self) -> DateTime<Utc>;
}

/// Which side of a comparison holds the newer package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Newer {
    Left,
    Right,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// Comparing unrelated packages is meaningless.
    #[error("package names {left} and {right} do not match")]
    NameMismatch { left: String, right: String },
}

/// Pick the newer of two same-named packages.
///
/// With `decide_by_version` the versions are compared as semver (a leading
/// `v` is tolerated); strictly greater wins. An indecisive
/// comparison (equal, or either side unparseable) falls through to the
/// last-modified timestamps, where strictly later wins. An exact timestamp
/// tie resolves to [`Newer::Right`]: the most recently considered record is
/// the documented default.
///
/// Deterministic for identical inputs.
pub fn resolve_newer(
    a: &dyn VersionedPackage,
    b: &dyn VersionedPackage,
    decide_by_version: bool,
) -> Result<Newer, ResolveError> {
    if a.name() != b.name() {
        return Err(ResolveError::NameMismatch {
            left: a.name().to_string(),
            right: b.name().to_string(),
        });
    }

    if decide_by_version {
        let parse = |v: &str| semver::Version::parse(v.strip_prefix('v').unwrap_or(v));
        if let (Ok(va), Ok(vb)) = (parse(a.version()), parse(b.version())) {
            match va.cmp(&vb) {
                std::cmp::Ordering::Greater => return Ok(Newer::Left),
                std::cmp::Ordering::Less => return Ok(Newer::Right),
                std::cmp::Ordering::Equal => {} // fall through to timestamps
            }
        }
    }

    if a.modified() > b.modified() {
        Ok(Newer::Left)
    } else {
        Ok(Newer::Right)
    }
}

/// Split a `{name}-{version}` stem on the last hyphen. Returns `None` when
/// either side would be empty. Hyphenated package names keep their hyphens:
/// `my-app-1.2.3` splits into (`my-app`, `1.2.3`).
///
/// Caution: a name whose final segment looks like a version (`app-v2-1.0.0`
/// vs `app-v2.1.0.0`) can still misparse; callers reject records whose
/// version side is implausible via semver where they decide by version.
pub fn split_name_version(stem: &str) -> Option<(&str, &str)> {
    let idx = stem.rfind('-')?;
    let (name, version) = (&stem[..idx], &stem[idx + 1..]);
    if name.is_empty() || version.is_empty() {
        return None;
    }
    Some((name, version))
}
