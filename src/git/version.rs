//! Git version parsing and minimum requirements

use std::fmt;

/// Oldest git that supports everything the checkout path relies on
/// (wire protocol v2, partial fetch refspecs).
pub const MINIMUM_GIT_VERSION: GitVersion = GitVersion::new(2, 18, 0);

/// Oldest usable git-lfs.
pub const MINIMUM_GIT_LFS_VERSION: GitVersion = GitVersion::new(2, 1, 0);

/// Oldest git with a usable `sparse-checkout` subcommand.
pub const MINIMUM_GIT_SPARSE_CHECKOUT_VERSION: GitVersion = GitVersion::new(2, 28, 0);

/// A parsed `major.minor.patch` git version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GitVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl GitVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for GitVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Pulls the first `major.minor[.patch]` out of a version banner.
///
/// Handles the shapes git actually prints, e.g.
/// `git version 2.39.2`, `git version 2.39.2.windows.1`, and
/// `git-lfs/3.4.0 (GitHub; linux amd64; go 1.21)`.
pub fn parse(output: &str) -> Option<GitVersion> {
    let start = output.find(|c: char| c.is_ascii_digit())?;
    let run: String = output[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    let mut parts = run.split('.').filter(|p| !p.is_empty());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

    Some(GitVersion::new(major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_banner() {
        assert_eq!(parse("git version 2.39.2\n"), Some(GitVersion::new(2, 39, 2)));
    }

    #[test]
    fn parses_two_part_version() {
        assert_eq!(parse("git version 2.18"), Some(GitVersion::new(2, 18, 0)));
    }

    #[test]
    fn parses_windows_banner() {
        assert_eq!(
            parse("git version 2.39.2.windows.1"),
            Some(GitVersion::new(2, 39, 2))
        );
    }

    #[test]
    fn parses_lfs_banner() {
        assert_eq!(
            parse("git-lfs/3.4.0 (GitHub; linux amd64; go 1.21)"),
            Some(GitVersion::new(3, 4, 0))
        );
    }

    #[test]
    fn rejects_no_digits() {
        assert_eq!(parse("not a version"), None);
    }

    #[test]
    fn rejects_single_component() {
        assert_eq!(parse("garbage 7 here"), None);
    }

    #[test]
    fn ordering_matches_semver() {
        assert!(GitVersion::new(2, 18, 0) < GitVersion::new(2, 19, 0));
        assert!(GitVersion::new(2, 18, 1) > GitVersion::new(2, 18, 0));
        assert!(GitVersion::new(3, 0, 0) > GitVersion::new(2, 99, 99));
        assert!(GitVersion::new(2, 28, 0) >= MINIMUM_GIT_SPARSE_CHECKOUT_VERSION);
        assert!(GitVersion::new(2, 17, 9) < MINIMUM_GIT_VERSION);
    }
}
