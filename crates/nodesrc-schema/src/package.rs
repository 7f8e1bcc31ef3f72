//! The uniform package model every lockfile dialect is parsed into.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::integrity::Integrity;

/// A lockfile a package was read from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lockfile {
    /// Path to the lockfile as given on the command line.
    pub path: PathBuf,
    /// Major format version declared by the lockfile.
    pub version: u32,
}

impl Lockfile {
    /// Create a shared lockfile reference.
    pub fn new(path: impl Into<PathBuf>, version: u32) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            version,
        })
    }

    /// Directory containing the lockfile.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }
}

/// One pinned dependency.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Package {
    /// Package name, including any `@scope/` prefix.
    pub name: String,
    /// Exact version from the lockfile.
    pub version: String,
    /// Where the artifact comes from.
    pub source: PackageSource,
    /// The lockfile that named this package.
    pub lockfile: Arc<Lockfile>,
}

/// Deduplication key for [`Package`].
///
/// Registry and local packages collapse across lockfiles. Git packages keep
/// the lockfile because the textual patch pass runs per lockfile.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageKey {
    name: String,
    version: String,
    source: PackageSource,
    lockfile: Option<PathBuf>,
}

impl Package {
    /// Identity used to collapse duplicates.
    pub fn key(&self) -> PackageKey {
        let lockfile = match self.source {
            PackageSource::Git(_) => Some(self.lockfile.path.clone()),
            PackageSource::Registry(_) | PackageSource::Local(_) => None,
        };
        PackageKey {
            name: self.name.clone(),
            version: self.version.clone(),
            source: self.source.clone(),
            lockfile,
        }
    }
}

impl std::fmt::Display for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Where a package's artifact is fetched from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PackageSource {
    /// A registry tarball.
    Registry(RegistrySource),
    /// A repository pinned at a commit.
    Git(GitSource),
    /// A workspace-relative directory; contributes no network source.
    Local(LocalSource),
}

/// A tarball resolved by the registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegistrySource {
    /// Tarball URL.
    pub url: String,
    /// Declared hash, when the lockfile carries one.
    pub integrity: Option<Integrity>,
}

/// A path dependency.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalSource {
    /// Path relative to the lockfile directory.
    pub path: String,
}

/// Errors from [`GitSource::parse`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecifierError {
    #[error("Git specifier '{0}' has no commit fragment")]
    MissingCommit(String),

    #[error("Git specifier '{0}' has no scheme")]
    MissingScheme(String),

    #[error("Unsupported git scheme '{scheme}' in '{specifier}'")]
    UnsupportedScheme { scheme: String, specifier: String },

    #[error("Git specifier '{0}' has no repository path")]
    MissingPath(String),
}

/// A git-pinned package.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GitSource {
    /// The specifier exactly as the lockfile wrote it.
    pub original: String,
    /// Canonical clone URL.
    pub url: String,
    /// Pinned commit.
    pub commit: String,
    /// The manifest-side specifier (npm's `from`), if known.
    pub from: Option<String>,
}

/// Hosted shorthands expand to an https URL on a fixed host.
const SHORTHAND_HOSTS: [(&str, &str); 3] = [
    ("github", "github.com"),
    ("gitlab", "gitlab.com"),
    ("bitbucket", "bitbucket.org"),
];

fn transport_scheme(scheme: &str) -> Option<&'static str> {
    match scheme {
        "git" => Some("git"),
        "git+http" | "http" => Some("http"),
        "git+https" | "https" => Some("https"),
        "git+ssh" | "ssh" => Some("ssh"),
        "git+file" | "file" => Some("file"),
        _ => None,
    }
}

impl GitSource {
    /// Normalise a compact git specifier (`git+https://host/repo#commit`,
    /// `github:owner/repo#commit`, `git:host/repo#commit`, ...).
    ///
    /// Every dialect goes through this one routine so they agree on the
    /// canonical URL: plain transport scheme, lower-cased scheme and host, no
    /// trailing `/` or `.git`.
    pub fn parse(specifier: &str, from: Option<String>) -> Result<Self, SpecifierError> {
        let (base, commit) = specifier
            .split_once('#')
            .filter(|(_, commit)| !commit.is_empty())
            .ok_or_else(|| SpecifierError::MissingCommit(specifier.to_string()))?;

        let (scheme, rest) = base
            .split_once(':')
            .filter(|(scheme, _)| !scheme.is_empty())
            .ok_or_else(|| SpecifierError::MissingScheme(specifier.to_string()))?;
        let scheme = scheme.to_ascii_lowercase();

        let (transport, authority, path) = if let Some((_, host)) =
            SHORTHAND_HOSTS.iter().find(|(short, _)| *short == scheme)
        {
            ("https", (*host).to_string(), rest.trim_start_matches('/'))
        } else {
            let transport =
                transport_scheme(&scheme).ok_or_else(|| SpecifierError::UnsupportedScheme {
                    scheme: scheme.clone(),
                    specifier: specifier.to_string(),
                })?;
            // `git:host/path` has no `//`; the first segment is the host.
            let rest = rest.strip_prefix("//").unwrap_or(rest);
            let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
            (transport, lowercase_host(authority), path)
        };

        let path = path.trim_end_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path).trim_end_matches('/');
        if path.is_empty() && transport != "file" {
            return Err(SpecifierError::MissingPath(specifier.to_string()));
        }

        Ok(Self {
            original: specifier.to_string(),
            url: format!("{transport}://{authority}/{path}"),
            commit: commit.to_string(),
            from,
        })
    }

    /// Last path segment of the clone URL.
    pub fn repo_name(&self) -> &str {
        self.url.rsplit('/').next().unwrap_or(&self.url)
    }
}

/// Lower-case the host part of `user@host:port`, leaving userinfo alone.
fn lowercase_host(authority: &str) -> String {
    match authority.rsplit_once('@') {
        Some((user, host)) => format!("{user}@{}", host.to_ascii_lowercase()),
        None => authority.to_ascii_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(specifier: &str) -> GitSource {
        GitSource::parse(specifier, None).unwrap()
    }

    #[test]
    fn git_plus_https_is_rewritten() {
        let source = parse("git+https://example.com/org/repo#abcdef123456");
        assert_eq!(source.url, "https://example.com/org/repo");
        assert_eq!(source.commit, "abcdef123456");
        assert_eq!(source.original, "git+https://example.com/org/repo#abcdef123456");
    }

    #[test]
    fn shorthands_expand_to_hosts() {
        assert_eq!(
            parse("github:owner/repo#c0ffee").url,
            "https://github.com/owner/repo"
        );
        assert_eq!(
            parse("gitlab:owner/repo#c0ffee").url,
            "https://gitlab.com/owner/repo"
        );
        assert_eq!(
            parse("bitbucket:owner/repo#c0ffee").url,
            "https://bitbucket.org/owner/repo"
        );
    }

    #[test]
    fn suffixes_and_case_are_normalised() {
        let source = parse("git+SSH://git@GitHub.com/Owner/Repo.git/#1234");
        assert_eq!(source.url, "ssh://git@github.com/Owner/Repo");
    }

    #[test]
    fn bare_git_scheme_gains_authority() {
        assert_eq!(
            parse("git:github.com/owner/repo#1234").url,
            "git://github.com/owner/repo"
        );
        assert_eq!(
            parse("git://github.com/owner/repo.git#1234").url,
            "git://github.com/owner/repo"
        );
    }

    #[test]
    fn same_repo_from_different_spellings_agree() {
        let a = parse("git+https://github.com/owner/repo.git#1234");
        let b = parse("github:owner/repo#1234");
        assert_eq!(a.url, b.url);
        assert_ne!(a.original, b.original);
    }

    #[test]
    fn rejects_missing_commit_and_unknown_scheme() {
        assert!(matches!(
            GitSource::parse("git+https://example.com/repo", None),
            Err(SpecifierError::MissingCommit(_))
        ));
        assert!(matches!(
            GitSource::parse("svn://example.com/repo#1", None),
            Err(SpecifierError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn git_packages_keep_their_lockfile_in_the_key() {
        let a = Lockfile::new("a/package-lock.json", 2);
        let b = Lockfile::new("b/package-lock.json", 2);
        let registry = PackageSource::Registry(RegistrySource {
            url: "https://registry.example/x/-/x-1.0.0.tgz".into(),
            integrity: None,
        });
        let git = PackageSource::Git(parse("github:o/x#1"));

        let make = |source: &PackageSource, lockfile: &Arc<Lockfile>| Package {
            name: "x".into(),
            version: "1.0.0".into(),
            source: source.clone(),
            lockfile: lockfile.clone(),
        };

        assert_eq!(make(&registry, &a).key(), make(&registry, &b).key());
        assert_ne!(make(&git, &a).key(), make(&git, &b).key());
    }
}
