//! yarn v1: the `yarn.lock` text format and an offline mirror.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use nodesrc_schema::{
    GitRevision, GitSource, Integrity, LocalSource, Lockfile, Package, PackageSource,
    RegistrySource,
};
use regex::Regex;
use tracing::debug;

use super::{LockfileProvider, ModuleProvider, ProviderContext, relative_path};
use crate::error::{GenerateError, ParseError};
use crate::paths::{data_root, tmp_root};

const LOCKFILE_VERSION: u32 = 1;

static LOCAL_CONSTRAINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:file|link):").expect("local pattern is valid"));

static GIT_URL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^git:",
        r"^git\+.+:",
        r"^ssh:",
        r"^https?:.+\.git$",
        r"^https?:.+\.git#.+",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("git url pattern is valid"))
    .collect()
});

const GIT_URL_HOSTS: [&str; 4] = ["github.com", "gitlab.com", "bitbucket.com", "bitbucket.org"];

/// yarn's own tarball naming, see `tarball-fetcher.js`.
static TARBALL_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(@[^/]+)(?:/|%2f))?[^/]+/(?:-|_attachments)/(?:@[^/]+/)?([^/]+)$")
        .expect("tarball pattern is valid")
});

/// Host and path of an absolute URL, without query or fragment.
fn host_and_path(url: &str) -> Option<(&str, &str)> {
    let (_, rest) = url.split_once("://")?;
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);
    Some(rest.split_once('/').unwrap_or((rest, "")))
}

/// Whether a `resolved` URL points at a repository rather than a tarball.
pub fn is_git_version(version: &str) -> bool {
    if GIT_URL_PATTERNS.iter().any(|pattern| pattern.is_match(version)) {
        return true;
    }
    match host_and_path(version) {
        Some((host, path)) if GIT_URL_HOSTS.contains(&host) => {
            path.split('/').filter(|part| !part.is_empty()).count() == 2
        }
        _ => false,
    }
}

/// Version of a lockfile that is not yarn v1: a yarn 2+ `__metadata` block
/// or a `# yarn lockfile vN` marker with another version.
fn foreign_version(text: &str) -> Option<String> {
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        if let Some(marker) = line.strip_prefix("# yarn lockfile v") {
            let marker = marker.trim();
            if marker != LOCKFILE_VERSION.to_string() {
                return Some(marker.to_string());
            }
        } else if line.trim_end() == "__metadata:" {
            let version = lines
                .by_ref()
                .take_while(|line| line.starts_with(' '))
                .find_map(|line| line.trim().strip_prefix("version:"))
                .map_or("unknown", str::trim);
            return Some(format!("berry {version}"));
        }
    }
    None
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Reads `yarn.lock` v1. The format has no dev flag, so every entry is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct YarnLockfileProvider;

impl YarnLockfileProvider {
    fn parse_section(
        lockfile: &Arc<Lockfile>,
        line_no: usize,
        section: &[&str],
    ) -> Result<Package, ParseError> {
        let syntax = |message: String| ParseError::Syntax {
            path: lockfile.path.clone(),
            line: line_no,
            message,
        };

        let header = section[0]
            .strip_suffix(':')
            .ok_or_else(|| syntax(format!("expected a package header, found '{}'", section[0])))?;
        let first = unquote(header.split(',').next().unwrap_or(header).trim());
        let (name, constraint) = first
            .rsplit_once('@')
            .filter(|(name, _)| !name.is_empty())
            .ok_or_else(|| syntax(format!("no version constraint in '{first}'")))?;

        let mut version = None;
        let mut resolved = None;
        let mut integrity = None;
        let mut section_indent = 0;

        for line in &section[1..] {
            let indent = line.len() - line.trim_start().len();
            if section_indent == 0 {
                section_indent = indent;
            } else if indent > section_indent {
                // Nested block such as `dependencies:`.
                continue;
            }

            let Some((key, value)) = line.trim().split_once(' ') else {
                continue;
            };
            let value = unquote(value.trim());
            match unquote(key) {
                "version" => version = Some(value.to_string()),
                "resolved" => resolved = Some(value.to_string()),
                "integrity" => {
                    let first = value.split(' ').next().unwrap_or(value);
                    integrity = Some(Integrity::parse(first).map_err(|source| {
                        ParseError::Integrity {
                            path: lockfile.path.clone(),
                            entry: name.to_string(),
                            source,
                        }
                    })?);
                }
                _ => {}
            }
        }

        let entry = |message: &str| ParseError::Entry {
            path: lockfile.path.clone(),
            entry: first.to_string(),
            message: message.to_string(),
        };
        let version = version.ok_or_else(|| entry("missing 'version'"))?;

        let source = if LOCAL_CONSTRAINT.is_match(constraint) {
            PackageSource::Local(LocalSource {
                path: LOCAL_CONSTRAINT.replace(constraint, "").into_owned(),
            })
        } else {
            let resolved = resolved.ok_or_else(|| entry("missing 'resolved'"))?;
            if is_git_version(&resolved) {
                let git = GitSource::parse(&resolved, None).map_err(|source| {
                    ParseError::Specifier {
                        path: lockfile.path.clone(),
                        entry: first.to_string(),
                        source,
                    }
                })?;
                PackageSource::Git(git)
            } else {
                // Old lockfiles only carry a sha1 in the URL fragment.
                let integrity = match integrity {
                    Some(integrity) => Some(integrity),
                    None => resolved
                        .split_once('#')
                        .and_then(|(_, fragment)| Integrity::from_sha1(fragment).ok()),
                };
                PackageSource::Registry(RegistrySource {
                    url: resolved,
                    integrity,
                })
            }
        };

        Ok(Package {
            name: name.to_string(),
            version,
            source,
            lockfile: lockfile.clone(),
        })
    }
}

impl LockfileProvider for YarnLockfileProvider {
    fn parse(&self, path: &Path) -> Result<Vec<Package>, ParseError> {
        let text = std::fs::read_to_string(path).map_err(|source| ParseError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(version) = foreign_version(&text) {
            return Err(ParseError::UnsupportedVersion {
                path: path.to_path_buf(),
                version,
                hint: "only yarn v1 lockfiles are supported",
            });
        }
        let lockfile = Lockfile::new(path, LOCKFILE_VERSION);

        let mut sections: Vec<(usize, Vec<&str>)> = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim_end();
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if trimmed.len() == line.len() {
                sections.push((idx + 1, vec![line]));
            } else {
                match sections.last_mut() {
                    Some((_, section)) => section.push(line),
                    None => {
                        return Err(ParseError::Syntax {
                            path: path.to_path_buf(),
                            line: idx + 1,
                            message: "indented line outside of a package block".to_string(),
                        });
                    }
                }
            }
        }

        let packages = sections
            .iter()
            .map(|(line_no, section)| Self::parse_section(&lockfile, *line_no, section))
            .collect::<Result<Vec<_>, _>>()?;
        debug!("{}: {} packages", path.display(), packages.len());
        Ok(packages)
    }
}

fn mirror_dir() -> PathBuf {
    data_root().join("yarn-mirror")
}

/// File name yarn expects for `url` in its offline mirror.
fn mirror_filename(url: &str) -> String {
    let path = host_and_path(url).map_or(url, |(_, path)| path);
    match TARBALL_URL.captures(path) {
        Some(caps) => match (caps.get(1), caps.get(2)) {
            (Some(scope), Some(file)) => format!("{}-{}", scope.as_str(), file.as_str()),
            (None, Some(file)) => file.as_str().to_string(),
            _ => crate::paths::filename_from_url(url).to_string(),
        },
        None => crate::paths::filename_from_url(url).to_string(),
    }
}

/// Fills `yarn-offline-mirror` with tarballs and archived git checkouts.
#[derive(Debug)]
pub struct YarnModuleProvider {
    context: ProviderContext,
}

impl YarnModuleProvider {
    pub fn new(context: ProviderContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl ModuleProvider for YarnModuleProvider {
    async fn generate_package(&self, package: &Package) -> Result<(), GenerateError> {
        let generator = &self.context.generator;

        match &package.source {
            PackageSource::Registry(source) => {
                let integrity = self.context.retrieve_integrity(source).await?;
                let dest = mirror_dir().join(mirror_filename(&source.url));
                generator.add_url_source(&source.url, &integrity, &dest, &[])?;
            }
            PackageSource::Git(source) => {
                let name = format!("{}-{}", source.repo_name(), source.commit);
                let repo_dir = tmp_root().join(&name);
                let target_tar = relative_path(&mirror_dir().join(&name), &repo_dir);

                generator.add_git_source(
                    &source.url,
                    GitRevision::Commit(source.commit.clone()),
                    &repo_dir,
                )?;
                generator.add_package_commands(
                    &package.to_string(),
                    vec![
                        format!("mkdir -p {}", mirror_dir().display()),
                        format!(
                            "cd {}; git archive --format tar -o {} HEAD",
                            repo_dir.display(),
                            target_tar.display()
                        ),
                    ],
                );
            }
            PackageSource::Local(LocalSource { path }) => {
                let manifest = package.lockfile.dir().join(path).join("package.json");
                if !manifest.is_file() {
                    return Err(GenerateError::unsupported(
                        package,
                        format!("local package has no {}", manifest.display()),
                    ));
                }
            }
        }

        self.context.special.generate_special_sources(package).await
    }

    fn finalize(&self) -> Result<(), GenerateError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::StubFetcher;
    use crate::providers::test_support::context;
    use nodesrc_schema::{FileOrigin, HashAlgorithm, Source};

    fn lockfile(dir: &Path, integrity: &str) -> PathBuf {
        let path = dir.join("yarn.lock");
        let body = format!(
            r#"# THIS IS AN AUTOGENERATED FILE. DO NOT EDIT THIS FILE DIRECTLY.
# yarn lockfile v1


"@babel/code-frame@^7.0.0", "@babel/code-frame@^7.10.4":
  version "7.12.13"
  resolved "https://registry.yarnpkg.com/@babel/code-frame/-/code-frame-7.12.13.tgz#dcfc826beef65e75c50e21d3837d7d95798dd658"
  integrity {integrity}
  dependencies:
    "@babel/highlight" "^7.12.13"

left-pad@^1.3.0:
  version "1.3.0"
  resolved "https://registry.yarnpkg.com/left-pad/-/left-pad-1.3.0.tgz#5b8a3a7765dfe001261dde915589e782f8c94d1e"

"repo@git+https://example.com/org/repo.git#abcdef123456":
  version "1.0.0"
  resolved "git+https://example.com/org/repo.git#abcdef123456"

"sibling@file:../sibling":
  version "0.1.0"
"#
        );
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn rejects_berry_lockfiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("yarn.lock");
        std::fs::write(
            &path,
            "__metadata:\n  version: 6\n  cacheKey: 8\n\n\"left-pad@npm:^1.3.0\":\n  version: 1.3.0\n  resolution: \"left-pad@npm:1.3.0\"\n",
        )
        .unwrap();

        match YarnLockfileProvider.parse(&path) {
            Err(ParseError::UnsupportedVersion { version, .. }) => assert_eq!(version, "berry 6"),
            other => panic!("expected an unsupported version, got {other:?}"),
        }

        std::fs::write(&path, "# yarn lockfile v2\n").unwrap();
        assert!(matches!(
            YarnLockfileProvider.parse(&path),
            Err(ParseError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn git_detection() {
        assert!(is_git_version("git+https://example.com/org/repo.git#abc"));
        assert!(is_git_version("git://github.com/org/repo"));
        assert!(is_git_version("https://example.com/org/repo.git"));
        assert!(is_git_version("https://github.com/org/repo#abc"));
        assert!(!is_git_version("https://github.com/org/repo/archive/x.tgz"));
        assert!(!is_git_version("https://registry.yarnpkg.com/left-pad/-/left-pad-1.3.0.tgz"));
    }

    #[test]
    fn mirror_names_keep_the_scope() {
        assert_eq!(
            mirror_filename("https://registry.yarnpkg.com/@babel/code-frame/-/code-frame-7.12.13.tgz#abc"),
            "@babel-code-frame-7.12.13.tgz"
        );
        assert_eq!(
            mirror_filename("https://registry.npmjs.org/@types%2fnode/-/node-18.0.0.tgz"),
            "@types-node-18.0.0.tgz"
        );
        assert_eq!(
            mirror_filename("https://cdn.example/builds/thing.tgz"),
            "thing.tgz"
        );
    }

    #[test]
    fn sections_become_packages() {
        let dir = tempfile::tempdir().unwrap();
        let integrity = Integrity::generate("code-frame", HashAlgorithm::Sha512);
        let path = lockfile(dir.path(), &integrity.to_sri());

        let packages = YarnLockfileProvider.parse(&path).unwrap();
        assert_eq!(packages.len(), 4);

        assert_eq!(packages[0].name, "@babel/code-frame");
        assert_eq!(packages[0].version, "7.12.13");
        let PackageSource::Registry(registry) = &packages[0].source else {
            panic!("expected a registry source");
        };
        assert_eq!(registry.integrity.as_ref(), Some(&integrity));

        let PackageSource::Registry(left_pad) = &packages[1].source else {
            panic!("expected a registry source");
        };
        assert_eq!(
            left_pad.integrity,
            Some(Integrity::from_sha1("5b8a3a7765dfe001261dde915589e782f8c94d1e").unwrap())
        );

        let PackageSource::Git(git) = &packages[2].source else {
            panic!("expected a git source");
        };
        assert_eq!(git.url, "https://example.com/org/repo");
        assert_eq!(git.commit, "abcdef123456");

        assert_eq!(
            packages[3].source,
            PackageSource::Local(LocalSource {
                path: "../sibling".into()
            })
        );
    }

    #[test]
    fn missing_version_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("yarn.lock");
        std::fs::write(&path, "left-pad@^1.3.0:\n  resolved \"https://r.example/x.tgz\"\n").unwrap();
        assert!(matches!(
            YarnLockfileProvider.parse(&path),
            Err(ParseError::Entry { .. })
        ));
    }

    #[tokio::test]
    async fn mirror_and_git_archive_commands() {
        let dir = tempfile::tempdir().unwrap();
        let integrity = Integrity::generate("code-frame", HashAlgorithm::Sha512);
        let path = lockfile(dir.path(), &integrity.to_sri());

        let ctx = context(Arc::new(StubFetcher::new()), dir.path());
        let generator = ctx.generator.clone();
        let provider = YarnModuleProvider::new(ctx);

        let packages = YarnLockfileProvider.parse(&path).unwrap();
        for package in &packages[..3] {
            provider.generate_package(package).await.unwrap();
        }
        provider.finalize().unwrap();

        let sources = generator.ordered_sources();
        let mirror: Vec<String> = sources
            .iter()
            .filter_map(|source| match source {
                Source::File(file) if matches!(file.origin, FileOrigin::Url { .. }) => {
                    file.dest_filename.clone()
                }
                _ => None,
            })
            .collect();
        assert_eq!(mirror, ["@babel-code-frame-7.12.13.tgz", "left-pad-1.3.0.tgz"]);

        assert!(sources.iter().any(|source| matches!(
            source,
            Source::Git(git) if git.dest.as_deref() == Some("flatpak-node/tmp/repo-abcdef123456")
        )));

        let Some(Source::Shell(trailing)) = sources.last() else {
            panic!("expected the trailing shell source");
        };
        assert_eq!(
            trailing.commands,
            [
                "mkdir -p flatpak-node/yarn-mirror",
                "cd flatpak-node/tmp/repo-abcdef123456; git archive --format tar -o ../../yarn-mirror/repo-abcdef123456 HEAD",
            ]
        );
    }

    #[tokio::test]
    async fn local_packages_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let provider = YarnModuleProvider::new(context(Arc::new(StubFetcher::new()), dir.path()));
        let package = Package {
            name: "sibling".into(),
            version: "0.1.0".into(),
            source: PackageSource::Local(LocalSource {
                path: "sibling".into(),
            }),
            lockfile: Lockfile::new(dir.path().join("yarn.lock"), 1),
        };

        let err = provider.generate_package(&package).await.unwrap_err();
        assert!(matches!(err, GenerateError::UnsupportedSource { .. }));

        std::fs::create_dir_all(dir.path().join("sibling")).unwrap();
        std::fs::write(dir.path().join("sibling").join("package.json"), "{}").unwrap();
        provider.generate_package(&package).await.unwrap();
    }
}
