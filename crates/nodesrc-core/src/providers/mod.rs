//! Lockfile dialects: parsing lockfiles into packages and turning packages
//! into manifest sources.

pub mod npm;
pub mod pnpm;
pub mod rc;
pub mod yarn;

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use nodesrc_schema::{GitSource, HashAlgorithm, Integrity, Package, RegistrySource};

use crate::cache::Cache;
use crate::error::{FetchError, GenerateError, ParseError};
use crate::fetch::Fetcher;
use crate::manifest::ManifestGenerator;
use crate::metadata::RemoteMetadata;
use crate::paths::data_root;
use crate::special::SpecialSourceProvider;

pub use rc::RcConfig;

/// Default public registry.
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org";

/// Parses one lockfile format.
pub trait LockfileProvider: Send + Sync + std::fmt::Debug {
    /// Every package the lockfile pins, in file order.
    fn parse(&self, path: &Path) -> Result<Vec<Package>, ParseError>;
}

/// Emits the sources for one package manager's offline cache layout.
#[async_trait]
pub trait ModuleProvider: Send + Sync + std::fmt::Debug {
    /// Add every source `package` needs. Safe to call concurrently.
    async fn generate_package(&self, package: &Package) -> Result<(), GenerateError>;

    /// Emit whatever depends on the complete package set. Called once after
    /// every package has been generated successfully.
    fn finalize(&self) -> Result<(), GenerateError>;
}

/// Which entries survive a production-only run.
///
/// Dialects disagree on how an entry without a dev flag should be read, so
/// each provider states its default explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevelPolicy {
    /// Keep dev entries.
    pub include_devel: bool,
    /// How to treat an entry that carries no dev flag at all.
    pub unflagged_is_devel: bool,
}

impl DevelPolicy {
    /// Unflagged entries count as production dependencies.
    pub fn production_default(include_devel: bool) -> Self {
        Self {
            include_devel,
            unflagged_is_devel: false,
        }
    }

    pub fn keeps(&self, dev: Option<bool>) -> bool {
        self.include_devel || !dev.unwrap_or(self.unflagged_is_devel)
    }
}

/// Knobs shared by the lockfile and module providers.
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    pub registry: String,
    pub include_devel: bool,
    pub no_autopatch: bool,
    pub no_trim_index: bool,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            registry: DEFAULT_REGISTRY.to_string(),
            include_devel: true,
            no_autopatch: false,
            no_trim_index: false,
        }
    }
}

/// Everything a module provider writes to or reads from.
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub generator: Arc<ManifestGenerator>,
    pub fetcher: Arc<dyn Fetcher>,
    pub cache: Arc<dyn Cache>,
    pub special: Arc<SpecialSourceProvider>,
    /// Directory of the lockfile named on the command line; patch scripts are
    /// laid out relative to it.
    pub lockfile_root: PathBuf,
    /// rc configuration per lockfile path.
    pub configs: HashMap<PathBuf, RcConfig>,
}

impl ProviderContext {
    /// Declared integrity, or one computed by streaming the tarball.
    pub async fn retrieve_integrity(&self, source: &RegistrySource) -> Result<Integrity, FetchError> {
        match &source.integrity {
            Some(integrity) => Ok(integrity.clone()),
            None => {
                let metadata = RemoteMetadata::get(
                    self.fetcher.as_ref(),
                    &self.cache,
                    &source.url,
                    true,
                    HashAlgorithm::Sha256,
                )
                .await?;
                Ok(metadata.integrity)
            }
        }
    }

    /// Lockfile directory relative to [`ProviderContext::lockfile_root`].
    pub fn relative_lockfile_dir(&self, lockfile_dir: &Path) -> PathBuf {
        lockfile_dir
            .strip_prefix(&self.lockfile_root)
            .unwrap_or(lockfile_dir)
            .to_path_buf()
    }
}

/// Supported package managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Npm,
    Yarn,
    Pnpm,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Yarn => "yarn",
            Self::Pnpm => "pnpm",
        }
    }

    /// Conventional lockfile basename.
    pub fn lockfile_name(self) -> &'static str {
        match self {
            Self::Npm => "package-lock.json",
            Self::Yarn => "yarn.lock",
            Self::Pnpm => "pnpm-lock.yaml",
        }
    }

    /// rc files consulted next to (and above) each lockfile, highest
    /// precedence first.
    pub fn rc_files(self) -> &'static [&'static str] {
        match self {
            Self::Npm | Self::Pnpm => &[".npmrc"],
            Self::Yarn => &[".yarnrc", ".npmrc"],
        }
    }

    pub fn lockfile_provider(self, options: &ProviderOptions) -> Box<dyn LockfileProvider> {
        let devel = DevelPolicy::production_default(options.include_devel);
        match self {
            Self::Npm => Box::new(npm::NpmLockfileProvider::new(devel)),
            Self::Yarn => Box::new(yarn::YarnLockfileProvider),
            Self::Pnpm => Box::new(pnpm::PnpmLockfileProvider::new(devel, &options.registry)),
        }
    }

    pub fn module_provider(
        self,
        context: ProviderContext,
        options: &ProviderOptions,
    ) -> Arc<dyn ModuleProvider> {
        match self {
            Self::Npm => Arc::new(npm::NpmModuleProvider::new(context, options)),
            Self::Yarn => Arc::new(yarn::YarnModuleProvider::new(context)),
            Self::Pnpm => Arc::new(pnpm::PnpmModuleProvider::new(context)),
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "npm" => Ok(Self::Npm),
            "yarn" => Ok(Self::Yarn),
            "pnpm" => Ok(Self::Pnpm),
            other => Err(format!("unknown package manager '{other}'")),
        }
    }
}

/// `flatpak-node/git-packages/<repo>-<commit>`
///
/// Derived from the repository and commit only, so every package pinned to
/// the same commit shares one checkout.
pub fn git_checkout_dir(source: &GitSource) -> PathBuf {
    data_root()
        .join("git-packages")
        .join(format!("{}-{}", source.repo_name(), source.commit))
}

/// Quote `value` for a POSIX shell, leaving safe words untouched.
pub fn shell_quote(value: &str) -> Cow<'_, str> {
    let safe = |c: char| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c);
    if !value.is_empty() && value.chars().all(safe) {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("'{}'", value.replace('\'', "'\"'\"'")))
    }
}

/// Relative path from `base` to `target`, both relative to the same root.
pub fn relative_path(target: &Path, base: &Path) -> PathBuf {
    let target: Vec<_> = target.components().collect();
    let base: Vec<_> = base.components().collect();
    let common = target
        .iter()
        .zip(&base)
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for component in &target[common..] {
        relative.push(component.as_os_str());
    }
    relative
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::cache::NullCache;
    use crate::special::SpecialOptions;

    /// A context wired to `fetcher` with no cache and default special sources.
    pub(crate) fn context(fetcher: Arc<dyn Fetcher>, lockfile_root: &Path) -> ProviderContext {
        let generator = Arc::new(ManifestGenerator::new());
        let cache: Arc<dyn Cache> = Arc::new(NullCache);
        let special = Arc::new(SpecialSourceProvider::new(
            generator.clone(),
            fetcher.clone(),
            cache.clone(),
            SpecialOptions::default(),
        ));
        ProviderContext {
            generator,
            fetcher,
            cache,
            special,
            lockfile_root: lockfile_root.to_path_buf(),
            configs: HashMap::new(),
        }
    }
}
