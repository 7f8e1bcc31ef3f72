//! pnpm: `pnpm-lock.yaml` v6/v7/v9 and a pre-populated content store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, PoisonError};

use async_trait::async_trait;
use nodesrc_schema::{
    GitRevision, GitSource, Integrity, LocalSource, Lockfile, Package, PackageSource,
    RegistrySource,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, warn};

use super::{
    DevelPolicy, LockfileProvider, ModuleProvider, ProviderContext, git_checkout_dir,
};
use crate::error::{GenerateError, ManifestError, ParseError};
use crate::paths::data_root;

/// Store layout used by every supported lockfile version.
pub const STORE_VERSION: &str = "v10";

// v6/v7 keys: `/name@version` or `/@scope/name@version`, maybe followed by a
// peer suffix such as `(react@18.2.0)`.
static V6_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/((?:@[^/]+/)?[^@]+)@([^(]+)").expect("v6 key pattern is valid")
});

// v9 keys: the same without the leading slash.
static V9_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^((?:@[^/]+/)?[^@]+)@([^(]+)").expect("v9 key pattern is valid")
});

/// Store population script run inside the build; needs only `python3`.
const STORE_SCRIPT: &str = include_str!("pnpm_store.py");

/// The tarball list handed to the store population script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnpmStoreManifest {
    pub store_version: String,
    /// Keyed by tarball file name.
    pub packages: BTreeMap<String, StorePackage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorePackage {
    pub name: String,
    pub version: String,
    pub integrity_hex: String,
    pub requires_build: bool,
}

pub fn tarball_dir() -> PathBuf {
    data_root().join("pnpm-tarballs")
}

pub fn store_dir() -> PathBuf {
    data_root().join("pnpm-store")
}

pub fn manifest_path() -> PathBuf {
    data_root().join("pnpm-manifest.json")
}

pub fn store_script_path() -> PathBuf {
    data_root().join("pnpm_store.py")
}

/// Reads the `packages` map of a pnpm lockfile.
///
/// v6/v7 entries may carry `dev: true`; unflagged entries are production
/// dependencies. v9 moved the flag out of `packages`, so every v9 entry is
/// kept.
#[derive(Debug, Clone)]
pub struct PnpmLockfileProvider {
    devel: DevelPolicy,
    registry: String,
}

impl PnpmLockfileProvider {
    pub fn new(devel: DevelPolicy, registry: &str) -> Self {
        Self {
            devel,
            registry: registry.trim_end_matches('/').to_string(),
        }
    }

    fn tarball_url(&self, name: &str, version: &str) -> String {
        let basename = name.rsplit('/').next().unwrap_or(name);
        format!("{}/{name}/-/{basename}-{version}.tgz", self.registry)
    }

    fn source(
        &self,
        lockfile: &Lockfile,
        key: &str,
        name: &str,
        version: &str,
        resolution: &Value,
    ) -> Result<PackageSource, ParseError> {
        let field = |field: &str| resolution.get(field).and_then(Value::as_str);

        if field("type") == Some("git") {
            let (Some(repo), Some(commit)) = (field("repo"), field("commit")) else {
                return Err(ParseError::Entry {
                    path: lockfile.path.clone(),
                    entry: key.to_string(),
                    message: "git resolution without repo and commit".to_string(),
                });
            };
            let git = GitSource::parse(&format!("git+{repo}#{commit}"), None).map_err(|source| {
                ParseError::Specifier {
                    path: lockfile.path.clone(),
                    entry: key.to_string(),
                    source,
                }
            })?;
            return Ok(PackageSource::Git(git));
        }

        if let Some(directory) = field("directory") {
            return Ok(PackageSource::Local(LocalSource {
                path: directory.to_string(),
            }));
        }

        let integrity = field("integrity")
            .map(Integrity::parse)
            .transpose()
            .map_err(|source| ParseError::Integrity {
                path: lockfile.path.clone(),
                entry: key.to_string(),
                source,
            })?;
        let url = field("tarball").map_or_else(|| self.tarball_url(name, version), str::to_string);

        Ok(PackageSource::Registry(RegistrySource { url, integrity }))
    }
}

impl LockfileProvider for PnpmLockfileProvider {
    fn parse(&self, path: &Path) -> Result<Vec<Package>, ParseError> {
        let text = std::fs::read_to_string(path).map_err(|source| ParseError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let data: Value = serde_yaml::from_str(&text).map_err(|source| ParseError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;

        let unsupported = |version: String, hint| ParseError::UnsupportedVersion {
            path: path.to_path_buf(),
            version,
            hint,
        };

        let raw_version = match data.get("lockfileVersion") {
            Some(Value::String(version)) => version.clone(),
            Some(Value::Number(version)) => version.to_string(),
            _ => return Err(unsupported("(missing)".to_string(), "no lockfileVersion field")),
        };
        if raw_version.starts_with('5') {
            return Err(unsupported(
                raw_version,
                "pnpm 5 lockfiles are not supported, regenerate it with pnpm 8 or later",
            ));
        }
        let major = match raw_version.parse::<f64>().map(|version| version as u32) {
            Ok(major @ (6 | 7 | 9)) => major,
            _ => return Err(unsupported(raw_version, "supported versions are 6, 7 and 9")),
        };

        let legacy_keys = major < 9;
        if !legacy_keys && !self.devel.include_devel {
            warn!(
                "{}: v9 lockfiles do not mark dev packages, all packages are included",
                path.display()
            );
        }

        let lockfile = Lockfile::new(path, major);
        let mut packages = Vec::new();
        let Some(entries) = data.get("packages").and_then(Value::as_mapping) else {
            return Ok(packages);
        };

        for (key, info) in entries {
            let Some(key) = key.as_str() else {
                continue;
            };
            if info.is_null() {
                continue;
            }

            let pattern = if legacy_keys { &*V6_KEY } else { &*V9_KEY };
            let Some(caps) = pattern.captures(key) else {
                debug!("Skipping unrecognised pnpm key {key}");
                continue;
            };
            let (name, version) = (caps[1].to_string(), caps[2].to_string());

            if legacy_keys && !self.devel.keeps(info.get("dev").and_then(Value::as_bool)) {
                continue;
            }

            let Some(resolution) = info.get("resolution").filter(|r| {
                r.as_mapping().is_some_and(|mapping| !mapping.is_empty())
            }) else {
                continue;
            };

            let source = self.source(&lockfile, key, &name, &version, resolution)?;
            packages.push(Package {
                name,
                version,
                source,
                lockfile: lockfile.clone(),
            });
        }

        debug!("{}: {} packages", path.display(), packages.len());
        Ok(packages)
    }
}

/// Downloads tarballs, embeds `pnpm_store.py` to unpack them into a store
/// at build time, and points pnpm at that store.
#[derive(Debug)]
pub struct PnpmModuleProvider {
    context: ProviderContext,
    tarballs: Mutex<BTreeMap<String, StorePackage>>,
}

impl PnpmModuleProvider {
    pub fn new(context: ProviderContext) -> Self {
        Self {
            context,
            tarballs: Mutex::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl ModuleProvider for PnpmModuleProvider {
    async fn generate_package(&self, package: &Package) -> Result<(), GenerateError> {
        match &package.source {
            PackageSource::Registry(source) => {
                let integrity = self.context.retrieve_integrity(source).await?;
                let tarball_name =
                    format!("{}-{}.tgz", package.name.replace('/', "-"), package.version);
                self.context.generator.add_url_source(
                    &source.url,
                    &integrity,
                    &tarball_dir().join(&tarball_name),
                    &[],
                )?;

                self.tarballs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(
                        tarball_name,
                        StorePackage {
                            name: package.name.clone(),
                            version: package.version.clone(),
                            integrity_hex: integrity.digest().to_string(),
                            requires_build: false,
                        },
                    );

                self.context.special.generate_special_sources(package).await?;
            }
            PackageSource::Git(source) => {
                self.context.generator.add_git_source(
                    &source.url,
                    GitRevision::Commit(source.commit.clone()),
                    &git_checkout_dir(source),
                )?;
            }
            PackageSource::Local(_) => {}
        }
        Ok(())
    }

    fn finalize(&self) -> Result<(), GenerateError> {
        let packages = std::mem::take(&mut *self.tarballs.lock().unwrap_or_else(PoisonError::into_inner));
        if packages.is_empty() {
            return Ok(());
        }

        let manifest = PnpmStoreManifest {
            store_version: STORE_VERSION.to_string(),
            packages,
        };
        let json = serde_json::to_string(&manifest).map_err(ManifestError::from)?;
        let generator = &self.context.generator;
        generator.add_text_source(&json, &manifest_path())?;
        generator.add_text_source(STORE_SCRIPT, &store_script_path())?;

        generator.add_command(format!(
            "python3 {} {} {} {}",
            store_script_path().display(),
            manifest_path().display(),
            tarball_dir().display(),
            store_dir().display()
        ));
        generator.add_command(format!(
            "echo \"store-dir=$PWD/{}\" >> .npmrc",
            store_dir().display()
        ));
        Ok(())
    }
}
