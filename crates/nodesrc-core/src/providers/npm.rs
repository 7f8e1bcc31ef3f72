//! npm: `package-lock.json` v1/v2 and the `_cacache` offline cache.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use nodesrc_schema::{
    GitRevision, GitSource, HashAlgorithm, Integrity, LocalSource, Lockfile, Package,
    PackageSource, RegistrySource,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{
    DevelPolicy, LockfileProvider, ModuleProvider, ProviderContext, ProviderOptions,
    git_checkout_dir, shell_quote,
};
use crate::error::{FetchError, GenerateError, ParseError};
use crate::metadata::RemoteMetadata;
use crate::paths::data_root;

static ALIAS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^npm:(.[^@]*)@(.*)$").expect("alias pattern is valid"));

static FROM_PACKAGE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^@:]+@)[^@:]+:").expect("from prefix pattern is valid"));

const MAX_LOCKFILE_VERSION: u64 = 2;

const GIT_URL_PREFIX: &str = "git+";

/// Rewrites every string value found in `$data` (dependency specifiers in
/// `package.json`).
const PACKAGE_JSON_PATCH: &str = r#"walk(    if type == "object"    then        to_entries | map(            if (.value | type == "string") and $data[.value]            then .value = "git+file:\($buildroot)/\($data[.value])"            else .            end        ) | from_entries    else .    end)"#;

/// Rewrites every `version` found in `$data` (`package-lock.json` entries).
const PACKAGE_LOCK_PATCH: &str = r#"walk(    if type == "object" and (.version | type == "string") and $data[.version]    then        .version = "git+file:\($buildroot)/\($data[.version])"    else .    end)"#;

#[derive(Deserialize)]
struct RawLockfile {
    #[serde(rename = "lockfileVersion")]
    lockfile_version: Option<u64>,
    #[serde(default)]
    dependencies: BTreeMap<String, RawDependency>,
}

#[derive(Deserialize)]
struct RawDependency {
    version: String,
    resolved: Option<String>,
    integrity: Option<String>,
    from: Option<String>,
    dev: Option<bool>,
    #[serde(default)]
    bundled: bool,
    #[serde(default)]
    dependencies: BTreeMap<String, RawDependency>,
}

/// Reads the nested `dependencies` tree of a v1/v2 lockfile.
///
/// Entries without a `dev` flag are production dependencies.
#[derive(Debug, Clone)]
pub struct NpmLockfileProvider {
    devel: DevelPolicy,
}

impl NpmLockfileProvider {
    pub fn new(devel: DevelPolicy) -> Self {
        Self { devel }
    }

    fn collect(
        &self,
        lockfile: &Arc<Lockfile>,
        dependencies: BTreeMap<String, RawDependency>,
        out: &mut Vec<Package>,
    ) -> Result<(), ParseError> {
        for (name, info) in dependencies {
            // Bundled dependencies ship inside their parent's tarball.
            if info.bundled || !self.devel.keeps(info.dev) {
                continue;
            }

            let (name, version) = match ALIAS.captures(&info.version) {
                Some(caps) => (caps[1].to_string(), caps[2].to_string()),
                None => (name, info.version.clone()),
            };

            let source = Self::source(lockfile, &name, &version, &info)?;
            out.push(Package {
                name,
                version,
                source,
                lockfile: lockfile.clone(),
            });

            self.collect(lockfile, info.dependencies, out)?;
        }
        Ok(())
    }

    fn source(
        lockfile: &Lockfile,
        name: &str,
        version: &str,
        info: &RawDependency,
    ) -> Result<PackageSource, ParseError> {
        if let Some(from) = &info.from {
            let from = match FROM_PACKAGE_PREFIX.captures(from) {
                Some(caps) => from[caps[1].len()..].to_string(),
                None => from.clone(),
            };
            let git = GitSource::parse(version, Some(from)).map_err(|source| {
                ParseError::Specifier {
                    path: lockfile.path.clone(),
                    entry: name.to_string(),
                    source,
                }
            })?;
            return Ok(PackageSource::Git(git));
        }

        if let Some(path) = version.strip_prefix("file:") {
            return Ok(PackageSource::Local(LocalSource {
                path: path.to_string(),
            }));
        }

        let url = info.resolved.clone().ok_or_else(|| ParseError::Entry {
            path: lockfile.path.clone(),
            entry: name.to_string(),
            message: "missing 'resolved'".to_string(),
        })?;
        let integrity = info
            .integrity
            .as_deref()
            .map(Integrity::parse)
            .transpose()
            .map_err(|source| ParseError::Integrity {
                path: lockfile.path.clone(),
                entry: name.to_string(),
                source,
            })?;

        Ok(PackageSource::Registry(RegistrySource { url, integrity }))
    }
}

impl LockfileProvider for NpmLockfileProvider {
    fn parse(&self, path: &Path) -> Result<Vec<Package>, ParseError> {
        let text = std::fs::read_to_string(path).map_err(|source| ParseError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawLockfile = serde_json::from_str(&text).map_err(|source| ParseError::Json {
            path: path.to_path_buf(),
            source,
        })?;

        let version = match raw.lockfile_version {
            Some(version) if version <= MAX_LOCKFILE_VERSION => version,
            other => {
                return Err(ParseError::UnsupportedVersion {
                    path: path.to_path_buf(),
                    version: other.map_or_else(|| "(missing)".to_string(), |v| v.to_string()),
                    hint: "regenerate it with `npm install --lockfile-version 2`",
                });
            }
        };

        let lockfile = Lockfile::new(path, version as u32);
        let mut packages = Vec::new();
        self.collect(&lockfile, raw.dependencies, &mut packages)?;
        debug!("{}: {} packages", path.display(), packages.len());
        Ok(packages)
    }
}

/// A registry packument, possibly trimmed to its `versions` key.
#[derive(Debug)]
struct Packument {
    url: String,
    data: Value,
}

type PackumentCell = Arc<OnceCell<Option<Packument>>>;

#[derive(Serialize)]
struct IndexEntry<'a> {
    key: &'a str,
    integrity: String,
    time: u64,
    size: u64,
    metadata: IndexMetadata<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexMetadata<'a> {
    url: &'a str,
    req_headers: BTreeMap<String, String>,
    res_headers: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct NpmState {
    used_versions: BTreeMap<String, BTreeSet<String>>,
    index_entries: BTreeMap<PathBuf, String>,
    lockfiles: BTreeSet<PathBuf>,
    git_sources: BTreeMap<PathBuf, BTreeSet<(PathBuf, GitSource)>>,
}

/// Populates npm's `_cacache` so `npm install --offline` finds every tarball
/// and packument.
#[derive(Debug)]
pub struct NpmModuleProvider {
    context: ProviderContext,
    registry: String,
    no_autopatch: bool,
    no_trim_index: bool,
    packuments: Mutex<BTreeMap<String, PackumentCell>>,
    state: Mutex<NpmState>,
}

fn cacache_dir() -> PathBuf {
    data_root().join("npm-cache").join("_cacache")
}

/// `<aa>/<bb>/<rest>` of a hex digest.
fn sharded(integrity: &Integrity) -> PathBuf {
    let digest = integrity.digest();
    Path::new(&digest[0..2]).join(&digest[2..4]).join(&digest[4..])
}

pub(crate) fn cacache_content_path(integrity: &Integrity) -> PathBuf {
    cacache_dir()
        .join("content-v2")
        .join(integrity.algorithm().as_str())
        .join(sharded(integrity))
}

fn cacache_index_path(key: &Integrity) -> PathBuf {
    cacache_dir().join("index-v5").join(sharded(key))
}

fn scope_of(name: &str) -> Option<&str> {
    name.strip_prefix('@')
        .and_then(|_| name.split_once('/'))
        .map(|(scope, _)| scope)
}

impl NpmModuleProvider {
    pub fn new(context: ProviderContext, options: &ProviderOptions) -> Self {
        Self {
            context,
            registry: options.registry.trim_end_matches('/').to_string(),
            no_autopatch: options.no_autopatch,
            no_trim_index: options.no_trim_index,
            packuments: Mutex::new(BTreeMap::new()),
            state: Mutex::new(NpmState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, NpmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_for(&self, package: &Package) -> String {
        scope_of(&package.name)
            .and_then(|scope| {
                self.context
                    .configs
                    .get(&package.lockfile.path)
                    .and_then(|config| config.registry_for_scope(scope))
            })
            .map_or_else(|| self.registry.clone(), |r| r.trim_end_matches('/').to_string())
    }

    fn add_index_entry(
        &self,
        url: &str,
        integrity: &Integrity,
        size: u64,
    ) -> Result<(), GenerateError> {
        let key = format!("make-fetch-happen:request-cache:{url}");
        let entry = IndexEntry {
            key: &key,
            integrity: integrity.to_sri(),
            time: 0,
            size,
            metadata: IndexMetadata {
                url,
                req_headers: BTreeMap::new(),
                res_headers: BTreeMap::new(),
            },
        };
        let json = serde_json::to_string(&entry).map_err(crate::error::ManifestError::from)?;
        let line = format!(
            "{}\t{json}",
            Integrity::generate(&json, HashAlgorithm::Sha1).digest()
        );

        let path = cacache_index_path(&Integrity::generate(&key, HashAlgorithm::Sha256));
        self.state().index_entries.insert(path, line);
        Ok(())
    }

    /// Fetch the packument for `package`'s name once, however many versions
    /// and tasks ask for it.
    async fn packument(&self, package: &Package) -> Result<PackumentCell, FetchError> {
        let cell = {
            let mut packuments = self.packuments.lock().unwrap_or_else(PoisonError::into_inner);
            packuments.entry(package.name.clone()).or_default().clone()
        };

        let url = format!("{}/{}", self.registry_for(package), package.name.replace('/', "%2f"));
        cell.get_or_try_init(|| async move {
            // An API call: never cachable.
            let raw = self.context.fetcher.read_all(&url, false).await?;
            if raw.is_empty() && self.context.fetcher.is_stub() {
                return Ok(None);
            }

            let mut data: Value =
                serde_json::from_slice(&raw).map_err(|e| FetchError::invalid(&url, e))?;
            if !data.get("versions").is_some_and(Value::is_object) {
                return Err(FetchError::invalid(&url, "returned an invalid package index"));
            }
            match &mut data {
                Value::Object(map) if !self.no_trim_index => map.retain(|key, _| key == "versions"),
                _ => {}
            }
            Ok(Some(Packument { url, data }))
        })
        .await?;

        Ok(cell)
    }

    /// Tarball URL and integrity, cross-checked against the registry.
    async fn resolve(
        &self,
        package: &Package,
        source: &RegistrySource,
    ) -> Result<RegistrySource, GenerateError> {
        let cell = self.packument(package).await?;
        let Some(packument) = cell.get().and_then(Option::as_ref) else {
            warn!("{package}: no registry data in offline mode, trusting the lockfile");
            return Ok(source.clone());
        };
        let url = packument.url.as_str();

        let versions = packument
            .data
            .get("versions")
            .and_then(Value::as_object)
            .ok_or_else(|| FetchError::invalid(url, "missing versions"))?;
        let dist = versions
            .get(&package.version)
            .ok_or_else(|| {
                let available: Vec<&str> = versions.keys().map(String::as_str).collect();
                FetchError::invalid(
                    url,
                    format!(
                        "{} versions available are {}, not {}",
                        package.name,
                        available.join(", "),
                        package.version
                    ),
                )
            })?
            .get("dist")
            .ok_or_else(|| FetchError::invalid(url, format!("{package} has no dist")))?;

        let tarball = dist
            .get("tarball")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::invalid(url, format!("{package} has no tarball in dist")))?;

        let registry_integrity = match (
            dist.get("integrity").and_then(Value::as_str),
            dist.get("shasum").and_then(Value::as_str),
        ) {
            (Some(integrity), _) => Integrity::parse(integrity),
            (None, Some(shasum)) => Integrity::from_sha1(shasum),
            (None, None) => {
                return Err(FetchError::invalid(url, format!("{package} has no integrity in dist")).into());
            }
        }
        .map_err(|e| FetchError::invalid(url, e))?;

        self.state()
            .used_versions
            .entry(package.name.clone())
            .or_default()
            .insert(package.version.clone());

        // Digests are only comparable within one algorithm.
        let integrity = match &source.integrity {
            Some(declared)
                if declared.algorithm() == registry_integrity.algorithm()
                    && *declared != registry_integrity =>
            {
                return Err(GenerateError::IntegrityMismatch {
                    package: package.to_string(),
                    declared: declared.clone(),
                    registry: registry_integrity,
                });
            }
            Some(declared) => declared.clone(),
            None => registry_integrity,
        };

        Ok(RegistrySource {
            url: tarball.to_string(),
            integrity: Some(integrity),
        })
    }

    fn finalize_packuments(&self) -> Result<(), GenerateError> {
        let packuments = self.packuments.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let used_versions = self.state().used_versions.clone();

        for (name, cell) in &packuments {
            let Some(packument) = cell.get().and_then(Option::as_ref) else {
                continue;
            };

            let mut data = packument.data.clone();
            if !self.no_trim_index {
                let used = used_versions.get(name);
                if let Some(Value::Object(versions)) = data.get_mut("versions") {
                    versions.retain(|version, _| used.is_some_and(|used| used.contains(version)));
                }
            }

            let raw = serde_json::to_vec(&data).map_err(crate::error::ManifestError::from)?;
            let integrity = Integrity::generate(&raw, HashAlgorithm::Sha256);
            self.context
                .generator
                .add_data_source(&raw, &cacache_content_path(&integrity))?;
            self.add_index_entry(&packument.url, &integrity, raw.len() as u64)?;
        }
        Ok(())
    }

    fn patch_commands(
        &self,
        lockfile: &Path,
        sources: &BTreeSet<(PathBuf, GitSource)>,
    ) -> Result<Vec<String>, GenerateError> {
        let mut package_json = BTreeMap::new();
        let mut package_lock = BTreeMap::new();

        for (path, source) in sources {
            let new_version = format!("{}#{}", path.display(), source.commit);

            match &source.from {
                Some(from) => {
                    package_json.insert(from.clone(), new_version.clone());
                    if let Some(stripped) = from.strip_prefix(GIT_URL_PREFIX) {
                        package_json.insert(stripped.to_string(), new_version.clone());
                    }
                }
                None => warn!(
                    "{}: {} has no 'from' field, package.json will not be patched",
                    lockfile.display(),
                    source.original
                ),
            }

            package_lock.insert(source.original.clone(), new_version.clone());
            if let Some(stripped) = source.original.strip_prefix(GIT_URL_PREFIX) {
                package_lock.insert(stripped.to_string(), new_version);
            }
        }

        let dir = self.context.relative_lockfile_dir(lockfile.parent().unwrap_or(Path::new("")));
        let mut commands = Vec::new();
        for (filename, script, data) in [
            ("package.json", PACKAGE_JSON_PATCH, &package_json),
            ("package-lock.json", PACKAGE_LOCK_PATCH, &package_lock),
        ] {
            let target = if dir.as_os_str().is_empty() {
                format!("$FLATPAK_BUILDER_BUILDDIR/{filename}")
            } else {
                format!("$FLATPAK_BUILDER_BUILDDIR/{}/{filename}", dir.display())
            };
            let json = serde_json::to_string(data).map_err(crate::error::ManifestError::from)?;
            commands.push(format!(
                "jq --arg buildroot \"$FLATPAK_BUILDER_BUILDDIR\" --argjson data {} {} {target} > {target}.new",
                shell_quote(&json),
                shell_quote(script),
            ));
            commands.push(format!("mv {target}{{.new,}}"));
        }
        Ok(commands)
    }

    fn finalize_patches(&self) -> Result<(), GenerateError> {
        let (lockfiles, git_sources) = {
            let state = self.state();
            (state.lockfiles.clone(), state.git_sources.clone())
        };

        let mut patch_all = Vec::new();
        for lockfile in &lockfiles {
            let commands = match git_sources.get(lockfile) {
                Some(sources) => self.patch_commands(lockfile, sources)?,
                None => Vec::new(),
            };

            let dir = self.context.relative_lockfile_dir(lockfile.parent().unwrap_or(Path::new("")));
            let dest = if dir.as_os_str().is_empty() {
                data_root().join("patch.sh")
            } else {
                let mut name = data_root().join("patch").join(&dir).into_os_string();
                name.push(".sh");
                PathBuf::from(name)
            };

            self.context.generator.add_script_source(commands, &dest)?;
            patch_all.push(format!("$FLATPAK_BUILDER_BUILDDIR/{}", dest.display()));
        }

        let patch_all_dest = data_root().join("patch-all.sh");
        self.context
            .generator
            .add_script_source(patch_all, &patch_all_dest)?;

        if !self.no_autopatch {
            // FLATPAK_BUILDER_BUILDDIR is not set yet while sources are materialised.
            self.context.generator.add_command(format!(
                "FLATPAK_BUILDER_BUILDDIR=$PWD {}",
                patch_all_dest.display()
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ModuleProvider for NpmModuleProvider {
    async fn generate_package(&self, package: &Package) -> Result<(), GenerateError> {
        self.state().lockfiles.insert(package.lockfile.path.clone());

        match &package.source {
            PackageSource::Registry(source) => {
                let resolved = self.resolve(package, source).await?;
                let integrity = self.context.retrieve_integrity(&resolved).await?;
                let size = RemoteMetadata::get_size(
                    self.context.fetcher.as_ref(),
                    &self.context.cache,
                    &resolved.url,
                    true,
                )
                .await?;

                self.context.generator.add_url_source(
                    &resolved.url,
                    &integrity,
                    &cacache_content_path(&integrity),
                    &[],
                )?;
                self.add_index_entry(&resolved.url, &integrity, size)?;

                self.context.special.generate_special_sources(package).await?;
            }
            PackageSource::Git(source) => {
                let path = git_checkout_dir(source);
                self.context.generator.add_git_source(
                    &source.url,
                    GitRevision::Commit(source.commit.clone()),
                    &path,
                )?;
                self.state()
                    .git_sources
                    .entry(package.lockfile.path.clone())
                    .or_default()
                    .insert((path, source.clone()));
            }
            // npm links local directories itself.
            PackageSource::Local(_) => {}
        }
        Ok(())
    }

    fn finalize(&self) -> Result<(), GenerateError> {
        self.finalize_packuments()?;
        self.finalize_patches()?;

        let entries = std::mem::take(&mut self.state().index_entries);
        for (path, entry) in &entries {
            self.context.generator.add_text_source(entry, path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{Fetcher, StubFetcher};
    use crate::providers::test_support::context;
    use base64::Engine;
    use nodesrc_schema::{FileOrigin, InlineContents, Source};
    use serde_json::json;

    const REGISTRY: &str = "https://registry.example";

    fn write_lockfile(dir: &Path, body: &Value) -> PathBuf {
        let path = dir.join("package-lock.json");
        std::fs::write(&path, serde_json::to_string_pretty(body).unwrap()).unwrap();
        path
    }

    fn parse(path: &Path, include_devel: bool) -> Result<Vec<Package>, ParseError> {
        NpmLockfileProvider::new(DevelPolicy::production_default(include_devel)).parse(path)
    }

    fn options() -> ProviderOptions {
        ProviderOptions {
            registry: REGISTRY.to_string(),
            ..ProviderOptions::default()
        }
    }

    fn sri(data: &str) -> String {
        Integrity::generate(data, HashAlgorithm::Sha512).to_sri()
    }

    fn packument(name: &str, versions: &[(&str, &str)]) -> String {
        let versions: serde_json::Map<String, Value> = versions
            .iter()
            .map(|(version, integrity)| {
                (
                    (*version).to_string(),
                    json!({
                        "dist": {
                            "tarball": format!("{REGISTRY}/{name}/-/{name}-{version}.tgz"),
                            "integrity": integrity,
                        }
                    }),
                )
            })
            .collect();
        json!({ "name": name, "readme": "long text", "versions": versions }).to_string()
    }

    fn texts(sources: &[Source]) -> Vec<(String, String)> {
        sources
            .iter()
            .filter_map(|source| match source {
                Source::Inline(inline) => {
                    let text = match &inline.contents {
                        InlineContents::Text(text) | InlineContents::Base64(text) => text.clone(),
                    };
                    let dest = match &inline.dest {
                        Some(dir) => format!("{dir}/{}", inline.dest_filename),
                        None => inline.dest_filename.clone(),
                    };
                    Some((dest, text))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn dev_packages_follow_the_devel_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lockfile(
            dir.path(),
            &json!({
                "lockfileVersion": 2,
                "dependencies": {
                    "left-pad": {
                        "version": "1.3.0",
                        "resolved": "https://registry.example/left-pad/-/left-pad-1.3.0.tgz",
                        "integrity": sri("left-pad"),
                    },
                    "mocha": {
                        "version": "10.0.0",
                        "resolved": "https://registry.example/mocha/-/mocha-10.0.0.tgz",
                        "dev": true,
                        "dependencies": {
                            "debug": {
                                "version": "4.3.4",
                                "resolved": "https://registry.example/debug/-/debug-4.3.4.tgz",
                                "dev": true,
                            }
                        }
                    },
                    "vendored": { "version": "1.0.0", "bundled": true },
                }
            }),
        );

        let names = |packages: Vec<Package>| -> Vec<String> {
            packages.into_iter().map(|p| p.name).collect()
        };
        assert_eq!(names(parse(&path, true).unwrap()), ["left-pad", "mocha", "debug"]);
        assert_eq!(names(parse(&path, false).unwrap()), ["left-pad"]);
    }

    #[test]
    fn aliases_git_and_local_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lockfile(
            dir.path(),
            &json!({
                "lockfileVersion": 1,
                "dependencies": {
                    "my-pad": {
                        "version": "npm:left-pad@1.3.0",
                        "resolved": "https://registry.example/left-pad/-/left-pad-1.3.0.tgz",
                    },
                    "repo": {
                        "version": "git+https://example.com/org/repo#abcdef123456",
                        "from": "repo@git+https://example.com/org/repo",
                    },
                    "sibling": { "version": "file:../sibling" },
                }
            }),
        );

        let packages = parse(&path, true).unwrap();
        assert_eq!(packages[0].name, "left-pad");
        assert_eq!(packages[0].version, "1.3.0");

        let PackageSource::Git(git) = &packages[1].source else {
            panic!("expected a git source");
        };
        assert_eq!(git.url, "https://example.com/org/repo");
        assert_eq!(git.commit, "abcdef123456");
        assert_eq!(git.from.as_deref(), Some("git+https://example.com/org/repo"));

        assert_eq!(
            packages[2].source,
            PackageSource::Local(LocalSource {
                path: "../sibling".into()
            })
        );
    }

    #[test]
    fn lockfile_v3_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lockfile(dir.path(), &json!({ "lockfileVersion": 3, "packages": {} }));
        assert!(matches!(
            parse(&path, true),
            Err(ParseError::UnsupportedVersion { .. })
        ));
    }

    #[tokio::test]
    async fn registry_tarball_lands_in_cacache() {
        let dir = tempfile::tempdir().unwrap();
        let integrity = sri("left-pad tarball");
        let path = write_lockfile(
            dir.path(),
            &json!({
                "lockfileVersion": 2,
                "dependencies": {
                    "left-pad": {
                        "version": "1.3.0",
                        "resolved": "https://registry.example/left-pad/-/left-pad-1.3.0.tgz",
                        "integrity": integrity,
                    }
                }
            }),
        );

        let stub = StubFetcher::new().with_response(
            format!("{REGISTRY}/left-pad"),
            packument("left-pad", &[("1.3.0", &integrity), ("1.2.0", &sri("old"))]),
        );
        let ctx = context(Arc::new(stub), dir.path());
        let generator = ctx.generator.clone();
        let provider = NpmModuleProvider::new(ctx, &options());

        for package in parse(&path, true).unwrap() {
            provider.generate_package(&package).await.unwrap();
        }
        provider.finalize().unwrap();

        let sources = generator.ordered_sources();
        let files: Vec<_> = sources
            .iter()
            .filter_map(|source| match source {
                Source::File(file) => Some(file),
                _ => None,
            })
            .collect();
        assert_eq!(files.len(), 1);

        let expected = Integrity::parse(&integrity).unwrap();
        let digest = expected.digest();
        let FileOrigin::Url { url, integrity: got } = &files[0].origin else {
            panic!("expected a url source");
        };
        assert_eq!(url, "https://registry.example/left-pad/-/left-pad-1.3.0.tgz");
        assert_eq!(got, &expected);
        assert_eq!(
            files[0].dest.as_deref(),
            Some(
                format!(
                    "flatpak-node/npm-cache/_cacache/content-v2/sha512/{}/{}",
                    &digest[0..2],
                    &digest[2..4]
                )
                .as_str()
            )
        );
        assert_eq!(files[0].dest_filename.as_deref(), Some(&digest[4..]));

        let texts = texts(&sources);
        let key = "make-fetch-happen:request-cache:https://registry.example/left-pad/-/left-pad-1.3.0.tgz";
        let key_digest = Integrity::generate(key, HashAlgorithm::Sha256);
        let index_path = cacache_index_path(&key_digest);
        let (_, entry) = texts
            .iter()
            .find(|(dest, _)| Path::new(dest) == index_path)
            .expect("index entry for the tarball");
        let (hash, body) = entry.split_once('\t').unwrap();
        assert_eq!(hash, Integrity::generate(body, HashAlgorithm::Sha1).digest());
        let body: Value = serde_json::from_str(body).unwrap();
        assert_eq!(body["key"], key);
        assert_eq!(body["integrity"], integrity);

        // The packument is stored trimmed to the version in use.
        let packument_data = sources
            .iter()
            .find_map(|source| match source {
                Source::Inline(inline) => match &inline.contents {
                    InlineContents::Base64(data) => Some(data.clone()),
                    InlineContents::Text(_) => None,
                },
                _ => None,
            })
            .unwrap();
        let raw = base64::engine::general_purpose::STANDARD.decode(packument_data).unwrap();
        let trimmed: Value = serde_json::from_slice(&raw).unwrap();
        assert!(trimmed.get("readme").is_none());
        assert_eq!(trimmed["versions"].as_object().unwrap().len(), 1);
        assert!(trimmed["versions"].get("1.3.0").is_some());
    }

    #[tokio::test]
    async fn same_algorithm_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubFetcher::new().with_response(
            format!("{REGISTRY}/left-pad"),
            packument("left-pad", &[("1.3.0", &sri("registry bytes"))]),
        );
        let provider = NpmModuleProvider::new(context(Arc::new(stub), dir.path()), &options());

        let package = Package {
            name: "left-pad".into(),
            version: "1.3.0".into(),
            source: PackageSource::Registry(RegistrySource {
                url: format!("{REGISTRY}/left-pad/-/left-pad-1.3.0.tgz"),
                integrity: Some(Integrity::parse(&sri("lockfile bytes")).unwrap()),
            }),
            lockfile: Lockfile::new(dir.path().join("package-lock.json"), 2),
        };

        let err = provider.generate_package(&package).await.unwrap_err();
        assert!(matches!(err, GenerateError::IntegrityMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn other_algorithm_keeps_the_declared_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let shasum = Integrity::generate("registry bytes", HashAlgorithm::Sha1);
        let body = json!({
            "versions": {
                "1.0.0": {
                    "dist": {
                        "tarball": format!("{REGISTRY}/old/-/old-1.0.0.tgz"),
                        "shasum": shasum.digest(),
                    }
                }
            }
        });
        let stub = StubFetcher::new().with_response(format!("{REGISTRY}/old"), body.to_string());
        let ctx = context(Arc::new(stub), dir.path());
        let generator = ctx.generator.clone();
        let provider = NpmModuleProvider::new(ctx, &options());

        let declared = Integrity::parse(&sri("lockfile bytes")).unwrap();
        let package = Package {
            name: "old".into(),
            version: "1.0.0".into(),
            source: PackageSource::Registry(RegistrySource {
                url: format!("{REGISTRY}/old/-/old-1.0.0.tgz"),
                integrity: Some(declared.clone()),
            }),
            lockfile: Lockfile::new(dir.path().join("package-lock.json"), 1),
        };
        provider.generate_package(&package).await.unwrap();

        assert!(generator.ordered_sources().iter().any(|source| matches!(
            source,
            Source::File(file) if matches!(&file.origin, FileOrigin::Url { integrity, .. } if *integrity == declared)
        )));
    }

    #[tokio::test]
    async fn git_packages_are_checked_out_and_patched() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lockfile(
            dir.path(),
            &json!({
                "lockfileVersion": 2,
                "dependencies": {
                    "one": {
                        "version": "git+https://example.com/org/repo#abcdef123456",
                        "from": "one@git+https://example.com/org/repo",
                    },
                    "two": {
                        "version": "git+https://example.com/org/repo#abcdef123456",
                        "from": "two@git+https://example.com/org/repo",
                    },
                    "three": {
                        "version": "git+https://example.com/org/repo#0123456789ab",
                        "from": "three@git+https://example.com/org/repo#0123456789ab",
                    },
                }
            }),
        );

        let ctx = context(Arc::new(StubFetcher::new()), dir.path());
        let generator = ctx.generator.clone();
        let provider = NpmModuleProvider::new(ctx, &options());
        for package in parse(&path, true).unwrap() {
            provider.generate_package(&package).await.unwrap();
        }
        provider.finalize().unwrap();

        let sources = generator.ordered_sources();
        let checkouts: Vec<_> = sources
            .iter()
            .filter_map(|source| match source {
                Source::Git(git) => Some(git.dest.clone().unwrap()),
                _ => None,
            })
            .collect();
        assert_eq!(
            checkouts,
            [
                "flatpak-node/git-packages/repo-0123456789ab",
                "flatpak-node/git-packages/repo-abcdef123456",
            ]
        );

        let patch = sources
            .iter()
            .find_map(|source| match source {
                Source::Script(script) if script.dest_filename == "patch.sh" => Some(script),
                _ => None,
            })
            .unwrap();
        assert_eq!(patch.commands.len(), 4);
        let lock_patch = &patch.commands[2];
        assert!(lock_patch.contains(
            r#""git+https://example.com/org/repo#abcdef123456":"flatpak-node/git-packages/repo-abcdef123456#abcdef123456""#
        ));
        assert!(lock_patch.contains(
            r#""https://example.com/org/repo#0123456789ab":"flatpak-node/git-packages/repo-0123456789ab#0123456789ab""#
        ));
        assert!(lock_patch.ends_with(
            "$FLATPAK_BUILDER_BUILDDIR/package-lock.json > $FLATPAK_BUILDER_BUILDDIR/package-lock.json.new"
        ));
        assert_eq!(
            patch.commands[3],
            "mv $FLATPAK_BUILDER_BUILDDIR/package-lock.json{.new,}"
        );

        let Some(Source::Shell(trailing)) = sources.last() else {
            panic!("expected the trailing shell source");
        };
        assert_eq!(
            trailing.commands,
            ["FLATPAK_BUILDER_BUILDDIR=$PWD flatpak-node/patch-all.sh"]
        );
    }

    #[tokio::test]
    async fn nested_lockfiles_get_their_own_patch_script() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("packages").join("app");
        std::fs::create_dir_all(&nested).unwrap();
        let path = write_lockfile(
            &nested,
            &json!({
                "lockfileVersion": 2,
                "dependencies": {
                    "repo": {
                        "version": "github:org/repo#abcdef123456",
                        "from": "github:org/repo",
                    }
                }
            }),
        );

        let ctx = context(Arc::new(StubFetcher::new()), root.path());
        let generator = ctx.generator.clone();
        let provider = NpmModuleProvider::new(
            ctx,
            &ProviderOptions {
                no_autopatch: true,
                ..options()
            },
        );
        for package in parse(&path, true).unwrap() {
            provider.generate_package(&package).await.unwrap();
        }
        provider.finalize().unwrap();

        let scripts: BTreeMap<String, Vec<String>> = generator
            .ordered_sources()
            .into_iter()
            .filter_map(|source| match source {
                Source::Script(script) => Some((
                    format!("{}/{}", script.dest.unwrap_or_default(), script.dest_filename),
                    script.commands,
                )),
                _ => None,
            })
            .collect();

        let patch = &scripts["flatpak-node/patch/packages/app.sh"];
        assert!(patch[0].ends_with(
            "$FLATPAK_BUILDER_BUILDDIR/packages/app/package.json > $FLATPAK_BUILDER_BUILDDIR/packages/app/package.json.new"
        ));
        assert_eq!(
            scripts["flatpak-node/patch-all.sh"],
            ["$FLATPAK_BUILDER_BUILDDIR/flatpak-node/patch/packages/app.sh"]
        );
        assert!(
            !generator
                .ordered_sources()
                .iter()
                .any(|source| matches!(source, Source::Shell(_)))
        );
    }

    #[tokio::test]
    async fn stub_without_packument_trusts_the_lockfile() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher: Arc<dyn Fetcher> = Arc::new(StubFetcher::new());
        let ctx = context(fetcher, dir.path());
        let generator = ctx.generator.clone();
        let provider = NpmModuleProvider::new(ctx, &options());

        let declared = Integrity::parse(&sri("left-pad")).unwrap();
        let package = Package {
            name: "left-pad".into(),
            version: "1.3.0".into(),
            source: PackageSource::Registry(RegistrySource {
                url: format!("{REGISTRY}/left-pad/-/left-pad-1.3.0.tgz"),
                integrity: Some(declared.clone()),
            }),
            lockfile: Lockfile::new(dir.path().join("package-lock.json"), 2),
        };
        provider.generate_package(&package).await.unwrap();
        provider.finalize().unwrap();

        let files = generator
            .ordered_sources()
            .into_iter()
            .filter(|source| matches!(source, Source::File(_)))
            .count();
        assert_eq!(files, 1);
    }

    #[test]
    fn scoped_names_have_a_scope() {
        assert_eq!(scope_of("@acme/widgets"), Some("@acme"));
        assert_eq!(scope_of("widgets"), None);
    }
}
