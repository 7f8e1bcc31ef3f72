//! Electron release binaries, verified against the release's SHASUMS256.txt.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use nodesrc_schema::{Arch, HashAlgorithm, Integrity, Package};
use regex::Regex;
use semver::Version;

use super::{SpecialSourceProvider, capture, parse_version};
use crate::error::{FetchError, GenerateError};
use crate::fetch::Fetcher;
use crate::node_headers::NodeHeaders;
use crate::paths::{data_root, url_dirname};

const INTEGRITY_BASE_FILENAME: &str = "SHASUMS256.txt";

static CHROMEDRIVER_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"exports\.version = '([^']+)'").expect("chromedriver version pattern is valid")
});

/// One downloadable file of a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    pub filename: String,
    pub url: String,
    pub integrity: Integrity,
    pub arch: Option<Arch>,
}

impl Binary {
    /// sha256 of the URL's directory; `@electron/get` names cache
    /// subdirectories after it.
    pub fn url_hash(&self) -> String {
        Integrity::generate(url_dirname(&self.url), HashAlgorithm::Sha256)
            .digest()
            .to_string()
    }
}

/// Checksums of one electron release.
#[derive(Debug, Clone)]
pub struct ElectronBinaryManager {
    version: String,
    base_url: String,
    integrities: HashMap<String, Integrity>,
}

impl ElectronBinaryManager {
    pub fn release_url(version: &str) -> String {
        format!("https://github.com/electron/electron/releases/download/v{version}")
    }

    /// Build from the text of a `SHASUMS256.txt` (`<digest> *<filename>` per
    /// line).
    pub fn parse(version: &str, base_url: &str, shasums: &str) -> Result<Self, GenerateError> {
        let url = format!("{base_url}/{INTEGRITY_BASE_FILENAME}");
        let mut integrities = HashMap::new();

        for line in shasums.lines().filter(|line| !line.trim().is_empty()) {
            let mut fields = line.split_whitespace();
            let (Some(digest), Some(filename), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(FetchError::invalid(&url, format!("malformed line '{line}'")).into());
            };
            let integrity = Integrity::from_hex(HashAlgorithm::Sha256, digest)
                .map_err(|e| FetchError::invalid(&url, e))?;
            integrities.insert(filename.trim_start_matches('*').to_string(), integrity);
        }

        integrities.insert(
            INTEGRITY_BASE_FILENAME.to_string(),
            Integrity::generate(shasums, HashAlgorithm::Sha256),
        );

        Ok(Self {
            version: version.to_string(),
            base_url: base_url.to_string(),
            integrities,
        })
    }

    pub async fn for_version(fetcher: &dyn Fetcher, version: &str) -> Result<Self, GenerateError> {
        let base_url = Self::release_url(version);
        let url = format!("{base_url}/{INTEGRITY_BASE_FILENAME}");
        let body = fetcher.read_all(&url, true).await?;
        let text = String::from_utf8(body).map_err(|e| FetchError::invalid(&url, e))?;
        Self::parse(version, &base_url, &text)
    }

    fn integrity(&self, filename: &str) -> Result<Integrity, GenerateError> {
        self.integrities.get(filename).cloned().ok_or_else(|| {
            GenerateError::context(
                "electron",
                format!("{INTEGRITY_BASE_FILENAME} of v{} lists no {filename}", self.version),
            )
        })
    }

    /// Linux zips of `binary` (`electron`, `ffmpeg`, `chromedriver`) for
    /// every supported arch.
    pub fn find_binaries(&self, binary: &str) -> Result<Vec<Binary>, GenerateError> {
        // Electron 19 dropped linux-ia32.
        let drops_ia32 = parse_version(&self.version)? >= Version::new(19, 0, 0);

        Arch::ALL
            .into_iter()
            .filter(|arch| !(drops_ia32 && *arch == Arch::I386))
            .map(|arch| {
                let filename = format!(
                    "{binary}-v{}-linux-{}.zip",
                    self.version,
                    arch.electron_name()
                );
                Ok(Binary {
                    url: format!("{}/{filename}", self.base_url),
                    integrity: self.integrity(&filename)?,
                    filename,
                    arch: Some(arch),
                })
            })
            .collect()
    }

    /// The checksum file itself, stored per version.
    pub fn integrity_file(&self) -> Result<Binary, GenerateError> {
        Ok(Binary {
            filename: format!("{INTEGRITY_BASE_FILENAME}-{}", self.version),
            url: format!("{}/{INTEGRITY_BASE_FILENAME}", self.base_url),
            integrity: self.integrity(INTEGRITY_BASE_FILENAME)?,
            arch: None,
        })
    }
}

/// Symlinks to create: directory → arch → `(filename, link name)`.
type CacheLinks = BTreeMap<String, BTreeMap<Option<Arch>, Vec<(String, String)>>>;

impl SpecialSourceProvider {
    fn add_electron_cache_downloads(
        &self,
        manager: &ElectronBinaryManager,
        binary_name: &str,
        add_integrities: bool,
    ) -> Result<(), GenerateError> {
        let cache_dir = self.electron_cache_dir();
        let mut links = CacheLinks::new();

        for binary in manager.find_binaries(binary_name)? {
            self.generator.add_url_source(
                &binary.url,
                &binary.integrity,
                &cache_dir.join(&binary.filename),
                binary.arch.as_slice(),
            )?;

            if self.options.xdg_layout {
                // Older @electron/get keys the cache by the sanitised URL,
                // 1.12.4 and later by the URL directory hash.
                let sanitized: String =
                    binary.url.chars().filter(|c| !matches!(c, '/' | ':')).collect();
                for dir in [sanitized, binary.url_hash()] {
                    links
                        .entry(dir)
                        .or_default()
                        .entry(binary.arch)
                        .or_default()
                        .push((binary.filename.clone(), binary.filename.clone()));
                }
            }
        }

        if add_integrities {
            let file = manager.integrity_file()?;
            self.generator.add_url_source(
                &file.url,
                &file.integrity,
                &cache_dir.join(&file.filename),
                &[],
            )?;
            links
                .entry(file.url_hash())
                .or_default()
                .entry(None)
                .or_default()
                .push((file.filename, INTEGRITY_BASE_FILENAME.to_string()));
        }

        for (dir, by_arch) in links {
            for (arch, entries) in by_arch {
                let mut commands = vec![format!("mkdir -p \"{dir}\"")];
                commands.extend(
                    entries
                        .iter()
                        .map(|(filename, dest)| format!("ln -s \"../{filename}\" \"{dir}/{dest}\"")),
                );
                self.generator
                    .add_shell_source(commands, Some(&cache_dir), arch.as_slice())?;
            }
        }
        Ok(())
    }

    pub(super) async fn handle_electron(&self, package: &Package) -> Result<(), GenerateError> {
        let manager = ElectronBinaryManager::for_version(self.fetcher.as_ref(), &package.version).await?;
        self.add_electron_cache_downloads(&manager, "electron", true)?;

        match self.options.electron_ffmpeg {
            Some(super::ElectronFfmpeg::Archive) => {
                self.add_electron_cache_downloads(&manager, "ffmpeg", false)?;
            }
            Some(super::ElectronFfmpeg::Lib) => {
                for binary in manager.find_binaries("ffmpeg")? {
                    self.generator.add_archive_source(
                        &binary.url,
                        &binary.integrity,
                        data_root(),
                        1,
                        binary.arch.as_slice(),
                    )?;
                }
            }
            None => {}
        }
        Ok(())
    }

    pub(super) async fn handle_electron_headers(&self, package: &Package) -> Result<(), GenerateError> {
        let headers = NodeHeaders::with_defaults(&package.version, Some("electron"), None)?;
        let dest = if self.options.xdg_layout {
            self.gyp_dir().join(&package.version)
        } else {
            data_root().join("node-gyp").join("electron-current")
        };
        self.generate_node_headers(&headers, Some(&dest)).await
    }

    pub(super) async fn handle_electron_chromedriver(
        &self,
        package: &Package,
    ) -> Result<(), GenerateError> {
        let manager = ElectronBinaryManager::for_version(self.fetcher.as_ref(), &package.version).await?;
        self.add_electron_cache_downloads(&manager, "chromedriver", true)
    }

    pub(super) async fn handle_node_chromedriver(&self, package: &Package) -> Result<(), GenerateError> {
        let dest = data_root().join("chromedriver");

        if let Some(electron) = &self.options.node_chromedriver_from_electron {
            let manager = ElectronBinaryManager::for_version(self.fetcher.as_ref(), electron).await?;
            for binary in manager.find_binaries("chromedriver")? {
                self.generator.add_archive_source(
                    &binary.url,
                    &binary.integrity,
                    &dest,
                    1,
                    binary.arch.as_slice(),
                )?;
            }
            return Ok(());
        }

        // Not every node-chromedriver release is tagged upstream; unpkg has
        // them all.
        let url = format!(
            "https://unpkg.com/chromedriver@{}/lib/chromedriver",
            package.version
        );
        let script = self.fetch_text(&url, true).await?;
        let version = capture(&CHROMEDRIVER_VERSION, &script, &url)?;

        let url = format!("https://chromedriver.storage.googleapis.com/{version}/chromedriver_linux64.zip");
        let integrity = self.remote_integrity(&url, true).await?;
        self.generator
            .add_archive_source(&url, &integrity, &dest, 1, &[Arch::X86_64])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::SpecialOptions;
    use super::super::test_support::{package, provider};
    use super::*;
    use crate::fetch::StubFetcher;
    use nodesrc_schema::{FileOrigin, Source};

    fn shasums(version: &str, binaries: &[&str]) -> String {
        let mut text = String::new();
        for binary in binaries {
            for arch in ["ia32", "x64", "armv7l", "arm64"] {
                let filename = format!("{binary}-v{version}-linux-{arch}.zip");
                let digest = Integrity::generate(&filename, HashAlgorithm::Sha256);
                text.push_str(&format!("{} *{filename}\n", digest.digest()));
            }
        }
        text
    }

    #[test]
    fn parses_shasums_and_drops_ia32_from_19() {
        let text = shasums("18.3.0", &["electron"]);
        let manager = ElectronBinaryManager::parse(
            "18.3.0",
            &ElectronBinaryManager::release_url("18.3.0"),
            &text,
        )
        .unwrap();
        let binaries = manager.find_binaries("electron").unwrap();
        assert_eq!(binaries.len(), 4);
        assert_eq!(binaries[0].arch, Some(Arch::I386));
        assert_eq!(
            binaries[1].url,
            "https://github.com/electron/electron/releases/download/v18.3.0/electron-v18.3.0-linux-x64.zip"
        );
        assert_eq!(
            binaries[1].integrity,
            Integrity::generate("electron-v18.3.0-linux-x64.zip", HashAlgorithm::Sha256)
        );

        let file = manager.integrity_file().unwrap();
        assert_eq!(file.filename, "SHASUMS256.txt-18.3.0");
        assert_eq!(file.integrity, Integrity::generate(&text, HashAlgorithm::Sha256));
        assert_eq!(file.url_hash(), binaries[0].url_hash());

        let text = shasums("19.0.0", &["electron"]);
        let manager = ElectronBinaryManager::parse("19.0.0", "https://mirror.example", &text).unwrap();
        let arches: Vec<_> = manager
            .find_binaries("electron")
            .unwrap()
            .into_iter()
            .filter_map(|b| b.arch)
            .collect();
        assert_eq!(arches, [Arch::X86_64, Arch::Arm, Arch::Aarch64]);

        assert!(manager.find_binaries("ffmpeg").is_err());
        assert!(ElectronBinaryManager::parse("19.0.0", "https://mirror.example", "nothex").is_err());
    }

    #[tokio::test]
    async fn electron_cache_with_symlinks() {
        let version = "20.0.0";
        let base = ElectronBinaryManager::release_url(version);
        let stub = StubFetcher::new().with_response(
            format!("{base}/SHASUMS256.txt"),
            shasums(version, &["electron", "ffmpeg"]),
        );
        let options = SpecialOptions {
            electron_ffmpeg: Some(super::super::ElectronFfmpeg::Lib),
            ..SpecialOptions::default()
        };
        let (generator, provider) = provider(stub, options);
        provider
            .generate_special_sources(&package("electron", version))
            .await
            .unwrap();

        let sources = generator.ordered_sources();
        let files: Vec<_> = sources
            .iter()
            .filter_map(|source| match source {
                Source::File(file) => Some(file),
                _ => None,
            })
            .collect();
        // Three arches plus the checksum file.
        assert_eq!(files.len(), 4);
        assert!(files.iter().all(|f| f.dest.as_deref() == Some("flatpak-node/cache/electron")));
        assert!(files.iter().any(|f| matches!(
            &f.origin,
            FileOrigin::Url { url, .. } if url.ends_with("/SHASUMS256.txt")
        ) && f.dest_filename.as_deref() == Some("SHASUMS256.txt-20.0.0")
            && f.only_arches.is_empty()));

        let archives = sources.iter().filter(|s| matches!(s, Source::Archive(_))).count();
        assert_eq!(archives, 3);

        let url_hash = Integrity::generate(base.as_str(), HashAlgorithm::Sha256);
        let checksum_link = format!(
            "ln -s \"../SHASUMS256.txt-20.0.0\" \"{}/SHASUMS256.txt\"",
            url_hash.digest()
        );
        assert!(sources.iter().any(|source| matches!(
            source,
            Source::Shell(shell) if shell.only_arches.is_empty()
                && shell.dest.as_deref() == Some("flatpak-node/cache/electron")
                && shell.commands.contains(&checksum_link)
        )));

        // Two link directories for each of the three arches, plus the
        // checksum file's.
        let shells = sources.iter().filter(|s| matches!(s, Source::Shell(_))).count();
        assert_eq!(shells, 7);
    }

    #[tokio::test]
    async fn chromedriver_from_upstream() {
        let stub = StubFetcher::new()
            .with_response(
                "https://unpkg.com/chromedriver@2.46.0/lib/chromedriver",
                "exports.version = '2.46';\n",
            )
            .with_response(
                "https://chromedriver.storage.googleapis.com/2.46/chromedriver_linux64.zip",
                "zip",
            );
        let (generator, provider) = provider(stub, SpecialOptions::default());
        provider
            .generate_special_sources(&package("chromedriver", "2.46.0"))
            .await
            .unwrap();

        let sources = generator.ordered_sources();
        let [Source::Archive(archive)] = sources.as_slice() else {
            panic!("expected one archive, got {sources:?}");
        };
        assert_eq!(archive.dest.as_deref(), Some("flatpak-node/chromedriver"));
        assert_eq!(archive.only_arches, [Arch::X86_64]);
    }
}
