//! Extra sources keyed by package name.
//!
//! Some packages download prebuilt binaries, browsers or headers from their
//! install scripts. Those downloads are added to the manifest here so the
//! sandboxed build finds them in the places the install scripts look.

mod electron;
mod tools;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nodesrc_schema::{HashAlgorithm, Integrity, Package};
use regex::Regex;
use semver::Version;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::cache::Cache;
use crate::error::{FetchError, GenerateError};
use crate::fetch::Fetcher;
use crate::manifest::ManifestGenerator;
use crate::metadata::RemoteMetadata;
use crate::node_headers::{INSTALL_VERSION, NodeHeaders};
use crate::paths::{data_root, tmp_root};

pub use electron::{Binary, ElectronBinaryManager};

/// How electron's ffmpeg build is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectronFfmpeg {
    /// Zips in the electron download cache.
    Archive,
    /// Extracted into the data root.
    Lib,
}

impl std::str::FromStr for ElectronFfmpeg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "archive" => Ok(Self::Archive),
            "lib" => Ok(Self::Lib),
            other => Err(format!("unknown ffmpeg mode '{other}' (expected archive or lib)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialOptions {
    /// Take chromedriver from this electron release instead of upstream.
    pub node_chromedriver_from_electron: Option<String>,
    pub electron_ffmpeg: Option<ElectronFfmpeg>,
    pub electron_node_headers: bool,
    /// NW.js release for nw-builder; the latest release when unset.
    pub nwjs_version: Option<String>,
    pub nwjs_node_headers: bool,
    pub nwjs_ffmpeg: bool,
    /// Lay caches out under `flatpak-node/cache` the way XDG-aware tools
    /// expect.
    pub xdg_layout: bool,
}

impl Default for SpecialOptions {
    fn default() -> Self {
        Self {
            node_chromedriver_from_electron: None,
            electron_ffmpeg: None,
            electron_node_headers: false,
            nwjs_version: None,
            nwjs_node_headers: false,
            nwjs_ffmpeg: false,
            xdg_layout: true,
        }
    }
}

/// Dispatches packages to their handlers.
#[derive(Debug)]
pub struct SpecialSourceProvider {
    generator: Arc<ManifestGenerator>,
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<dyn Cache>,
    options: SpecialOptions,
}

impl SpecialSourceProvider {
    pub fn new(
        generator: Arc<ManifestGenerator>,
        fetcher: Arc<dyn Fetcher>,
        cache: Arc<dyn Cache>,
        options: SpecialOptions,
    ) -> Self {
        Self {
            generator,
            fetcher,
            cache,
            options,
        }
    }

    pub fn options(&self) -> &SpecialOptions {
        &self.options
    }

    /// Where `@electron/get` looks for downloaded zips.
    pub fn electron_cache_dir(&self) -> PathBuf {
        if self.options.xdg_layout {
            data_root().join("cache").join("electron")
        } else {
            data_root().join("electron-cache")
        }
    }

    pub fn gyp_dir(&self) -> PathBuf {
        data_root().join("cache").join("node-gyp")
    }

    /// Add everything `package` downloads at install time.
    ///
    /// Does nothing with a stub fetcher: the handlers need real checksum
    /// manifests and release metadata.
    pub async fn generate_special_sources(&self, package: &Package) -> Result<(), GenerateError> {
        if self.fetcher.is_stub() {
            return Ok(());
        }

        match package.name.as_str() {
            "electron" => {
                self.handle_electron(package).await?;
                if self.options.electron_node_headers {
                    self.handle_electron_headers(package).await?;
                }
            }
            "electron-chromedriver" => self.handle_electron_chromedriver(package).await?,
            "chromedriver" => self.handle_node_chromedriver(package).await?,
            "electron-builder" => self.handle_electron_builder()?,
            "gulp-atom-electron" => self.handle_gulp_atom_electron(package)?,
            "nw-builder" => self.handle_nw_builder().await?,
            "dugite" | "@shiftkey/dugite" => self.handle_dugite(package).await?,
            "vscode-ripgrep" | "@vscode/ripgrep" => self.handle_ripgrep(package).await?,
            "playwright" => self.handle_playwright(package).await?,
            "esbuild" => self.handle_esbuild(package).await?,
            _ => return Ok(()),
        }

        debug!("Added special sources for {package}");
        Ok(())
    }

    /// Headers tarball unpacked to `dest` (default
    /// `cache/node-gyp/<target>`), plus the `installVersion` marker node-gyp
    /// checks before downloading. Does nothing with a stub fetcher.
    pub async fn generate_node_headers(
        &self,
        headers: &NodeHeaders,
        dest: Option<&Path>,
    ) -> Result<(), GenerateError> {
        if self.fetcher.is_stub() {
            return Ok(());
        }

        let url = headers.url();
        let dest = dest.map_or_else(|| self.gyp_dir().join(&headers.target), Path::to_path_buf);
        let integrity = self.remote_integrity(&url, true).await?;

        self.generator.add_archive_source(&url, &integrity, &dest, 1, &[])?;
        self.generator
            .add_text_source(INSTALL_VERSION, &dest.join("installVersion"))?;
        Ok(())
    }

    fn handle_electron_builder(&self) -> Result<(), GenerateError> {
        let mut script = vec!["case \"$FLATPAK_ARCH\" in".to_string()];
        for arch in nodesrc_schema::Arch::ALL {
            script.push(format!("\"{arch}\")"));
            script.push(format!(
                "  export ELECTRON_BUILDER_ARCH_ARGS=\"--{}\"",
                arch.electron_name()
            ));
            script.push("  ;;".to_string());
        }
        script.push("esac".to_string());

        self.generator
            .add_script_source(script, &data_root().join("electron-builder-arch-args.sh"))?;
        Ok(())
    }

    fn handle_gulp_atom_electron(&self, package: &Package) -> Result<(), GenerateError> {
        // Later releases use @electron/get and read the regular cache.
        if parse_version(&package.version)? > Version::new(1, 22, 0) {
            return Ok(());
        }

        let cache_path = tmp_root()
            .join("gulp-electron-cache")
            .join("atom")
            .join("electron");
        let parent = cache_path.parent().unwrap_or(&cache_path);
        self.generator.add_package_commands(
            &package.to_string(),
            vec![
                format!("mkdir -p \"{}\"", parent.display()),
                format!(
                    "ln -sfTr \"{}\" \"{}\"",
                    self.electron_cache_dir().display(),
                    cache_path.display()
                ),
            ],
        );
        Ok(())
    }

    async fn remote_integrity(&self, url: &str, cachable: bool) -> Result<Integrity, GenerateError> {
        let metadata = RemoteMetadata::get(
            self.fetcher.as_ref(),
            &self.cache,
            url,
            cachable,
            HashAlgorithm::Sha256,
        )
        .await?;
        Ok(metadata.integrity)
    }

    async fn fetch_text(&self, url: &str, cachable: bool) -> Result<String, GenerateError> {
        let body = self.fetcher.read_all(url, cachable).await?;
        String::from_utf8(body).map_err(|e| FetchError::invalid(url, e).into())
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        cachable: bool,
    ) -> Result<T, GenerateError> {
        let body = self.fetcher.read_all(url, cachable).await?;
        serde_json::from_slice(&body).map_err(|e| FetchError::invalid(url, e).into())
    }
}

fn parse_version(version: &str) -> Result<Version, GenerateError> {
    Version::parse(version)
        .map_err(|e| GenerateError::context("special sources", format!("bad version {version}: {e}")))
}

/// First capture group of `pattern` in a document fetched from `url`.
fn capture(pattern: &Regex, text: &str, url: &str) -> Result<String, GenerateError> {
    pattern
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            FetchError::invalid(url, format!("no match for {}", pattern.as_str())).into()
        })
}
