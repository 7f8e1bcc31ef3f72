//! Prebuilt tool downloads: NW.js, dugite's git, ripgrep, playwright
//! browsers and esbuild binaries.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use nodesrc_schema::{Arch, HashAlgorithm, Integrity, Package};
use regex::Regex;
use semver::Version;
use serde::Deserialize;

use super::{SpecialSourceProvider, capture, parse_version};
use crate::error::{FetchError, GenerateError};
use crate::paths::{data_root, tmp_root};

const NWJS_MIRROR: &str = "https://dl.nwjs.io";
const NWJS_FFMPEG_MIRROR: &str = "https://github.com/iteufel/nwjs-ffmpeg-prebuilt/releases/download";
const PLAYWRIGHT_CDN: &str = "https://playwright.azureedge.net/builds";

static RIPGREP_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"VERSION\s+=\s+'(v[\d.-]+)';").expect("ripgrep tag pattern is valid")
});

/// `(flatpak arch, nwjs arch, nw-builder platform)`
const NWJS_ARCHES: [(Arch, &str, &str); 2] = [
    (Arch::X86_64, "linux-x64", "linux64"),
    (Arch::I386, "linux-ia32", "linux32"),
];

const RIPGREP_ARCHES: [(Arch, &str); 4] = [
    (Arch::X86_64, "x86_64-unknown-linux-musl"),
    (Arch::I386, "i686-unknown-linux-musl"),
    (Arch::Arm, "arm-unknown-linux-gnueabihf"),
    (Arch::Aarch64, "aarch64-unknown-linux-gnu"),
];

/// `(flatpak arch, package name from 0.16.0, older package name)`
const ESBUILD_PACKAGES: [(Arch, &str, &str); 4] = [
    (Arch::X86_64, "@esbuild/linux-x64", "esbuild-linux-64"),
    (Arch::I386, "@esbuild/linux-ia32", "esbuild-linux-32"),
    (Arch::Arm, "@esbuild/linux-arm", "esbuild-linux-arm"),
    (Arch::Aarch64, "@esbuild/linux-arm64", "esbuild-linux-arm64"),
];

#[derive(Debug, Deserialize)]
struct NwjsVersions {
    latest: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddedGit {
    url: String,
    name: String,
    checksum: String,
}

#[derive(Debug, Deserialize)]
struct BrowsersJson {
    browsers: Vec<Browser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Browser {
    name: String,
    revision: Revision,
    #[serde(default = "install_by_default")]
    install_by_default: bool,
}

fn install_by_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Revision {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RegistryVersion {
    dist: RegistryDist,
}

#[derive(Debug, Deserialize)]
struct RegistryDist {
    tarball: String,
    integrity: String,
}

/// Download URL for one playwright browser build.
fn playwright_url(
    playwright: &Version,
    name: &str,
    revision: u64,
) -> Result<String, GenerateError> {
    let url = match name {
        // Chromium builds switched to small incrementing revisions in 1.21.
        "chromium" if *playwright < Version::new(1, 21, 0) && revision < 792_639 => format!(
            "https://storage.googleapis.com/chromium-browser-snapshots/Linux_x64/{revision}/chrome-linux.zip"
        ),
        "chromium" => format!("{PLAYWRIGHT_CDN}/chromium/{revision}/chromium-linux.zip"),
        "firefox" if revision < 1140 => {
            format!("{PLAYWRIGHT_CDN}/firefox/{revision}/firefox-linux.zip")
        }
        "firefox" => format!("{PLAYWRIGHT_CDN}/firefox/{revision}/firefox-ubuntu-22.04.zip"),
        "webkit" if revision < 1317 => {
            format!("{PLAYWRIGHT_CDN}/webkit/{revision}/minibrowser-gtk-wpe.zip")
        }
        "webkit" => format!("{PLAYWRIGHT_CDN}/webkit/{revision}/webkit-ubuntu-20.04.zip"),
        "ffmpeg" => format!("{PLAYWRIGHT_CDN}/ffmpeg/{revision}/ffmpeg-linux.zip"),
        other => {
            return Err(GenerateError::context(
                "playwright",
                format!("unknown browser {other}"),
            ));
        }
    };
    Ok(url)
}

impl SpecialSourceProvider {
    pub(super) async fn handle_nw_builder(&self) -> Result<(), GenerateError> {
        let version = match &self.options.nwjs_version {
            Some(version) => version.trim_start_matches('v').to_string(),
            None => {
                let versions: NwjsVersions =
                    self.fetch_json("https://nwjs.io/versions.json", false).await?;
                versions.latest.trim_start_matches('v').to_string()
            }
        };

        if self.options.nwjs_node_headers {
            let url = format!("{NWJS_MIRROR}/v{version}/nw-headers-v{version}.tar.gz");
            let integrity = self.remote_integrity(&url, true).await?;
            self.generator.add_archive_source(
                &url,
                &integrity,
                &data_root().join("node-gyp").join("nwjs-current"),
                1,
                &[],
            )?;
        }

        let cache_dir = data_root().join("nwjs-cache").join(format!("{version}-normal"));
        for (arch, nwjs_arch, platform) in NWJS_ARCHES {
            let url = format!("{NWJS_MIRROR}/v{version}/nwjs-v{version}-{nwjs_arch}.tar.gz");
            let integrity = self.remote_integrity(&url, true).await?;
            let dest = cache_dir.join(platform);
            self.generator
                .add_archive_source(&url, &integrity, &dest, 1, &[arch])?;

            if self.options.nwjs_ffmpeg {
                let url = format!("{NWJS_FFMPEG_MIRROR}/{version}/{version}-{nwjs_arch}.zip");
                let integrity = self.remote_integrity(&url, true).await?;
                self.generator
                    .add_archive_source(&url, &integrity, &dest, 0, &[arch])?;
            }
        }

        self.generator
            .add_text_source(&version, &data_root().join("nwjs-version"))?;
        Ok(())
    }

    pub(super) async fn handle_dugite(&self, package: &Package) -> Result<(), GenerateError> {
        let url = format!(
            "https://unpkg.com/{}@{}/script/embedded-git.json",
            package.name, package.version
        );
        let mut assets: HashMap<String, EmbeddedGit> = self.fetch_json(&url, true).await?;
        let asset = assets
            .remove("linux-x64")
            .ok_or_else(|| FetchError::invalid(&url, "no linux-x64 entry"))?;
        let integrity = Integrity::from_hex(HashAlgorithm::Sha256, &asset.checksum)
            .map_err(|e| FetchError::invalid(&url, e))?;

        self.generator.add_url_source(
            &asset.url,
            &integrity,
            &tmp_root().join(&asset.name),
            &[Arch::X86_64],
        )?;
        Ok(())
    }

    pub(super) async fn handle_ripgrep(&self, package: &Package) -> Result<(), GenerateError> {
        let url = format!(
            "https://github.com/microsoft/vscode-ripgrep/raw/v{}/lib/postinstall.js",
            package.version
        );
        let script = self.fetch_text(&url, true).await?;
        let tag = capture(&RIPGREP_TAG, &script, &url)?;

        let dest = tmp_root().join(format!("vscode-ripgrep-cache-{}", package.version));
        for (arch, target) in RIPGREP_ARCHES {
            let filename = format!("ripgrep-{tag}-{target}.tar.gz");
            let url = format!(
                "https://github.com/microsoft/ripgrep-prebuilt/releases/download/{tag}/{filename}"
            );
            let integrity = self.remote_integrity(&url, true).await?;
            self.generator
                .add_url_source(&url, &integrity, &dest.join(&filename), &[arch])?;
        }
        Ok(())
    }

    pub(super) async fn handle_playwright(&self, package: &Package) -> Result<(), GenerateError> {
        let version = parse_version(&package.version)?;
        let base_url = format!("https://github.com/microsoft/playwright/raw/v{}/", package.version);
        let url = if version >= Version::new(1, 16, 0) {
            format!("{base_url}packages/playwright-core/browsers.json")
        } else {
            format!("{base_url}browsers.json")
        };
        let browsers: BrowsersJson = self.fetch_json(&url, true).await?;

        for browser in browsers.browsers.iter().filter(|b| b.install_by_default) {
            let revision = match &browser.revision {
                Revision::Number(revision) => *revision,
                Revision::Text(text) => text
                    .parse()
                    .map_err(|e| FetchError::invalid(&url, format!("revision {text}: {e}")))?,
            };

            let download = playwright_url(&version, &browser.name, revision)?;
            let integrity = self.remote_integrity(&download, true).await?;
            let dest = data_root()
                .join("cache")
                .join("ms-playwright")
                .join(format!("{}-{revision}", browser.name));

            self.generator
                .add_archive_source(&download, &integrity, &dest, 0, &[])?;
            self.generator
                .add_text_source("flatpak-node-cache", &dest.join("INSTALLATION_COMPLETE"))?;
        }
        Ok(())
    }

    pub(super) async fn handle_esbuild(&self, package: &Package) -> Result<(), GenerateError> {
        let scoped = parse_version(&package.version)? >= Version::new(0, 16, 0);
        let cache_dir = data_root().join("cache").join("esbuild");

        for (arch, scoped_name, legacy_name) in ESBUILD_PACKAGES {
            let name = if scoped { scoped_name } else { legacy_name };
            let id = format!("{name}@{}", package.version);

            let url = format!("https://registry.npmjs.org/{name}/{}", package.version);
            let registry: RegistryVersion = self.fetch_json(&url, false).await?;
            let integrity = Integrity::parse(&registry.dist.integrity)
                .map_err(|e| FetchError::invalid(&url, e))?;

            let package_dir = Path::new(".package").join(&id);
            self.generator.add_archive_source(
                &registry.dist.tarball,
                &integrity,
                &cache_dir.join(&package_dir),
                1,
                &[arch],
            )?;

            let bin = Path::new("bin").join(&id);
            let bin_dir = bin.parent().unwrap_or(Path::new("bin"));
            let bin_name = bin
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.generator.add_shell_source(
                vec![
                    format!("mkdir -p \"{}\"", bin_dir.display()),
                    format!(
                        "cp \"{}\" \"{}\"",
                        package_dir.join("bin").join("esbuild").display(),
                        bin.display()
                    ),
                    format!("ln -sf \"{bin_name}\" \"bin/esbuild-current\""),
                ],
                Some(&cache_dir),
                &[arch],
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::SpecialOptions;
    use super::super::test_support::{package, provider};
    use super::*;
    use crate::fetch::StubFetcher;
    use nodesrc_schema::{InlineContents, Source};

    #[test]
    fn playwright_download_urls() {
        let old = Version::new(1, 15, 0);
        let new = Version::new(1, 40, 0);
        assert_eq!(
            playwright_url(&old, "chromium", 792_000).unwrap(),
            "https://storage.googleapis.com/chromium-browser-snapshots/Linux_x64/792000/chrome-linux.zip"
        );
        assert_eq!(
            playwright_url(&new, "chromium", 1091).unwrap(),
            "https://playwright.azureedge.net/builds/chromium/1091/chromium-linux.zip"
        );
        assert!(playwright_url(&new, "firefox", 1139).unwrap().ends_with("firefox-linux.zip"));
        assert!(playwright_url(&new, "firefox", 1140).unwrap().ends_with("firefox-ubuntu-22.04.zip"));
        assert!(playwright_url(&new, "webkit", 1400).unwrap().ends_with("webkit-ubuntu-20.04.zip"));
        assert!(playwright_url(&new, "netscape", 1).is_err());
    }

    #[tokio::test]
    async fn playwright_browsers_marked_complete() {
        let stub = StubFetcher::new().with_response(
            "https://github.com/microsoft/playwright/raw/v1.40.0/packages/playwright-core/browsers.json",
            r#"{"browsers": [
                {"name": "chromium", "revision": "1091", "installByDefault": true},
                {"name": "webkit", "revision": "1944", "installByDefault": false},
                {"name": "ffmpeg", "revision": "1009"}
            ]}"#,
        );
        let (generator, provider) = provider(stub, SpecialOptions::default());
        provider
            .generate_special_sources(&package("playwright", "1.40.0"))
            .await
            .unwrap();

        let sources = generator.ordered_sources();
        let dests: Vec<_> = sources
            .iter()
            .filter_map(|source| match source {
                Source::Archive(archive) => archive.dest.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(
            dests,
            [
                "flatpak-node/cache/ms-playwright/chromium-1091",
                "flatpak-node/cache/ms-playwright/ffmpeg-1009",
            ]
        );
        let markers = sources
            .iter()
            .filter(|source| matches!(
                source,
                Source::Inline(inline) if inline.dest_filename == "INSTALLATION_COMPLETE"
                    && inline.contents == InlineContents::Text("flatpak-node-cache".into())
            ))
            .count();
        assert_eq!(markers, 2);
    }

    #[tokio::test]
    async fn esbuild_per_arch_binaries() {
        let mut stub = StubFetcher::new();
        for (_, name, _) in ESBUILD_PACKAGES {
            let body = format!(
                r#"{{"dist": {{"tarball": "https://registry.npmjs.org/{name}/-/tarball.tgz", "integrity": "{}"}}}}"#,
                Integrity::generate(name, HashAlgorithm::Sha512).to_sri()
            );
            stub = stub.with_response(format!("https://registry.npmjs.org/{name}/0.19.0"), body);
        }
        let (generator, provider) = provider(stub, SpecialOptions::default());
        provider
            .generate_special_sources(&package("esbuild", "0.19.0"))
            .await
            .unwrap();

        let sources = generator.ordered_sources();
        assert_eq!(sources.len(), 8);
        assert!(sources.iter().any(|source| matches!(
            source,
            Source::Shell(shell) if shell.only_arches == [Arch::X86_64]
                && shell.dest.as_deref() == Some("flatpak-node/cache/esbuild")
                && shell.commands == [
                    "mkdir -p \"bin/@esbuild\"",
                    "cp \".package/@esbuild/linux-x64@0.19.0/bin/esbuild\" \"bin/@esbuild/linux-x64@0.19.0\"",
                    "ln -sf \"linux-x64@0.19.0\" \"bin/esbuild-current\"",
                ]
        )));
    }

    #[tokio::test]
    async fn nw_builder_pinned_version() {
        let options = SpecialOptions {
            nwjs_version: Some("v0.80.0".into()),
            nwjs_ffmpeg: true,
            ..SpecialOptions::default()
        };
        let (generator, provider) = provider(StubFetcher::new(), options);
        provider
            .generate_special_sources(&package("nw-builder", "3.8.0"))
            .await
            .unwrap();

        let sources = generator.ordered_sources();
        // Two NW.js archives, two ffmpeg zips and the version file.
        assert_eq!(sources.len(), 5);
        assert!(sources.iter().any(|source| matches!(
            source,
            Source::Archive(archive) if archive.url == "https://dl.nwjs.io/v0.80.0/nwjs-v0.80.0-linux-ia32.tar.gz"
                && archive.dest.as_deref() == Some("flatpak-node/nwjs-cache/0.80.0-normal/linux32")
                && archive.only_arches == [Arch::I386]
        )));
        assert!(sources.iter().any(|source| matches!(
            source,
            Source::Inline(inline) if inline.dest_filename == "nwjs-version"
                && inline.contents == InlineContents::Text("0.80.0".into())
        )));
    }

    #[tokio::test]
    async fn dugite_embedded_git() {
        let checksum = Integrity::generate("git", HashAlgorithm::Sha256);
        let stub = StubFetcher::new().with_response(
            "https://unpkg.com/dugite@2.5.0/script/embedded-git.json",
            format!(
                r#"{{"linux-x64": {{"url": "https://github.com/desktop/dugite-native/git.tar.gz", "name": "git.tar.gz", "checksum": "{}"}}}}"#,
                checksum.digest()
            ),
        );
        let (generator, provider) = provider(stub, SpecialOptions::default());
        provider
            .generate_special_sources(&package("dugite", "2.5.0"))
            .await
            .unwrap();

        let sources = generator.ordered_sources();
        let [Source::File(file)] = sources.as_slice() else {
            panic!("expected one file, got {sources:?}");
        };
        assert_eq!(file.dest.as_deref(), Some("flatpak-node/tmp"));
        assert_eq!(file.dest_filename.as_deref(), Some("git.tar.gz"));
        assert_eq!(file.only_arches, [Arch::X86_64]);
    }
}
