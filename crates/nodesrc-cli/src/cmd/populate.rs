//! The `populate-pnpm-store` command: host-side equivalent of the
//! `pnpm_store.py` script a pnpm manifest runs during the build.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use nodesrc_core::providers::pnpm::{PnpmStoreManifest, StorePackage};
use nodesrc_schema::{HashAlgorithm, Integrity};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

static UNSAFE_ID_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\\/:*?"<>|]"#).expect("id sanitising pattern is valid"));

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexedFile {
    checked_at: u128,
    integrity: String,
    mode: u32,
    size: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PackageIndex<'a> {
    name: &'a str,
    version: &'a str,
    requires_build: bool,
    files: BTreeMap<String, IndexedFile>,
}

/// Unpack every tarball listed in `manifest` into `store_dir`.
pub fn populate_pnpm_store(manifest: &Path, tarball_dir: &Path, store_dir: &Path) -> Result<()> {
    let text = fs::read_to_string(manifest)
        .with_context(|| format!("Failed to read {}", manifest.display()))?;
    let manifest: PnpmStoreManifest = serde_json::from_str(&text)
        .with_context(|| format!("Invalid store manifest {}", manifest.display()))?;

    let store = store_dir.join(&manifest.store_version);
    for sub in ["files", "index"] {
        let dir = store.join(sub);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();

    for (tarball, package) in &manifest.packages {
        let path = tarball_dir.join(tarball);
        if !path.is_file() {
            bail!("{} not found", path.display());
        }
        add_tarball(&path, package, &store, now)?;
    }

    info!(
        "Populated {} with {} packages",
        store.display(),
        manifest.packages.len()
    );
    Ok(())
}

fn add_tarball(path: &Path, package: &StorePackage, store: &Path, now: u128) -> Result<()> {
    let file = fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut files = BTreeMap::new();

    for entry in archive
        .entries()
        .with_context(|| format!("Failed to read {}", path.display()))?
    {
        let mut entry = entry.with_context(|| format!("Corrupt entry in {}", path.display()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = entry.path()?.to_string_lossy().into_owned();
        let mode = entry.header().mode()?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("Failed to read {name} from {}", path.display()))?;

        let integrity = Integrity::generate(&data, HashAlgorithm::Sha512);
        write_content(store, &integrity, &data, mode & 0o111 != 0)?;

        // Index paths are relative to the tarball's top-level directory.
        let relative = name.split_once('/').map_or(name.as_str(), |(_, rest)| rest);
        files.insert(
            relative.to_string(),
            IndexedFile {
                checked_at: now,
                integrity: integrity.to_sri(),
                mode,
                size: data.len() as u64,
            },
        );
    }

    let index_path = index_path(store, package);
    if let Some(parent) = index_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let index = PackageIndex {
        name: &package.name,
        version: &package.version,
        requires_build: package.requires_build,
        files,
    };
    fs::write(&index_path, serde_json::to_vec(&index)?)
        .with_context(|| format!("Failed to write {}", index_path.display()))?;

    debug!("Indexed {}@{}", package.name, package.version);
    Ok(())
}

/// `<store>/files/<aa>/<rest>[-exec]`, written once per digest.
fn write_content(store: &Path, integrity: &Integrity, data: &[u8], executable: bool) -> Result<()> {
    let hex = integrity.digest();
    let dir = store.join("files").join(&hex[..2]);
    let suffix = if executable { "-exec" } else { "" };
    let path = dir.join(format!("{}{suffix}", &hex[2..]));
    if path.exists() {
        return Ok(());
    }

    fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    fs::write(&path, data).with_context(|| format!("Failed to write {}", path.display()))?;
    if executable {
        set_executable(&path)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
fn set_executable(_: &Path) -> Result<()> {
    Ok(())
}

/// `<store>/index/<aa>/<next 62 hex>-<name@version>.json`
fn index_path(store: &Path, package: &StorePackage) -> PathBuf {
    let hex = &package.integrity_hex;
    let prefix = hex.get(..2).unwrap_or(hex);
    let rest = hex.get(2..64).or_else(|| hex.get(2..)).unwrap_or_default();
    let id = format!("{}@{}", package.name, package.version);
    let id = UNSAFE_ID_CHARS.replace_all(&id, "+");
    store
        .join("index")
        .join(prefix)
        .join(format!("{rest}-{id}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn tarball(path: &Path, files: &[(&str, &[u8], u32)]) {
        let file = fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, data, mode) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(*mode);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn fills_content_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let tarballs = dir.path().join("tarballs");
        fs::create_dir_all(&tarballs).unwrap();
        tarball(
            &tarballs.join("@types-node-18.0.0.tgz"),
            &[
                ("package/package.json", b"{}", 0o644),
                ("package/bin/cli.js", b"#!/usr/bin/env node", 0o755),
            ],
        );

        let integrity_hex = "ab".repeat(64);
        let mut packages = BTreeMap::new();
        packages.insert(
            "@types-node-18.0.0.tgz".to_string(),
            StorePackage {
                name: "@types/node".into(),
                version: "18.0.0".into(),
                integrity_hex: integrity_hex.clone(),
                requires_build: false,
            },
        );
        let manifest = PnpmStoreManifest {
            store_version: "v10".into(),
            packages,
        };
        let manifest_path = dir.path().join("pnpm-manifest.json");
        fs::write(&manifest_path, serde_json::to_string(&manifest).unwrap()).unwrap();

        let store = dir.path().join("store");
        populate_pnpm_store(&manifest_path, &tarballs, &store).unwrap();

        let json = Integrity::generate(b"{}", HashAlgorithm::Sha512);
        let content = store
            .join("v10/files")
            .join(&json.digest()[..2])
            .join(&json.digest()[2..]);
        assert_eq!(fs::read(content).unwrap(), b"{}");

        let script = Integrity::generate(b"#!/usr/bin/env node", HashAlgorithm::Sha512);
        let exec = store
            .join("v10/files")
            .join(&script.digest()[..2])
            .join(format!("{}-exec", &script.digest()[2..]));
        assert!(exec.is_file());

        let index = store
            .join("v10/index/ab")
            .join(format!("{}-@types+node@18.0.0.json", &integrity_hex[2..64]));
        let index: serde_json::Value =
            serde_json::from_slice(&fs::read(index).unwrap()).unwrap();
        assert_eq!(index["name"], "@types/node");
        assert_eq!(index["requiresBuild"], false);
        assert_eq!(index["files"]["package.json"]["size"], 2);
        assert_eq!(index["files"]["package.json"]["integrity"], json.to_sri());
        assert_eq!(index["files"]["bin/cli.js"]["mode"], 0o755);
    }

    #[test]
    fn missing_tarball_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut packages = BTreeMap::new();
        packages.insert(
            "left-pad-1.3.0.tgz".to_string(),
            StorePackage {
                name: "left-pad".into(),
                version: "1.3.0".into(),
                integrity_hex: "00".repeat(64),
                requires_build: false,
            },
        );
        let manifest_path = dir.path().join("manifest.json");
        fs::write(
            &manifest_path,
            serde_json::to_string(&PnpmStoreManifest {
                store_version: "v10".into(),
                packages,
            })
            .unwrap(),
        )
        .unwrap();

        let err = populate_pnpm_store(&manifest_path, dir.path(), &dir.path().join("store"))
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
