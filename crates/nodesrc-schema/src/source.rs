//! Manifest sources: the declarative fetch-and-place instructions consumed by
//! the sandboxed build.
//!
//! The derived `Ord` is the canonical order of the output manifest: variants
//! compare by their `type` name first, then field by field in the order they
//! are written to JSON.

use std::path::Path;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::arch::Arch;
use crate::integrity::Integrity;

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Source {
    /// An archive unpacked into a directory.
    Archive(ArchiveSource),
    /// A single file, downloaded or copied from the host.
    File(FileSource),
    /// A repository checkout.
    Git(GitCheckout),
    /// Literal content written to a file.
    Inline(InlineSource),
    /// A generated shell script file.
    Script(ScriptSource),
    /// Commands run in place during materialisation.
    Shell(ShellSource),
}

impl Source {
    /// The manifest `type` value.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Archive(_) => "archive",
            Self::File(_) => "file",
            Self::Git(_) => "git",
            Self::Inline(_) => "inline",
            Self::Script(_) => "script",
            Self::Shell(_) => "shell",
        }
    }
}

/// Where a file source reads from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileOrigin {
    /// A path on the machine running the build.
    Path(String),
    /// A remote URL verified against `integrity`.
    Url {
        /// Download location.
        url: String,
        /// Expected digest of the downloaded bytes.
        integrity: Integrity,
    },
}

/// `type: file`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileSource {
    /// Where the bytes come from.
    pub origin: FileOrigin,
    /// File name inside `dest`; defaults to the last URL segment.
    pub dest_filename: Option<String>,
    /// Directory relative to the build root.
    pub dest: Option<String>,
    /// Architectures that fetch this file; empty means all.
    pub only_arches: Vec<Arch>,
}

/// `type: archive`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchiveSource {
    /// Download location.
    pub url: String,
    /// Leading path components dropped while unpacking.
    pub strip_components: u32,
    /// Expected digest of the archive.
    pub integrity: Integrity,
    /// Directory the archive is unpacked into.
    pub dest: Option<String>,
    /// Architectures that fetch this archive; empty means all.
    pub only_arches: Vec<Arch>,
}

/// Which revision a git checkout pins.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GitRevision {
    /// A full commit hash.
    Commit(String),
    /// A tag name, resolved by the build tool.
    Tag(String),
}

/// `type: git`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GitCheckout {
    /// Clone URL.
    pub url: String,
    /// Pinned revision.
    pub revision: GitRevision,
    /// Checkout directory.
    pub dest: Option<String>,
}

/// Payload of an inline source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InlineContents {
    /// UTF-8 text written verbatim.
    Text(String),
    /// Binary payload, stored base64 encoded.
    Base64(String),
}

/// `type: inline`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InlineSource {
    /// File content.
    pub contents: InlineContents,
    /// Name of the written file.
    pub dest_filename: String,
    /// Directory the file is written to.
    pub dest: Option<String>,
}

/// `type: script`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScriptSource {
    /// Script lines, in order.
    pub commands: Vec<String>,
    /// Name of the script file.
    pub dest_filename: String,
    /// Directory the script is written to.
    pub dest: Option<String>,
}

/// `type: shell`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShellSource {
    /// Commands run in order.
    pub commands: Vec<String>,
    /// Working directory.
    pub dest: Option<String>,
    /// Architectures that run these commands; empty means all.
    pub only_arches: Vec<Arch>,
}

/// Split a file destination into `(dest-filename, dest)`.
///
/// A bare file name has no `dest`; anything deeper places the file under its
/// parent directory.
pub fn split_destination(path: &Path) -> (String, Option<String>) {
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = path
        .parent()
        .map(|parent| parent.to_string_lossy().into_owned())
        .filter(|parent| !parent.is_empty());
    (filename, parent)
}

/// Render a directory destination.
pub fn dir_destination(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn arch_names(arches: &[Arch]) -> Vec<&'static str> {
    arches.iter().map(Arch::as_str).collect()
}

impl Serialize for Source {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.kind())?;

        match self {
            Self::Archive(archive) => {
                map.serialize_entry("url", &archive.url)?;
                map.serialize_entry("strip-components", &archive.strip_components)?;
                map.serialize_entry(archive.integrity.algorithm().as_str(), archive.integrity.digest())?;
                if let Some(dest) = &archive.dest {
                    map.serialize_entry("dest", dest)?;
                }
                if !archive.only_arches.is_empty() {
                    map.serialize_entry("only-arches", &arch_names(&archive.only_arches))?;
                }
            }
            Self::File(file) => {
                match &file.origin {
                    FileOrigin::Path(path) => map.serialize_entry("path", path)?,
                    FileOrigin::Url { url, integrity } => {
                        map.serialize_entry("url", url)?;
                        map.serialize_entry(integrity.algorithm().as_str(), integrity.digest())?;
                    }
                }
                if let Some(filename) = &file.dest_filename {
                    map.serialize_entry("dest-filename", filename)?;
                }
                if let Some(dest) = &file.dest {
                    map.serialize_entry("dest", dest)?;
                }
                if !file.only_arches.is_empty() {
                    map.serialize_entry("only-arches", &arch_names(&file.only_arches))?;
                }
            }
            Self::Git(git) => {
                map.serialize_entry("url", &git.url)?;
                match &git.revision {
                    GitRevision::Commit(commit) => map.serialize_entry("commit", commit)?,
                    GitRevision::Tag(tag) => map.serialize_entry("tag", tag)?,
                }
                if let Some(dest) = &git.dest {
                    map.serialize_entry("dest", dest)?;
                }
            }
            Self::Inline(inline) => {
                match &inline.contents {
                    InlineContents::Text(text) => map.serialize_entry("contents", text)?,
                    InlineContents::Base64(encoded) => {
                        map.serialize_entry("contents", encoded)?;
                        map.serialize_entry("base64", &true)?;
                    }
                }
                map.serialize_entry("dest-filename", &inline.dest_filename)?;
                if let Some(dest) = &inline.dest {
                    map.serialize_entry("dest", dest)?;
                }
            }
            Self::Script(script) => {
                map.serialize_entry("commands", &script.commands)?;
                map.serialize_entry("dest-filename", &script.dest_filename)?;
                if let Some(dest) = &script.dest {
                    map.serialize_entry("dest", dest)?;
                }
            }
            Self::Shell(shell) => {
                map.serialize_entry("commands", &shell.commands)?;
                if let Some(dest) = &shell.dest {
                    map.serialize_entry("dest", dest)?;
                }
                if !shell.only_arches.is_empty() {
                    map.serialize_entry("only-arches", &arch_names(&shell.only_arches))?;
                }
            }
        }

        map.end()
    }
}
