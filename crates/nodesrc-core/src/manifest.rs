//! Accumulates manifest sources from concurrent producers and renders them
//! in a deterministic order.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use nodesrc_schema::{
    Arch, ArchiveSource, FileOrigin, FileSource, GitCheckout, GitRevision, InlineContents,
    InlineSource, Integrity, ScriptSource, ShellSource, Source, dir_destination,
    split_destination,
};
use serde::Serialize;
use tracing::warn;

use crate::error::ManifestError;

/// GitHub rejects files above 50 MB; leave some headroom.
pub const DEFAULT_SPLIT_SIZE_KB: u64 = 49 * 1000;

const JSON_INDENT: &[u8] = b"    ";

/// Separator between two array entries in the rendered JSON (`,\n`).
const ENTRY_SEPARATOR_LEN: u64 = 2;

/// Where a downloaded artifact lands. Two sources with the same placement
/// must agree on the content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Placement {
    File {
        dest: String,
        arches: Vec<Arch>,
    },
    Archive {
        dest: String,
        url: String,
        arches: Vec<Arch>,
    },
}

#[derive(Debug, Default)]
struct State {
    sources: BTreeSet<Source>,
    placements: HashMap<Placement, Integrity>,
    checkouts: HashMap<(String, GitRevision), String>,
    package_commands: BTreeMap<String, Vec<String>>,
    commands: Vec<String>,
    finalized: bool,
}

/// The shared sink every provider writes into.
///
/// Inserts are idempotent: adding an equal source twice keeps one copy.
#[derive(Debug, Default)]
pub struct ManifestGenerator {
    state: Mutex<State>,
}

impl ManifestGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(
        &self,
        source: Source,
        placement: Option<(Placement, &Integrity)>,
    ) -> Result<(), ManifestError> {
        let mut state = self.state();
        if state.finalized {
            return Err(ManifestError::Finalized);
        }

        if let Some((placement, integrity)) = placement {
            match state.placements.get(&placement) {
                Some(existing) if existing != integrity => {
                    let dest = match &placement {
                        Placement::File { dest, .. } | Placement::Archive { dest, .. } => {
                            dest.clone()
                        }
                    };
                    return Err(ManifestError::DestinationConflict {
                        dest,
                        existing: existing.to_string(),
                        incoming: integrity.to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    state.placements.insert(placement, integrity.clone());
                }
            }
        }

        state.sources.insert(source);
        Ok(())
    }

    /// Download `url` to the file `dest`.
    pub fn add_url_source(
        &self,
        url: &str,
        integrity: &Integrity,
        dest: &Path,
        only_arches: &[Arch],
    ) -> Result<(), ManifestError> {
        let (filename, dir) = split_destination(dest);
        let placement = Placement::File {
            dest: dest.to_string_lossy().into_owned(),
            arches: only_arches.to_vec(),
        };
        let source = Source::File(FileSource {
            origin: FileOrigin::Url {
                url: url.to_string(),
                integrity: integrity.clone(),
            },
            dest_filename: Some(filename),
            dest: dir,
            only_arches: only_arches.to_vec(),
        });
        self.insert(source, Some((placement, integrity)))
    }

    /// Download and unpack `url` into the directory `dest`.
    pub fn add_archive_source(
        &self,
        url: &str,
        integrity: &Integrity,
        dest: &Path,
        strip_components: u32,
        only_arches: &[Arch],
    ) -> Result<(), ManifestError> {
        let dest = dir_destination(dest);
        let placement = Placement::Archive {
            dest: dest.clone(),
            url: url.to_string(),
            arches: only_arches.to_vec(),
        };
        let source = Source::Archive(ArchiveSource {
            url: url.to_string(),
            strip_components,
            integrity: integrity.clone(),
            dest: Some(dest),
            only_arches: only_arches.to_vec(),
        });
        self.insert(source, Some((placement, integrity)))
    }

    /// Check out `url` at `revision` into `dest`.
    ///
    /// One `(url, revision)` pair has exactly one checkout directory.
    pub fn add_git_source(
        &self,
        url: &str,
        revision: GitRevision,
        dest: &Path,
    ) -> Result<(), ManifestError> {
        let dest = dir_destination(dest);
        {
            let mut state = self.state();
            let key = (url.to_string(), revision.clone());
            match state.checkouts.get(&key) {
                Some(existing) if *existing != dest => {
                    let revision = match revision {
                        GitRevision::Commit(commit) | GitRevision::Tag(commit) => commit,
                    };
                    return Err(ManifestError::CheckoutConflict {
                        url: url.to_string(),
                        commit: revision,
                        existing: existing.clone(),
                        incoming: dest,
                    });
                }
                Some(_) => {}
                None => {
                    state.checkouts.insert(key, dest.clone());
                }
            }
        }

        let source = Source::Git(GitCheckout {
            url: url.to_string(),
            revision,
            dest: Some(dest),
        });
        self.insert(source, None)
    }

    /// Write literal text to `dest`.
    pub fn add_text_source(&self, text: &str, dest: &Path) -> Result<(), ManifestError> {
        self.add_inline(InlineContents::Text(text.to_string()), dest)
    }

    /// Write binary data to `dest`, base64 encoded in the manifest.
    pub fn add_data_source(&self, data: &[u8], dest: &Path) -> Result<(), ManifestError> {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        self.add_inline(InlineContents::Base64(encoded), dest)
    }

    fn add_inline(&self, contents: InlineContents, dest: &Path) -> Result<(), ManifestError> {
        let (filename, dir) = split_destination(dest);
        let source = Source::Inline(InlineSource {
            contents,
            dest_filename: filename,
            dest: dir,
        });
        self.insert(source, None)
    }

    /// Copy a file from the build host.
    pub fn add_local_file_source(&self, path: &Path, dest: &Path) -> Result<(), ManifestError> {
        let (filename, dir) = split_destination(dest);
        let source = Source::File(FileSource {
            origin: FileOrigin::Path(path.to_string_lossy().into_owned()),
            dest_filename: Some(filename),
            dest: dir,
            only_arches: Vec::new(),
        });
        self.insert(source, None)
    }

    /// Generate a shell script at `dest`.
    pub fn add_script_source(
        &self,
        commands: Vec<String>,
        dest: &Path,
    ) -> Result<(), ManifestError> {
        let (filename, dir) = split_destination(dest);
        let source = Source::Script(ScriptSource {
            commands,
            dest_filename: filename,
            dest: dir,
        });
        self.insert(source, None)
    }

    /// Run `commands` inside `dest` while sources are materialised.
    ///
    /// Each shell source is a separate step for the build tool; prefer
    /// [`ManifestGenerator::add_command`] for anything not tied to one arch.
    pub fn add_shell_source(
        &self,
        commands: Vec<String>,
        dest: Option<&Path>,
        only_arches: &[Arch],
    ) -> Result<(), ManifestError> {
        let source = Source::Shell(ShellSource {
            commands,
            dest: dest.map(dir_destination),
            only_arches: only_arches.to_vec(),
        });
        self.insert(source, None)
    }

    /// Queue commands owned by one package for the trailing shell source.
    ///
    /// Groups run ordered by `owner`, so concurrent producers cannot change
    /// the output. Repeats of the same group are ignored.
    pub fn add_package_commands(&self, owner: &str, commands: Vec<String>) {
        self.state()
            .package_commands
            .entry(owner.to_string())
            .or_insert(commands);
    }

    /// Queue a command for the trailing shell source, after every package
    /// command group. Only call this from sequential code (finalisation).
    pub fn add_command(&self, command: impl Into<String>) {
        self.state().commands.push(command.into());
    }

    /// Seal the generator; later additions fail.
    pub fn finalize(&self) {
        self.state().finalized = true;
    }

    /// Number of sources that [`ManifestGenerator::ordered_sources`] returns.
    pub fn source_count(&self) -> usize {
        let state = self.state();
        let trailing = usize::from(!state.commands.is_empty() || !state.package_commands.is_empty());
        state.sources.len() + trailing
    }

    /// Every source in canonical order, followed by the single shell source
    /// holding the queued commands.
    pub fn ordered_sources(&self) -> Vec<Source> {
        let state = self.state();
        let mut sources: Vec<Source> = state.sources.iter().cloned().collect();

        let mut seen = HashSet::new();
        let mut commands: Vec<String> = state
            .package_commands
            .values()
            .flatten()
            .filter(|command| seen.insert(command.as_str()))
            .cloned()
            .collect();
        commands.extend(state.commands.iter().cloned());

        if !commands.is_empty() {
            sources.push(Source::Shell(ShellSource {
                commands,
                dest: None,
                only_arches: Vec::new(),
            }));
        }
        sources
    }

    /// Partition [`ManifestGenerator::ordered_sources`] into chunks whose
    /// rendered payload (without the enclosing brackets) stays within
    /// `limit` bytes.
    ///
    /// A source larger than `limit` on its own gets a chunk to itself.
    pub fn split_sources(&self, limit: u64) -> Result<Vec<Vec<Source>>, ManifestError> {
        let mut chunks = Vec::new();
        let mut current: Vec<Source> = Vec::new();
        let mut current_size = 0u64;

        for source in self.ordered_sources() {
            let size = entry_size(&source)?;

            if !current.is_empty() && current_size + ENTRY_SEPARATOR_LEN + size > limit {
                chunks.push(std::mem::take(&mut current));
                current_size = 0;
            }

            if current.is_empty() {
                if size > limit {
                    warn!(
                        "A single {} source is {size} bytes, above the split size of {limit}",
                        source.kind()
                    );
                }
                current_size = size;
            } else {
                current_size += ENTRY_SEPARATOR_LEN + size;
            }
            current.push(source);
        }

        if !current.is_empty() {
            chunks.push(current);
        }
        Ok(chunks)
    }
}

/// Render sources as a JSON array with four-space indentation.
pub fn to_json(sources: &[Source]) -> Result<String, ManifestError> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(JSON_INDENT);
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    sources.serialize(&mut serializer)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Byte length of one source as it appears inside the rendered array.
fn entry_size(source: &Source) -> Result<u64, ManifestError> {
    let rendered = to_json(std::slice::from_ref(source))?;
    let lines: Vec<&str> = rendered.lines().collect();
    let inner = lines
        .get(1..lines.len().saturating_sub(1))
        .unwrap_or_default()
        .join("\n");
    Ok(inner.len() as u64)
}
