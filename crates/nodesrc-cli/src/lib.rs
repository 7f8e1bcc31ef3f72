//! nodesrc - offline sources for node package managers
//!
//! Turns an npm, yarn or pnpm lockfile into a JSON list of sources a
//! sandboxed build tool can download ahead of time, laid out so that the
//! package manager installs without touching the network.
//!
//! # Build directory layout
//!
//! ```text
//! flatpak-node/
//! ├── npm-cache/        # _cacache content and index (npm)
//! ├── yarn-mirror/      # offline mirror tarballs (yarn)
//! ├── pnpm-tarballs/    # tarballs unpacked into pnpm-store/ (pnpm)
//! ├── git-packages/     # git dependency checkouts
//! ├── cache/            # electron, node-gyp, playwright, esbuild caches
//! └── patch/            # per-lockfile git specifier rewrites
//! ```

#![allow(missing_docs)]
#![allow(clippy::doc_markdown)]

pub mod cmd;
pub mod ui;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use nodesrc_core::fetch::DEFAULT_RETRIES;
use nodesrc_core::manifest::DEFAULT_SPLIT_SIZE_KB;
use nodesrc_core::providers::{DEFAULT_REGISTRY, Dialect};
use nodesrc_core::scheduler::DEFAULT_MAX_PARALLEL;
use nodesrc_core::special::ElectronFfmpeg;

#[derive(Debug, Parser)]
#[command(name = "nodesrc")]
#[command(author, version, about = "Offline sources manifests for npm, yarn and pnpm lockfiles")]
pub struct Cli {
    /// Only print warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Generate a sources manifest from a lockfile
    Generate(Box<GenerateArgs>),
    /// Unpack downloaded pnpm tarballs into a content-addressed store
    #[command(name = "populate-pnpm-store")]
    PopulatePnpmStore {
        /// Store manifest written by `generate`
        manifest: PathBuf,
        /// Directory holding the downloaded tarballs
        tarball_dir: PathBuf,
        /// pnpm store directory to fill
        store_dir: PathBuf,
    },
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Package manager that wrote the lockfile (npm, yarn or pnpm)
    #[arg(value_name = "TYPE")]
    pub dialect: Dialect,

    /// The lockfile path (package-lock.json, yarn.lock or pnpm-lock.yaml)
    pub lockfile: PathBuf,

    /// The output sources file
    #[arg(short, long, default_value = "generated-sources.json")]
    pub output: PathBuf,

    /// Process every file under the lockfile's directory with the lockfile's name
    #[arg(short, long)]
    pub recursive: bool,

    /// Restrict recursive lockfiles to those matching this glob (repeatable)
    #[arg(short = 'R', long = "recursive-pattern", value_name = "PATTERN")]
    pub recursive_patterns: Vec<String>,

    /// Registry used for packuments and synthesised tarball URLs
    #[arg(long, env = "NODESRC_REGISTRY", default_value = DEFAULT_REGISTRY)]
    pub registry: String,

    /// Keep full packuments in the npm cache index
    #[arg(long)]
    pub no_trim_index: bool,

    /// Leave out development dependencies (npm and pnpm)
    #[arg(long)]
    pub no_devel: bool,

    /// Disable the requests cache
    #[arg(long)]
    pub no_requests_cache: bool,

    /// Maximum number of packages processed in parallel
    #[arg(long, default_value_t = DEFAULT_MAX_PARALLEL)]
    pub max_parallel: usize,

    /// Attempts per request before giving up
    #[arg(long, default_value_t = DEFAULT_RETRIES)]
    pub retries: u32,

    /// Don't run the git specifier patches automatically
    #[arg(short = 'P', long)]
    pub no_autopatch: bool,

    /// Split the sources file into parts no larger than --split-size
    #[arg(short, long)]
    pub split: bool,

    /// Size limit per output file, in KB
    #[arg(long, default_value_t = DEFAULT_SPLIT_SIZE_KB)]
    pub split_size: u64,

    /// Skip packages that fail to generate instead of aborting
    #[arg(long)]
    pub keep_going: bool,

    /// Take chromedriver for node-chromedriver from this electron release
    #[arg(long, value_name = "VERSION")]
    pub node_chromedriver_from_electron: Option<String>,

    /// Deprecated spelling of --node-chromedriver-from-electron
    #[arg(long, hide = true, value_name = "VERSION")]
    pub electron_chromedriver: Option<String>,

    /// Download electron's prebuilt ffmpeg (archive or lib)
    #[arg(long, value_name = "MODE")]
    pub electron_ffmpeg: Option<ElectronFfmpeg>,

    /// Download the electron node headers
    #[arg(long)]
    pub electron_node_headers: bool,

    /// NW.js version for nw-builder (latest otherwise)
    #[arg(long, value_name = "VERSION")]
    pub nwjs_version: Option<String>,

    /// Download the NW.js node headers
    #[arg(long)]
    pub nwjs_node_headers: bool,

    /// Download prebuilt ffmpeg for the NW.js version
    #[arg(long)]
    pub nwjs_ffmpeg: bool,

    /// Don't use the XDG layout for caches
    #[arg(long)]
    pub no_xdg_layout: bool,

    /// Serve empty responses instead of touching the network
    #[arg(long, hide = true)]
    pub stub_requests: bool,
}
