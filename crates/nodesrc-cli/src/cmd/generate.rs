//! The `generate` command: lockfiles in, sources manifest out.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use glob::Pattern;
use nodesrc_core::manifest::{ManifestGenerator, to_json};
use nodesrc_core::node_headers::INSTALL_VERSION;
use nodesrc_core::providers::{Dialect, ProviderContext, ProviderOptions, RcConfig};
use nodesrc_core::special::{SpecialOptions, SpecialSourceProvider};
use nodesrc_core::{
    Cache, FilesystemCache, Fetcher, HttpFetcher, NullCache, Reporter, Scheduler, StubFetcher,
    data_root, try_cache_root,
};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::GenerateArgs;

/// Run a full generation and write the output file(s).
pub async fn generate(args: &GenerateArgs, reporter: &dyn Reporter) -> Result<()> {
    if args.dialect == Dialect::Yarn && (args.no_devel || args.no_autopatch) {
        bail!("--no-devel and --no-autopatch do not apply to yarn");
    }
    if args.electron_chromedriver.is_some() {
        reporter.warning(
            "--electron-chromedriver is deprecated, use --node-chromedriver-from-electron",
        );
    }

    // Stub responses must never reach the persistent cache.
    let cache: Arc<dyn Cache> = if args.no_requests_cache || args.stub_requests {
        Arc::new(NullCache)
    } else if let Some(root) = try_cache_root() {
        debug!("Request cache at {}", root.display());
        Arc::new(FilesystemCache::new(root))
    } else {
        warn!("No cache directory available, requests will not be cached");
        Arc::new(NullCache)
    };

    let fetcher: Arc<dyn Fetcher> = if args.stub_requests {
        Arc::new(StubFetcher::new())
    } else {
        Arc::new(HttpFetcher::new(cache.clone())?.with_retries(args.retries))
    };

    let lockfiles = if args.recursive || !args.recursive_patterns.is_empty() {
        let found = scan_for_lockfiles(&args.lockfile, &args.recursive_patterns)?;
        if found.is_empty() {
            bail!("No lockfiles found.");
        }
        reporter.info(&format!("Found {} lockfiles.", found.len()));
        found
    } else {
        vec![args.lockfile.clone()]
    };
    let lockfile_root = args
        .lockfile
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let options = ProviderOptions {
        registry: args.registry.trim_end_matches('/').to_string(),
        include_devel: !args.no_devel,
        no_autopatch: args.no_autopatch,
        no_trim_index: args.no_trim_index,
    };

    reporter.section("Reading packages from lockfiles");
    let lockfile_provider = args.dialect.lockfile_provider(&options);
    let mut packages = Vec::new();
    let mut configs = HashMap::new();
    let mut rc_headers = BTreeSet::new();

    for lockfile in &lockfiles {
        packages.extend(lockfile_provider.parse(lockfile)?);

        let config = RcConfig::load(lockfile, args.dialect.rc_files())?;
        if let Some(headers) = config.node_headers()? {
            rc_headers.insert(headers);
        }
        configs.insert(lockfile.clone(), config);
    }
    let unique: HashSet<_> = packages.iter().map(nodesrc_schema::Package::key).collect();
    reporter.info(&format!("{} packages read.", unique.len()));

    let generator = Arc::new(ManifestGenerator::new());
    let special = Arc::new(SpecialSourceProvider::new(
        generator.clone(),
        fetcher.clone(),
        cache.clone(),
        special_options(args),
    ));
    let context = ProviderContext {
        generator: generator.clone(),
        fetcher,
        cache,
        special: special.clone(),
        lockfile_root,
        configs,
    };
    let provider = args.dialect.module_provider(context, &options);

    reporter.section("Generating packages");
    let start = Instant::now();
    let summary = Scheduler::new(args.max_parallel)
        .keep_going(args.keep_going)
        .run(packages, provider.clone(), reporter)
        .await?;
    provider.finalize()?;

    for headers in &rc_headers {
        reporter.info(&format!(
            "Generating headers {} @ {}",
            headers.runtime, headers.target
        ));
        special.generate_node_headers(headers, None).await?;
    }

    if !args.no_xdg_layout {
        add_sdk_headers_script(&generator, &special.gyp_dir())?;
    }
    generator.finalize();

    reporter.summary(summary.generated, "generated", start.elapsed().as_secs_f64());
    if !summary.skipped.is_empty() {
        reporter.warning(&format!(
            "{} packages were skipped; the manifest is incomplete",
            summary.skipped.len()
        ));
    }

    write_output(&generator, args, reporter)
}

fn special_options(args: &GenerateArgs) -> SpecialOptions {
    SpecialOptions {
        node_chromedriver_from_electron: args
            .node_chromedriver_from_electron
            .clone()
            .or_else(|| args.electron_chromedriver.clone()),
        electron_ffmpeg: args.electron_ffmpeg,
        electron_node_headers: args.electron_node_headers,
        nwjs_version: args.nwjs_version.clone(),
        nwjs_node_headers: args.nwjs_node_headers,
        nwjs_ffmpeg: args.nwjs_ffmpeg,
        xdg_layout: !args.no_xdg_layout,
    }
}

/// Link the SDK's own node headers into the node-gyp cache at build time.
fn add_sdk_headers_script(generator: &ManifestGenerator, gyp_dir: &Path) -> Result<()> {
    let script = data_root().join("setup_sdk_node_headers.sh");
    let gyp_dir = gyp_dir.display();
    generator.add_script_source(
        vec![
            "version=$(node --version | sed \"s/^v//\")".to_string(),
            "nodedir=$(dirname \"$(dirname \"$(which node)\")\")".to_string(),
            format!("mkdir -p \"{gyp_dir}/$version\""),
            format!("ln -s \"$nodedir/include\" \"{gyp_dir}/$version/include\""),
            format!("echo {INSTALL_VERSION} > \"{gyp_dir}/$version/installVersion\""),
        ],
        &script,
    )?;
    generator.add_command(format!("bash {}", script.display()));
    Ok(())
}

/// Files named like `base` anywhere under its directory, optionally
/// restricted to paths whose tail matches one of `patterns`.
pub fn scan_for_lockfiles(base: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let Some(name) = base.file_name() else {
        bail!("{} is not a file path", base.display());
    };
    let root = match base.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut matchers = Vec::new();
    for pattern in patterns {
        let anchored =
            Pattern::new(pattern).with_context(|| format!("Invalid pattern '{pattern}'"))?;
        let tail = Pattern::new(&format!("**/{pattern}"))
            .with_context(|| format!("Invalid pattern '{pattern}'"))?;
        matchers.push((anchored, tail));
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to scan {}", root.display()))?;
        if !entry.file_type().is_file() || entry.file_name() != name {
            continue;
        }
        let path = entry.into_path();
        let keep = matchers.is_empty()
            || matchers
                .iter()
                .any(|(anchored, tail)| anchored.matches_path(&path) || tail.matches_path(&path));
        if keep {
            found.push(path);
        }
    }
    Ok(found)
}

/// `generated-sources.json` → `generated-sources.<index>.json`
pub fn numbered_output(output: &Path, index: usize) -> PathBuf {
    match output.extension() {
        Some(ext) => output.with_extension(format!("{index}.{}", ext.to_string_lossy())),
        None => output.with_extension(index.to_string()),
    }
}

fn write_output(
    generator: &ManifestGenerator,
    args: &GenerateArgs,
    reporter: &dyn Reporter,
) -> Result<()> {
    let limit = args.split_size.saturating_mul(1000);

    if args.split {
        let chunks = generator.split_sources(limit)?;
        for (index, chunk) in chunks.iter().enumerate() {
            let path = numbered_output(&args.output, index);
            std::fs::write(&path, to_json(chunk)?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        reporter.info(&format!(
            "Wrote {} sources to {} file(s).",
            generator.source_count(),
            chunks.len()
        ));
    } else {
        let json = to_json(&generator.ordered_sources())?;
        std::fs::write(&args.output, &json)
            .with_context(|| format!("Failed to write {}", args.output.display()))?;
        if json.len() as u64 >= limit {
            warn!(
                "{} is too large for GitHub (pass -s to enable splitting)",
                args.output.display()
            );
        }
        reporter.info(&format!("Wrote {} source(s).", generator.source_count()));
    }
    Ok(())
}
