//! Node/Electron header tarballs needed by native module builds.

use crate::error::GenerateError;

/// Version written to `installVersion` next to unpacked headers.
pub const INSTALL_VERSION: &str = "9";

/// Headers for one runtime release.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeHeaders {
    /// Release version, without a leading `v`.
    pub target: String,
    /// Runtime name, such as `node` or `electron`.
    pub runtime: String,
    /// Download root the tarball lives under.
    pub disturl: String,
}

impl NodeHeaders {
    /// Fill in the runtime (`node`) and its download root when not given.
    pub fn with_defaults(
        target: &str,
        runtime: Option<&str>,
        disturl: Option<&str>,
    ) -> Result<Self, GenerateError> {
        let runtime = runtime.unwrap_or("node");
        let disturl = match (disturl, runtime) {
            (Some(url), _) => url.trim_end_matches('/').to_string(),
            (None, "node") => "http://nodejs.org/dist".to_string(),
            (None, "electron") => "https://www.electronjs.org/headers".to_string(),
            (None, other) => {
                return Err(GenerateError::context(
                    "node headers",
                    format!("cannot guess disturl for {other} version {target}"),
                ));
            }
        };

        Ok(Self {
            target: target.trim_start_matches('v').to_string(),
            runtime: runtime.to_string(),
            disturl,
        })
    }

    /// Download URL of the headers tarball.
    pub fn url(&self) -> String {
        format!(
            "{}/v{}/node-v{}-headers.tar.gz",
            self.disturl, self.target, self.target
        )
    }
}
