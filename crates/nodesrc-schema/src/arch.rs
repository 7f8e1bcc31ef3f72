/// Target architectures a sandboxed build may run on.
///
/// Platform-specific sidecar binaries are tagged with one of these so the
/// build tool only materialises the ones matching the current build.
///
/// # Example
///
/// ```
/// use nodesrc_schema::Arch;
///
/// let arch: Arch = "arm64".parse().unwrap();
/// assert_eq!(arch.as_str(), "aarch64");
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// 64-bit Intel/AMD
    X86_64,
    /// 32-bit Intel
    I386,
    /// 32-bit ARM (armv7 hard float)
    Arm,
    /// 64-bit ARM
    Aarch64,
}

impl Arch {
    /// Every architecture, in the order sidecars are emitted.
    pub const ALL: [Arch; 4] = [Self::I386, Self::X86_64, Self::Arm, Self::Aarch64];

    /// Name used in the manifest's `only-arches` list.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::I386 => "i386",
            Self::Arm => "arm",
            Self::Aarch64 => "aarch64",
        }
    }

    /// Electron release naming (`x64`, `ia32`, `armv7l`, `arm64`).
    pub fn electron_name(&self) -> &'static str {
        match self {
            Self::X86_64 => "x64",
            Self::I386 => "ia32",
            Self::Arm => "armv7l",
            Self::Aarch64 => "arm64",
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "x86_64" | "x64" | "amd64" => Ok(Self::X86_64),
            "i386" | "ia32" | "x86" => Ok(Self::I386),
            "arm" | "armv7l" | "armhf" => Ok(Self::Arm),
            "aarch64" | "arm64" => Ok(Self::Aarch64),
            _ => Err(format!("Unknown architecture: {s}")),
        }
    }
}
