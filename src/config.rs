//! Pipeline configuration loaded from TOML.
//!
//! ```toml
//! image = "raspios-lite.img"
//! target_arch = "aarch64"
//! enabled_phases = ["base", "network"]
//! fingerprint = true
//!
//! [layout]
//! root = 2
//! boot = 1          # 0 = no boot partition
//!
//! [sandbox]
//! exec_timeout_secs = 1800
//! env = { DEBIAN_FRONTEND = "noninteractive" }
//!
//! [[steps]]
//! name = "update"
//! command = "apt-get update"
//! phase = "base"
//! ```

use crate::attach::{AttachSettings, PartitionLayout, DEFAULT_BOOT_MOUNT, DEFAULT_ENUMERATE_TIMEOUT};
use crate::platform::Arch;
use crate::retry::{RetryPolicy, DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS};
use crate::sandbox::{SandboxSettings, DEFAULT_EXEC_TIMEOUT, DEFAULT_INSTALL_TIMEOUT};
use crate::verify::VerifySettings;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// One provisioning command run inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionStep {
    pub name: String,
    pub command: String,
    /// A failing critical step aborts the run; others only warn.
    pub critical: bool,
    /// Steps without a phase always run.
    pub phase: Option<String>,
}

impl ProvisionStep {
    /// `enabled` of `None` enables every phase.
    pub fn is_enabled(&self, enabled: Option<&[String]>) -> bool {
        match (&self.phase, enabled) {
            (None, _) | (_, None) => true,
            (Some(phase), Some(enabled)) => enabled.iter().any(|p| p == phase),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub image: PathBuf,
    pub target_arch: Arch,
    pub work_dir: PathBuf,
    pub enabled_phases: Option<Vec<String>>,
    /// Record SHA-256 of the image before and after provisioning.
    pub fingerprint: bool,
    pub attach: AttachSettings,
    pub verify: VerifySettings,
    pub sandbox: SandboxSettings,
    pub steps: Vec<ProvisionStep>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    image: String,
    target_arch: Option<String>,
    work_dir: Option<String>,
    enabled_phases: Option<Vec<String>>,
    fingerprint: Option<bool>,
    layout: Option<LayoutToml>,
    verify: Option<VerifyToml>,
    retry: Option<RetryToml>,
    attach: Option<AttachToml>,
    sandbox: Option<SandboxToml>,
    #[serde(default)]
    steps: Vec<StepToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LayoutToml {
    root: Option<u32>,
    boot: Option<u32>,
    boot_mount: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VerifyToml {
    min_image_mib: Option<u64>,
    max_image_gib: Option<u64>,
    required_paths: Option<Vec<String>>,
    optional_paths: Option<Vec<String>>,
    require_boot_contents: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetryToml {
    max_attempts: Option<u32>,
    backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AttachToml {
    enumerate_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SandboxToml {
    exec_timeout_secs: Option<u64>,
    install_timeout_secs: Option<u64>,
    emulator: Option<String>,
    dns_source: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepToml {
    name: String,
    command: String,
    critical: Option<bool>,
    phase: Option<String>,
}

/// `$XDG_CONFIG_HOME/disk-provisioner/config.toml` (or the platform equivalent).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("disk-provisioner").join("config.toml"))
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("disk-provisioner")
}

fn resolve(base_dir: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw.trim());
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

impl Config {
    /// Read and validate a config file. Relative paths resolve against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&text, base_dir)
            .with_context(|| format!("invalid config '{}'", path.display()))
    }

    /// Defaults for operating on a single image without a config file.
    pub fn for_image(image: &Path) -> Self {
        let work_dir = default_work_dir();
        Self {
            image: image.to_path_buf(),
            target_arch: Arch::host(),
            attach: AttachSettings {
                work_dir: work_dir.clone(),
                ..AttachSettings::default()
            },
            work_dir,
            enabled_phases: None,
            fingerprint: false,
            verify: VerifySettings::default(),
            sandbox: SandboxSettings::default(),
            steps: Vec::new(),
        }
    }

    pub fn from_toml_str(text: &str, base_dir: &Path) -> Result<Self> {
        let parsed: ConfigToml = toml::from_str(text).context("parsing TOML")?;

        if parsed.image.trim().is_empty() {
            bail!("image must not be empty");
        }
        let image = resolve(base_dir, &parsed.image);

        let target_arch = match parsed.target_arch.as_deref() {
            Some(raw) => raw.parse::<Arch>().map_err(anyhow::Error::msg)?,
            None => Arch::host(),
        };

        let work_dir = parsed
            .work_dir
            .as_deref()
            .map(|w| resolve(base_dir, w))
            .unwrap_or_else(default_work_dir);

        let layout_toml = parsed.layout.unwrap_or(LayoutToml {
            root: None,
            boot: None,
            boot_mount: None,
        });
        let defaults = PartitionLayout::default();
        let layout = PartitionLayout {
            root: layout_toml.root.unwrap_or(defaults.root),
            boot: match layout_toml.boot {
                Some(0) => None,
                Some(n) => Some(n),
                None => defaults.boot,
            },
        };
        if layout.root == 0 {
            bail!("layout.root must be a 1-based partition number");
        }
        let boot_mount = layout_toml
            .boot_mount
            .unwrap_or_else(|| DEFAULT_BOOT_MOUNT.to_string());
        if Path::new(&boot_mount).is_absolute() || boot_mount.contains("..") {
            bail!(
                "layout.boot_mount must be relative to the root filesystem, got '{}'",
                boot_mount
            );
        }

        let retry = match parsed.retry {
            Some(r) => {
                let attempts = r.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
                if attempts == 0 {
                    bail!("retry.max_attempts must be at least 1");
                }
                RetryPolicy::new(
                    attempts,
                    r.backoff_ms
                        .map(Duration::from_millis)
                        .unwrap_or(DEFAULT_BACKOFF),
                )
            }
            None => RetryPolicy::default(),
        };

        let enumerate_timeout = parsed
            .attach
            .and_then(|a| a.enumerate_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_ENUMERATE_TIMEOUT);

        let verify = match parsed.verify {
            Some(v) => {
                let defaults = VerifySettings::default();
                let min_image_bytes = match v.min_image_mib {
                    Some(m) => m
                        .checked_mul(MIB)
                        .with_context(|| format!("verify.min_image_mib too large: {}", m))?,
                    None => defaults.min_image_bytes,
                };
                let max_image_bytes = match v.max_image_gib {
                    Some(g) => g
                        .checked_mul(GIB)
                        .with_context(|| format!("verify.max_image_gib too large: {}", g))?,
                    None => defaults.max_image_bytes,
                };
                let settings = VerifySettings {
                    min_image_bytes,
                    max_image_bytes,
                    required_paths: v.required_paths.unwrap_or(defaults.required_paths),
                    optional_paths: v.optional_paths.unwrap_or(defaults.optional_paths),
                    require_boot_contents: v
                        .require_boot_contents
                        .unwrap_or(defaults.require_boot_contents),
                };
                if settings.min_image_bytes > settings.max_image_bytes {
                    bail!("verify.min_image_mib exceeds verify.max_image_gib");
                }
                settings
            }
            None => VerifySettings::default(),
        };

        let sandbox = match parsed.sandbox {
            Some(s) => {
                let defaults = SandboxSettings::default();
                SandboxSettings {
                    exec_timeout: s
                        .exec_timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or(DEFAULT_EXEC_TIMEOUT),
                    install_timeout: s
                        .install_timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or(DEFAULT_INSTALL_TIMEOUT),
                    emulator: s.emulator.as_deref().map(|e| resolve(base_dir, e)),
                    dns_source: s
                        .dns_source
                        .as_deref()
                        .map(|d| resolve(base_dir, d))
                        .unwrap_or(defaults.dns_source),
                    env: s.env.into_iter().collect(),
                }
            }
            None => SandboxSettings::default(),
        };

        let steps = parse_steps(parsed.steps)?;

        Ok(Self {
            image,
            target_arch,
            attach: AttachSettings {
                layout,
                retry,
                enumerate_timeout,
                boot_mount: PathBuf::from(boot_mount),
                work_dir: work_dir.clone(),
                read_only: false,
            },
            work_dir,
            enabled_phases: parsed.enabled_phases,
            fingerprint: parsed.fingerprint.unwrap_or(false),
            verify,
            sandbox,
            steps,
        })
    }

    /// Steps whose phase is enabled, in declaration order.
    pub fn active_steps(&self) -> impl Iterator<Item = &ProvisionStep> {
        let enabled = self.enabled_phases.as_deref();
        self.steps.iter().filter(move |s| s.is_enabled(enabled))
    }

    /// Steps whose phase is not enabled.
    pub fn skipped_steps(&self) -> impl Iterator<Item = &ProvisionStep> {
        let enabled = self.enabled_phases.as_deref();
        self.steps.iter().filter(move |s| !s.is_enabled(enabled))
    }
}

fn parse_steps(raw: Vec<StepToml>) -> Result<Vec<ProvisionStep>> {
    let mut seen = HashSet::new();
    let mut steps = Vec::with_capacity(raw.len());
    for step in raw {
        let name = step.name.trim().to_string();
        if name.is_empty() {
            bail!("steps: name must not be empty");
        }
        if !seen.insert(name.clone()) {
            bail!("steps: duplicate step name '{}'", name);
        }
        if step.command.trim().is_empty() {
            bail!("steps: step '{}' has an empty command", name);
        }
        steps.push(ProvisionStep {
            name,
            command: step.command,
            critical: step.critical.unwrap_or(true),
            phase: step
                .phase
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
        });
    }
    Ok(steps)
}
