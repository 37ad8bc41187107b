//! Base and extension image builds with content-addressed tags.
//!
//! ```text
//! addt-base:v<addt>-node<N>-go<G>-uv<U>-uid<UID>-<base8>
//! addt-<exts>:v<addt>-node<N>-go<G>-uv<U>-uid<UID>-<ext8>-<base8>
//! ```
//!
//! `<base8>` hashes the embedded base assets; `<ext8>` hashes the extension
//! tree (local overrides included) together with the pinned extension
//! versions. Identical inputs give identical tags, and an existing tag is
//! never rebuilt unless asked.

use super::runtime::Runtime;
use crate::error::{Result, SandboxError};
use crate::process;
use crate::provider::BuildOptions;
use addt_core::id::sha256_hex;
use addt_core::{assets, EffectiveConfig, ExtensionRegistry, ADDT_VERSION};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Image label listing the env vars the installed extensions consume.
pub const ENV_VARS_LABEL: &str = "addt.env_vars";

/// Prefix of the per-tool version labels.
pub const VERSION_LABEL_PREFIX: &str = "addt.version.";

/// Identity of the host user baked into the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostUser {
    pub uid: u32,
    pub gid: u32,
}

impl HostUser {
    pub fn current() -> Self {
        #[cfg(unix)]
        {
            Self {
                uid: nix::unistd::getuid().as_raw(),
                gid: nix::unistd::getgid().as_raw(),
            }
        }
        #[cfg(not(unix))]
        {
            Self { uid: 1000, gid: 1000 }
        }
    }
}

/// Resolved inputs of one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub base_tag: String,
    pub image_tag: String,
    /// Extensions in install order, dependencies first.
    pub install_order: Vec<String>,
    /// `name=version` pairs for `ADDT_EXTENSION_VERSIONS`.
    pub versions: Vec<String>,
    pub env_vars: Vec<String>,
    pub user: HostUser,
}

/// Keep tag components within `[A-Za-z0-9_.-]`.
fn tag_part(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}

fn toolchain_part(config: &EffectiveConfig, user: HostUser) -> String {
    format!(
        "v{}-node{}-go{}-uv{}-uid{}",
        tag_part(ADDT_VERSION),
        tag_part(&config.node_version),
        tag_part(&config.go_version),
        tag_part(&config.uv_version),
        user.uid
    )
}

impl BuildPlan {
    /// Work out tags and build arguments for the active extensions.
    pub fn new(
        config: &EffectiveConfig,
        registry: &ExtensionRegistry,
        user: HostUser,
    ) -> Result<Self> {
        if config.extensions.is_empty() {
            return Err(SandboxError::config("no extension selected"));
        }
        registry.validate_names(&config.extensions)?;
        let install_order = registry.resolve_order(&config.extensions)?;

        let versions: Vec<String> = install_order
            .iter()
            .map(|name| {
                let pinned = config.extension(name).version;
                let version = pinned
                    .or_else(|| registry.get(name).map(|e| e.default_version.clone()))
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| "latest".to_string());
                format!("{}={}", name, version)
            })
            .collect();

        let ext_assets = assets::ext_assets_hash(registry.local_dir())?;
        let ext_hash = sha256_hex(format!("{}|{}", ext_assets, versions.join(",")).as_bytes());
        let base_hash = assets::base_assets_hash();
        let toolchain = toolchain_part(config, user);

        Ok(Self {
            base_tag: format!("addt-base:{}-{}", toolchain, &base_hash[..8]),
            image_tag: format!(
                "addt-{}:{}-{}-{}",
                config.extensions.join("-"),
                toolchain,
                &ext_hash[..8],
                &base_hash[..8]
            ),
            env_vars: registry.env_var_names(&install_order),
            install_order,
            versions,
            user,
        })
    }

    fn base_args(&self, config: &EffectiveConfig, context: &Path, options: BuildOptions) -> Vec<String> {
        let mut args = vec!["build".to_string()];
        if options.no_cache {
            args.push("--no-cache".to_string());
        }
        for (name, value) in [
            ("NODE_VERSION", config.node_version.clone()),
            ("GO_VERSION", config.go_version.clone()),
            ("UV_VERSION", config.uv_version.clone()),
            ("USER_ID", self.user.uid.to_string()),
            ("GROUP_ID", self.user.gid.to_string()),
        ] {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", name, value));
        }
        args.extend([
            "-f".to_string(),
            context.join("Dockerfile.base").to_string_lossy().into_owned(),
            "-t".to_string(),
            self.base_tag.clone(),
            context.to_string_lossy().into_owned(),
        ]);
        args
    }

    fn extension_args(&self, context: &Path, options: BuildOptions) -> Vec<String> {
        let mut args = vec!["build".to_string()];
        if options.no_cache {
            args.push("--no-cache".to_string());
        }
        for (name, value) in [
            ("BASE_IMAGE", self.base_tag.clone()),
            ("ADDT_EXTENSIONS", self.install_order.join(",")),
            ("ADDT_EXTENSION_VERSIONS", self.versions.join(",")),
        ] {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", name, value));
        }
        args.extend([
            "--label".to_string(),
            format!("{}={}", ENV_VARS_LABEL, self.env_vars.join(",")),
            "-f".to_string(),
            context.join("Dockerfile").to_string_lossy().into_owned(),
            "-t".to_string(),
            self.image_tag.clone(),
            context.to_string_lossy().into_owned(),
        ]);
        args
    }

    /// Tools whose versions are recorded after a build.
    fn probed_tools(&self, registry: &ExtensionRegistry) -> Vec<String> {
        let mut tools = Vec::new();
        for name in &self.install_order {
            let command = registry
                .get(name)
                .and_then(|ext| ext.command().split_whitespace().next())
                .filter(|c| c.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-')))
                .map(str::to_string);
            if let Some(command) = command {
                if !tools.contains(&command) {
                    tools.push(command);
                }
            }
        }
        for tool in ["node", "go", "uv"] {
            if !tools.iter().any(|t| t == tool) {
                tools.push(tool.to_string());
            }
        }
        tools
    }
}

/// Shell snippet printing `tool=version` for each tool that is installed.
fn probe_script(tools: &[String]) -> String {
    tools
        .iter()
        .map(|tool| {
            let flag = if tool == "go" { "version" } else { "--version" };
            format!(
                "command -v {t} >/dev/null 2>&1 && printf '%s=%s\\n' {t} \"$({t} {f} 2>/dev/null | head -n1)\"",
                t = tool,
                f = flag
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parse `tool=version` lines.
fn parse_probe(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(tool, version)| (tool.trim().to_string(), version.trim().to_string()))
        .filter(|(tool, version)| !tool.is_empty() && !version.is_empty())
        .collect()
}

/// Builds images through a runtime.
pub struct ImageBuilder<'a> {
    runtime: &'a Runtime,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(runtime: &'a Runtime) -> Self {
        Self { runtime }
    }

    /// Build whatever is missing and return the extension image tag.
    pub async fn build_if_needed(
        &self,
        config: &EffectiveConfig,
        registry: &ExtensionRegistry,
        options: BuildOptions,
    ) -> Result<String> {
        let plan = BuildPlan::new(config, registry, HostUser::current())?;
        let force = options.rebuild || options.rebuild_base || options.no_cache;
        if !force && self.runtime.image_exists(&plan.image_tag).await? {
            debug!("Image {} is up to date", plan.image_tag);
            return Ok(plan.image_tag);
        }

        let context = tempfile::Builder::new().prefix("addt-build-").tempdir()?;
        assets::write_build_context(context.path(), registry.local_dir())?;

        if options.rebuild_base || !self.runtime.image_exists(&plan.base_tag).await? {
            info!("Building base image {}", plan.base_tag);
            self.run_build(plan.base_args(config, context.path(), options), &plan.base_tag)
                .await?;
        }

        info!("Building image {}", plan.image_tag);
        self.run_build(plan.extension_args(context.path(), options), &plan.image_tag)
            .await?;

        if let Err(e) = self.record_versions(&plan, registry).await {
            warn!("Could not record tool versions for {}: {}", plan.image_tag, e);
        }
        Ok(plan.image_tag)
    }

    async fn run_build(&self, args: Vec<String>, tag: &str) -> Result<()> {
        let status = process::status(self.runtime.command_with(&args)).await?;
        if !status.success() {
            return Err(SandboxError::BuildFailed(format!(
                "{} exited with {}",
                tag,
                process::exit_code(status)
            )));
        }
        Ok(())
    }

    /// Probe tool versions and re-tag the image with `addt.version.*` labels.
    async fn record_versions(&self, plan: &BuildPlan, registry: &ExtensionRegistry) -> Result<()> {
        let output = self
            .runtime
            .probe(&plan.image_tag, &probe_script(&plan.probed_tools(registry)))
            .await?;
        let versions = parse_probe(&output);
        if versions.is_empty() {
            return Ok(());
        }

        let context = tempfile::Builder::new().prefix("addt-label-").tempdir()?;
        std::fs::write(
            context.path().join("Dockerfile"),
            format!("FROM {}\n", plan.image_tag),
        )?;

        let mut args = vec!["build".to_string(), "-q".to_string()];
        for (tool, version) in &versions {
            debug!("{} {}", tool, version);
            args.push("--label".to_string());
            args.push(format!("{}{}={}", VERSION_LABEL_PREFIX, tool, version));
        }
        args.extend([
            "-t".to_string(),
            plan.image_tag.clone(),
            context.path().to_string_lossy().into_owned(),
        ]);

        let output = process::capture(self.runtime.command_with(&args)).await?;
        if !output.status.success() {
            return Err(SandboxError::BuildFailed(format!(
                "labelling {}: {}",
                plan.image_tag,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
