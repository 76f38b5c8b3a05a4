//! Configuration management for boardfs.
//!
//! The build configuration (board, distribution, variant, users, options)
//! is read from a JSON file. Environment variables, optionally loaded from a
//! `.env` file by the binary, override a handful of options.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Read-only, already validated source of everything a stage may depend on.
pub trait ConfigProvider {
    fn board(&self) -> &Board;
    fn distribution(&self) -> &Distribution;
    fn variant(&self) -> &Variant;
    fn users(&self) -> &[User];
    fn options(&self) -> &BuildOptions;

    /// Hostname the image will boot with.
    fn hostname(&self) -> &str {
        self.options()
            .hostname
            .as_deref()
            .unwrap_or(&self.board().name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Board {
    /// Board name, also the default hostname (e.g. "a64-olinuxino").
    pub name: String,
    /// Debian architecture (e.g. "arm64", "armhf").
    pub arch: String,
    /// Serial console the login prompt is attached to.
    #[serde(default = "default_console")]
    pub console: String,
}

fn default_console() -> String {
    "ttyS0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Distribution {
    /// Distribution family, informational (e.g. "debian").
    pub name: String,
    /// Release codename passed to debootstrap (e.g. "buster").
    pub release: String,
    /// Mirror URL.
    pub repository: String,
    #[serde(default = "default_components")]
    pub components: Vec<String>,
}

fn default_components() -> Vec<String> {
    vec!["main".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Variant {
    #[serde(default = "default_variant")]
    pub name: String,
    #[serde(default)]
    pub packages: Vec<String>,
}

fn default_variant() -> String {
    "lite".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuildOptions {
    /// Route APT through an apt-cacher-ng proxy while building.
    pub apt_cacher: bool,
    pub apt_cacher_host: String,
    pub apt_cacher_port: u16,
    pub locale: String,
    pub keyboard_keymap: String,
    pub keyboard_layout: String,
    /// Overrides the board name as hostname.
    pub hostname: Option<String>,
    pub timezone: String,
    pub ssh: bool,
    pub kernel_package: String,
    /// Directory copied over the configured rootfs.
    pub overlay: Option<PathBuf>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            apt_cacher: false,
            apt_cacher_host: "127.0.0.1".to_string(),
            apt_cacher_port: 3142,
            locale: "en_US.UTF-8".to_string(),
            keyboard_keymap: "pc105".to_string(),
            keyboard_layout: "us".to_string(),
            hostname: None,
            timezone: "UTC".to_string(),
            ssh: true,
            kernel_package: "linux-image-5.5.2-olimex".to_string(),
            overlay: None,
        }
    }
}

/// Codeset of a `<language>.<codeset>[@modifier]` locale name.
///
/// `en_US.UTF-8` gives `UTF-8`, `ca_ES.UTF-8@valencia` gives `UTF-8`. A
/// name without a codeset gives None.
pub fn locale_codeset(locale: &str) -> Option<&str> {
    if locale.contains(char::is_whitespace) {
        return None;
    }
    let (lang, rest) = locale.split_once('.')?;
    let codeset = rest.split_once('@').map_or(rest, |(codeset, _)| codeset);
    if lang.is_empty() || codeset.is_empty() {
        return None;
    }
    Some(codeset)
}

/// Complete build configuration loaded from disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildConfig {
    pub board: Board,
    pub distribution: Distribution,
    #[serde(default = "Variant::lite")]
    pub variant: Variant,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub options: BuildOptions,
}

impl Variant {
    fn lite() -> Self {
        Self {
            name: default_variant(),
            packages: Vec::new(),
        }
    }
}

impl BuildConfig {
    /// Load configuration from a JSON file and the environment.
    ///
    /// Environment variables take precedence over the file. A relative
    /// overlay path is resolved against the config file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.resolve_paths(path);
        config.validate()?;
        Ok(config)
    }

    /// Resolve a relative overlay path against the config file's directory.
    pub fn resolve_paths(&mut self, config_path: &Path) {
        if let Some(overlay) = &self.options.overlay {
            if overlay.is_relative() {
                let base = config_path.parent().unwrap_or(Path::new("."));
                self.options.overlay = Some(base.join(overlay));
            }
        }
    }

    /// Apply `BOARDFS_*` overrides from a variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(release) = lookup("BOARDFS_RELEASE") {
            self.distribution.release = release;
        }
        if let Some(hostname) = lookup("BOARDFS_HOSTNAME") {
            self.options.hostname = Some(hostname);
        }
        if let Some(timezone) = lookup("BOARDFS_TIMEZONE") {
            self.options.timezone = timezone;
        }
        if let Some(locale) = lookup("BOARDFS_LOCALE") {
            self.options.locale = locale;
        }
        // BOARDFS_APT_CACHER=host[:port] turns the proxy on
        if let Some(cacher) = lookup("BOARDFS_APT_CACHER") {
            let cacher = cacher.trim();
            if cacher.is_empty() || cacher == "0" || cacher == "off" {
                self.options.apt_cacher = false;
            } else {
                self.options.apt_cacher = true;
                match cacher.split_once(':') {
                    Some((host, port)) => {
                        self.options.apt_cacher_host = host.to_string();
                        self.options.apt_cacher_port = port.parse().with_context(|| {
                            format!("Invalid BOARDFS_APT_CACHER port '{}'", port)
                        })?;
                    }
                    None => self.options.apt_cacher_host = cacher.to_string(),
                }
            }
        }
        Ok(())
    }

    /// Reject configurations that would only fail deep inside a stage.
    pub fn validate(&self) -> Result<()> {
        if self.board.name.trim().is_empty() {
            bail!("board.name must not be empty");
        }
        if self.board.arch.trim().is_empty() {
            bail!("board.arch must not be empty");
        }
        if self.distribution.release.trim().is_empty() {
            bail!("distribution.release must not be empty");
        }
        if self.distribution.repository.trim().is_empty() {
            bail!("distribution.repository must not be empty");
        }
        if self.distribution.components.is_empty() {
            bail!("distribution.components must list at least one component");
        }
        for package in self
            .variant
            .packages
            .iter()
            .chain(std::iter::once(&self.options.kernel_package))
        {
            if package.is_empty() || package.contains(char::is_whitespace) {
                bail!("Invalid package name '{}'", package);
            }
        }
        if locale_codeset(&self.options.locale).is_none() {
            bail!(
                "options.locale '{}' must name a codeset, e.g. en_US.UTF-8",
                self.options.locale
            );
        }
        for user in &self.users {
            if user.name.is_empty() || user.name.contains([':', ' ', '/']) {
                bail!("Invalid user name '{}'", user.name);
            }
            if user.password.contains(['\n', ':']) {
                bail!("Password for user '{}' contains ':' or a newline", user.name);
            }
        }
        Ok(())
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!(
            "  Board:        {} ({}, console {})",
            self.board.name, self.board.arch, self.board.console
        );
        println!(
            "  Distribution: {} {} [{}]",
            self.distribution.name,
            self.distribution.release,
            self.distribution.components.join(",")
        );
        println!("  Repository:   {}", self.distribution.repository);
        println!(
            "  Variant:      {} ({} packages)",
            self.variant.name,
            self.variant.packages.len()
        );
        println!("  Hostname:     {}", self.hostname());
        println!("  Locale:       {}", self.options.locale);
        println!("  Timezone:     {}", self.options.timezone);
        println!(
            "  Keyboard:     {} / {}",
            self.options.keyboard_layout, self.options.keyboard_keymap
        );
        println!("  SSH:          {}", if self.options.ssh { "enabled" } else { "disabled" });
        println!("  Kernel:       {}", self.options.kernel_package);
        if self.options.apt_cacher {
            println!(
                "  APT proxy:    {}:{}",
                self.options.apt_cacher_host, self.options.apt_cacher_port
            );
        }
        if let Some(overlay) = &self.options.overlay {
            println!("  Overlay:      {}", overlay.display());
        }
        for user in &self.users {
            println!("  User:         {} [{}]", user.name, user.groups.join(","));
        }
    }
}

impl ConfigProvider for BuildConfig {
    fn board(&self) -> &Board {
        &self.board
    }

    fn distribution(&self) -> &Distribution {
        &self.distribution
    }

    fn variant(&self) -> &Variant {
        &self.variant
    }

    fn users(&self) -> &[User] {
        &self.users
    }

    fn options(&self) -> &BuildOptions {
        &self.options
    }
}
