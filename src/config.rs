use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub child: ChildConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Present only when the child depends on an external service
    #[serde(default)]
    pub readiness: Option<ReadinessConfig>,
    #[serde(default)]
    pub presentation: PresentationConfig,
}

/// How to start one child process
#[derive(Debug, Deserialize, Clone)]
pub struct ChildConfig {
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment. Values support ${ENV_VAR} substitution
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SupervisorConfig {
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
    /// Grace period after the transport-level load signal before the
    /// sandbox is assumed ready. 0 disables the fallback
    #[serde(default = "default_ready_grace_ms")]
    pub ready_grace_ms: u64,
    /// Fatal conditions tolerated before the sandbox becomes terminal
    #[serde(default = "default_crash_cap")]
    pub crash_cap: u32,
    /// A child that stayed ready this long gets a clean crash record.
    /// 0 keeps the record for the supervisor's whole lifetime
    #[serde(default)]
    pub stable_after_ms: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
    /// Persist every distinct content change immediately
    #[serde(default = "default_autosave")]
    pub autosave: bool,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ReadinessConfig {
    pub url: String,
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_readiness_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// JSON pointers into the status body; all must be `true`
    #[serde(default = "default_readiness_flags")]
    pub flags: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PresentationConfig {
    /// Names of the variables forwarded to the child
    #[serde(default = "default_presentation_variables")]
    pub variables: Vec<String>,
    /// Initial values
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

fn default_load_timeout_ms() -> u64 {
    10_000
}

fn default_ready_grace_ms() -> u64 {
    200
}

fn default_crash_cap() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_autosave() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_readiness_timeout_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    2_000
}

fn default_readiness_flags() -> Vec<String> {
    vec!["/ready".to_string()]
}

fn default_presentation_variables() -> Vec<String> {
    [
        "color-scheme",
        "--background",
        "--foreground",
        "--primary",
        "--primary-foreground",
        "--muted",
        "--muted-foreground",
        "--border",
        "--radius",
        "--font-sans",
        "--font-mono",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: default_load_timeout_ms(),
            ready_grace_ms: default_ready_grace_ms(),
            crash_cap: default_crash_cap(),
            stable_after_ms: 0,
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            autosave: default_autosave(),
            read_only: false,
        }
    }
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            variables: default_presentation_variables(),
            values: BTreeMap::new(),
        }
    }
}

impl SupervisorConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn ready_grace(&self) -> Option<Duration> {
        (self.ready_grace_ms > 0).then(|| Duration::from_millis(self.ready_grace_ms))
    }

    pub fn stable_after(&self) -> Option<Duration> {
        (self.stable_after_ms > 0).then(|| Duration::from_millis(self.stable_after_ms))
    }
}

impl ReadinessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {path}"))?;
        // Expand environment variables like ${RENDERER_TOKEN}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the supervisor cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.child.command.as_os_str().is_empty() {
            bail!("child.command must not be empty");
        }
        if self.supervisor.load_timeout_ms == 0 {
            bail!("supervisor.load_timeout_ms must be greater than zero");
        }
        if self.supervisor.backoff_multiplier == 0 {
            bail!("supervisor.backoff_multiplier must be at least 1");
        }
        if let Some(ref readiness) = self.readiness {
            url::Url::parse(&readiness.url)
                .with_context(|| format!("readiness.url '{}' is not a valid URL", readiness.url))?;
            if readiness.interval_ms == 0 {
                bail!("readiness.interval_ms must be greater than zero");
            }
            if readiness.flags.is_empty() {
                bail!("readiness.flags must name at least one flag");
            }
            if let Some(bad) = readiness.flags.iter().find(|f| !f.starts_with('/')) {
                bail!("readiness flag '{bad}' is not a JSON pointer (must start with '/')");
            }
        }
        Ok(())
    }

    /// Human-readable summary for the startup log
    pub fn describe(&self) -> String {
        let gate = match &self.readiness {
            Some(r) => format!("gated on {}", r.url),
            None => "no dependency gate".to_string(),
        };
        format!(
            "{} ({gate}, crash cap {})",
            self.child.command.display(),
            self.supervisor.crash_cap
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(toml_text: &str) -> Config {
        toml::from_str(toml_text).unwrap()
    }

    // ── defaults ────────────────────────────────────────

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse(
            r#"
            [child]
            command = "/usr/local/bin/renderer"
            "#,
        );
        assert_eq!(config.supervisor, SupervisorConfig::default());
        assert_eq!(config.supervisor.load_timeout(), Duration::from_secs(10));
        assert_eq!(config.supervisor.ready_grace(), Some(Duration::from_millis(200)));
        assert_eq!(config.supervisor.crash_cap, 3);
        assert!(config.supervisor.autosave);
        assert!(config.readiness.is_none());
        assert!(config.presentation.variables.contains(&"--background".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_readiness_defaults() {
        let config = parse(
            r#"
            [child]
            command = "renderer"

            [readiness]
            url = "http://localhost:55001/status"
            "#,
        );
        let readiness = config.readiness.unwrap();
        assert_eq!(readiness.interval(), Duration::from_millis(500));
        assert_eq!(readiness.timeout(), Duration::from_secs(30));
        assert_eq!(readiness.flags, vec!["/ready".to_string()]);
    }

    #[test]
    fn test_stability_reset_is_opt_in() {
        let config = parse(
            r#"
            [child]
            command = "renderer"
            "#,
        );
        assert_eq!(config.supervisor.stable_after(), None);

        let config = parse(
            r#"
            [child]
            command = "renderer"

            [supervisor]
            stable_after_ms = 60000
            "#,
        );
        assert_eq!(config.supervisor.stable_after(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_zero_grace_disables_fallback() {
        let config = parse(
            r#"
            [child]
            command = "renderer"

            [supervisor]
            ready_grace_ms = 0
            "#,
        );
        assert_eq!(config.supervisor.ready_grace(), None);
    }

    // ── validation ──────────────────────────────────────

    #[test]
    fn test_invalid_readiness_url_rejected() {
        let config = parse(
            r#"
            [child]
            command = "renderer"

            [readiness]
            url = "not a url"
            "#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flag_must_be_json_pointer() {
        let config = parse(
            r#"
            [child]
            command = "renderer"

            [readiness]
            url = "http://localhost:55001/status"
            flags = ["ready"]
            "#,
        );
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("JSON pointer"), "{err}");
    }

    #[test]
    fn test_zero_load_timeout_rejected() {
        let config = parse(
            r#"
            [child]
            command = "renderer"

            [supervisor]
            load_timeout_ms = 0
            "#,
        );
        assert!(config.validate().is_err());
    }

    // ── load ────────────────────────────────────────────

    #[test]
    fn test_load_expands_env_vars() {
        std::env::set_var("SANDBOX_HOST_TEST_TOKEN", "s3cret");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r##"
            [child]
            command = "renderer"
            env = {{ RENDERER_TOKEN = "${{SANDBOX_HOST_TEST_TOKEN}}" }}

            [presentation]
            variables = ["--background"]
            values = {{ "--background" = "#000" }}
            "##
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.child.env.get("RENDERER_TOKEN").unwrap(), "s3cret");
        assert_eq!(config.presentation.values.get("--background").unwrap(), "#000");
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(Config::load("/nonexistent/sandbox-host.toml").is_err());
    }

    #[test]
    fn test_describe() {
        let config = parse(
            r#"
            [child]
            command = "renderer"
            "#,
        );
        assert_eq!(config.describe(), "renderer (no dependency gate, crash cap 3)");
    }
}
