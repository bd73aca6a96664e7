use std::path::Path;

use serde::Deserialize;

use crate::cli::Cli;
use crate::error::{Error, Result};

const DEFAULT_CONFIG_FILE: &str = ".auto-claude/config.toml";

/// On-disk configuration; every field optional, CLI flags win.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub agent_binary: Option<String>,
    pub model: Option<String>,
    pub summarizer_model: Option<String>,
    pub thinking: Option<String>,
    pub agent_timeout: Option<u64>,
    pub base_branch: Option<String>,
    pub max_iterations: Option<u32>,
    pub review_concurrency: Option<usize>,
    pub grace_minutes: Option<i64>,
    pub cooling_off_minutes: Option<i64>,
    pub review_own_prs: Option<bool>,
    pub authorized_users: Option<Vec<String>>,
    pub expected_bots: Option<Vec<String>>,
    pub trigger_label: Option<String>,
    pub prompt_override_dir: Option<String>,
    pub analyzer_binary: Option<String>,
    pub embedding_backend: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub agent_binary: String,
    pub model: Option<String>,
    pub summarizer_model: String,
    pub thinking: Option<String>,
    pub agent_timeout_secs: u64,
    pub base_branch: Option<String>,
    pub max_iterations: u32,
    pub review_concurrency: usize,
    pub grace_minutes: i64,
    pub cooling_off_minutes: i64,
    pub review_own_prs: bool,
    pub authorized_users: Vec<String>,
    pub expected_bots: Vec<String>,
    pub trigger_label: String,
    pub prompt_override_dir: Option<String>,
    pub analyzer_binary: Option<String>,
    pub embedding_backend: String,
    pub verbose: bool,
    pub force: bool,
    pub isolated: bool,
}

impl Config {
    pub fn load(cli: &Cli, project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(DEFAULT_CONFIG_FILE);
        let file = if path.exists() {
            parse_config(&std::fs::read_to_string(&path)?)?
        } else {
            ConfigFile::default()
        };
        merge(file, cli)
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    Ok(config)
}

/// Merge file config, CLI flags and environment. Precedence: CLI > env >
/// file > built-in default.
pub fn merge(file: ConfigFile, cli: &Cli) -> Result<Config> {
    let env_model = std::env::var("AUTO_CLAUDE_MODEL").ok().filter(|s| !s.is_empty());
    let env_base = std::env::var("DEFAULT_BRANCH").ok().filter(|s| !s.is_empty());
    let env_bots = std::env::var("GITHUB_EXPECTED_BOTS")
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty());

    let config = Config {
        agent_binary: file.agent_binary.unwrap_or_else(|| "claude".to_string()),
        model: cli.model.clone().or(env_model).or(file.model),
        summarizer_model: file
            .summarizer_model
            .unwrap_or_else(|| "haiku".to_string()),
        thinking: cli.thinking.clone().or(file.thinking),
        agent_timeout_secs: file.agent_timeout.unwrap_or(600),
        base_branch: cli.base_branch.clone().or(env_base).or(file.base_branch),
        max_iterations: cli
            .max_iterations
            .or(file.max_iterations)
            .unwrap_or(crate::review_state::MAX_ITERATIONS),
        review_concurrency: file.review_concurrency.unwrap_or(3),
        grace_minutes: file
            .grace_minutes
            .unwrap_or(crate::override_mgr::DEFAULT_GRACE_PERIOD_MINUTES),
        cooling_off_minutes: file
            .cooling_off_minutes
            .unwrap_or(crate::bot_detection::DEFAULT_COOLING_OFF_MINUTES),
        review_own_prs: file.review_own_prs.unwrap_or(false),
        authorized_users: file.authorized_users.unwrap_or_default(),
        expected_bots: env_bots.or(file.expected_bots).unwrap_or_default(),
        trigger_label: file.trigger_label.unwrap_or_else(|| "auto-fix".to_string()),
        prompt_override_dir: file.prompt_override_dir,
        analyzer_binary: file.analyzer_binary,
        embedding_backend: file
            .embedding_backend
            .unwrap_or_else(|| "local".to_string()),
        verbose: cli.verbose,
        force: cli.force,
        isolated: cli.isolated || !cli.direct,
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.embedding_backend.as_str() {
        "openai" | "voyage" | "local" => {}
        other => {
            return Err(Error::ConfigValidation(format!(
                "unknown embedding_backend: {other} (expected: openai, voyage, local)"
            )));
        }
    }
    if config.review_concurrency == 0 {
        return Err(Error::ConfigValidation(
            "review_concurrency must be > 0".to_string(),
        ));
    }
    if config.max_iterations == 0 {
        return Err(Error::ConfigValidation(
            "max_iterations must be > 0".to_string(),
        ));
    }
    if config.grace_minutes < 0 {
        return Err(Error::ConfigValidation(
            "grace_minutes must not be negative".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clean_env() {
        unsafe {
            std::env::remove_var("AUTO_CLAUDE_MODEL");
            std::env::remove_var("DEFAULT_BRANCH");
            std::env::remove_var("GITHUB_EXPECTED_BOTS");
        }
    }

    #[test]
    fn test_parse_valid_config() {
        let toml = r#"
model = "opus"
summarizer_model = "haiku"
review_concurrency = 2
expected_bots = ["coderabbitai[bot]"]
"#;
        let file = parse_config(toml).unwrap();
        assert_eq!(file.model.as_deref(), Some("opus"));
        assert_eq!(file.review_concurrency, Some(2));
    }

    #[test]
    fn test_parse_unknown_field_rejected() {
        let err = parse_config(r#"bogus = 1"#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    #[serial]
    fn test_defaults_applied() {
        clean_env();
        let cli = Cli::parse_from(["auto-claude", "--list"]);
        let config = merge(ConfigFile::default(), &cli).unwrap();
        assert_eq!(config.agent_binary, "claude");
        assert_eq!(config.summarizer_model, "haiku");
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.review_concurrency, 3);
        assert_eq!(config.grace_minutes, 15);
        assert_eq!(config.cooling_off_minutes, 1);
        assert!(!config.review_own_prs);
        assert_eq!(config.trigger_label, "auto-fix");
        assert_eq!(config.embedding_backend, "local");
        assert!(config.isolated);
    }

    #[test]
    #[serial]
    fn test_cli_overrides_file() {
        clean_env();
        let file = ConfigFile {
            model: Some("file-model".to_string()),
            max_iterations: Some(2),
            ..Default::default()
        };
        let cli = Cli::parse_from([
            "auto-claude",
            "--list",
            "--model",
            "cli-model",
            "--max-iterations",
            "4",
        ]);
        let config = merge(file, &cli).unwrap();
        assert_eq!(config.model.as_deref(), Some("cli-model"));
        assert_eq!(config.max_iterations, 4);
    }

    #[test]
    #[serial]
    fn test_env_between_cli_and_file() {
        clean_env();
        unsafe {
            std::env::set_var("AUTO_CLAUDE_MODEL", "env-model");
            std::env::set_var("GITHUB_EXPECTED_BOTS", "a[bot],b[bot]");
        }
        let file = ConfigFile {
            model: Some("file-model".to_string()),
            expected_bots: Some(vec!["file[bot]".to_string()]),
            ..Default::default()
        };
        let cli = Cli::parse_from(["auto-claude", "--list"]);
        let config = merge(file, &cli).unwrap();
        assert_eq!(config.model.as_deref(), Some("env-model"));
        assert_eq!(config.expected_bots, vec!["a[bot]", "b[bot]"]);
        clean_env();
    }

    #[test]
    #[serial]
    fn test_invalid_embedding_backend_rejected() {
        clean_env();
        let file = ConfigFile {
            embedding_backend: Some("word2vec".to_string()),
            ..Default::default()
        };
        let cli = Cli::parse_from(["auto-claude", "--list"]);
        let err = merge(file, &cli).unwrap_err();
        assert!(err.to_string().contains("unknown embedding_backend"));
    }

    #[test]
    #[serial]
    fn test_zero_concurrency_rejected() {
        clean_env();
        let file = ConfigFile {
            review_concurrency: Some(0),
            ..Default::default()
        };
        let cli = Cli::parse_from(["auto-claude", "--list"]);
        assert!(merge(file, &cli).is_err());
    }

    #[test]
    #[serial]
    fn test_load_from_project_dir() {
        clean_env();
        let dir = TempDir::new().unwrap();
        let cfg_dir = dir.path().join(".auto-claude");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(cfg_dir.join("config.toml"), r#"trigger_label = "fixme""#).unwrap();

        let cli = Cli::parse_from(["auto-claude", "--list"]);
        let config = Config::load(&cli, dir.path()).unwrap();
        assert_eq!(config.trigger_label, "fixme");
    }

    #[test]
    #[serial]
    fn test_load_missing_file_uses_defaults() {
        clean_env();
        let dir = TempDir::new().unwrap();
        let cli = Cli::parse_from(["auto-claude", "--list"]);
        let config = Config::load(&cli, dir.path()).unwrap();
        assert_eq!(config.agent_binary, "claude");
    }

    #[test]
    #[serial]
    fn test_direct_flag_disables_isolation() {
        clean_env();
        let cli = Cli::parse_from(["auto-claude", "task", "--direct"]);
        let config = merge(ConfigFile::default(), &cli).unwrap();
        assert!(!config.isolated);
    }
}
