use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::AgentSpec;
use crate::hooks::HookSet;

pub(crate) const CONFIG_FILE_NAME: &str = "ralph.yaml";
pub(crate) const DEFAULT_CONFIG_YAML: &str = include_str!("../templates/ralph.yaml");

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub(crate) struct Config {
    pub(crate) agent: AgentConfig,
    #[serde(rename = "loop")]
    pub(crate) run: LoopConfig,
    pub(crate) paths: PathsConfig,
    pub(crate) hooks: HookSet,
    #[serde(rename = "logPath")]
    pub(crate) log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub(crate) struct AgentConfig {
    #[serde(rename = "type")]
    pub(crate) agent_type: String,
    pub(crate) command: String,
    #[serde(deserialize_with = "string_list")]
    pub(crate) flags: Vec<String>,
    /// `None` disables the per-invocation deadline.
    #[serde(deserialize_with = "deserialize_timeout")]
    pub(crate) timeout: Option<Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_type: "claude-code".to_string(),
            command: String::new(),
            flags: Vec::new(),
            timeout: Some(Duration::from_secs(30 * 60)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct LoopConfig {
    pub(crate) max_iterations: u32,
    #[serde(deserialize_with = "deserialize_duration")]
    pub(crate) sleep_between: Duration,
    pub(crate) stop_on_first_failure: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            sleep_between: Duration::from_secs(2),
            stop_on_first_failure: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub(crate) struct PathsConfig {
    pub(crate) prd: PathBuf,
    pub(crate) progress: PathBuf,
    pub(crate) prompt: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            prd: PathBuf::from(".ralph/prd.json"),
            progress: PathBuf::from(".ralph/progress.txt"),
            prompt: PathBuf::from(".ralph/prompt.md"),
        }
    }
}

impl PathsConfig {
    pub(crate) fn all(&self) -> [&Path; 3] {
        [&self.prd, &self.progress, &self.prompt]
    }
}

#[derive(Debug)]
pub(crate) struct LoadedConfig {
    pub(crate) config: Config,
    /// File the configuration came from; `None` when running on defaults.
    pub(crate) path: Option<PathBuf>,
    /// Non-fatal problems found while loading, reported by the caller.
    pub(crate) warnings: Vec<String>,
}

pub(crate) fn config_search_paths() -> [PathBuf; 2] {
    [
        PathBuf::from(CONFIG_FILE_NAME),
        Path::new(".ralph").join(CONFIG_FILE_NAME),
    ]
}

pub(crate) fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig, String> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(format!("Missing config file: {}", path.display()));
        }
        return load_config_file(path);
    }

    for candidate in config_search_paths() {
        if candidate.is_file() {
            return load_config_file(&candidate);
        }
    }

    Ok(LoadedConfig {
        config: Config::default(),
        path: None,
        warnings: Vec::new(),
    })
}

pub(crate) fn load_config_file(path: &Path) -> Result<LoadedConfig, String> {
    let content = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read config {}: {}", path.display(), err))?;
    let (config, warnings) = load_config_from_str(&content, path)?;
    Ok(LoadedConfig {
        config,
        path: Some(path.to_path_buf()),
        warnings,
    })
}

pub(crate) fn load_config_from_str(
    content: &str,
    path: &Path,
) -> Result<(Config, Vec<String>), String> {
    let value: Value = serde_yaml::from_str(content)
        .map_err(|err| format!("Failed to parse config {}: {}", path.display(), err))?;
    let mapping = match value {
        Value::Mapping(mapping) => mapping,
        Value::Null => Mapping::new(),
        _ => {
            return Err(format!(
                "Config {} must be a YAML mapping",
                path.display()
            ))
        }
    };

    let warnings = unknown_top_level_keys(&mapping)
        .into_iter()
        .map(|key| format!("unknown config key: {}", key))
        .collect();

    let config: Config = serde_path_to_error::deserialize(Value::Mapping(mapping)).map_err(|err| {
        format!(
            "Failed to parse config {} at {}: {}",
            path.display(),
            err.path(),
            err.inner()
        )
    })?;
    validate_config(&config).map_err(|err| format!("Invalid config {}: {}", path.display(), err))?;

    Ok((config, warnings))
}

/// Set in every agent environment; a process that sees it is running under
/// a supervisor, and its `RALPH_*` variables describe that parent loop.
pub(crate) const ENV_ACTIVE: &str = "RALPH_ACTIVE";

/// Applies `RALPH_<SECTION>_<KEY>` environment overrides on top of the file
/// configuration. Nothing is applied when `RALPH_ACTIVE` is `true`.
pub(crate) fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), String>
where
    F: Fn(&str) -> Option<String>,
{
    if lookup(ENV_ACTIVE).as_deref() == Some("true") {
        return Ok(());
    }
    let var = |key: &str| lookup(key).filter(|value| !value.is_empty());
    let invalid =
        |key: &str, value: &str, err: String| format!("Invalid {}={:?}: {}", key, value, err);

    if let Some(value) = var("RALPH_AGENT_TYPE") {
        config.agent.agent_type = value;
    }
    if let Some(value) = var("RALPH_AGENT_COMMAND") {
        config.agent.command = value;
    }
    if let Some(value) = var("RALPH_AGENT_TIMEOUT") {
        let timeout =
            parse_duration(&value).map_err(|err| invalid("RALPH_AGENT_TIMEOUT", &value, err))?;
        config.agent.timeout = (!timeout.is_zero()).then_some(timeout);
    }
    if let Some(value) = var("RALPH_LOOP_MAXITERATIONS") {
        config.run.max_iterations = value.trim().parse().map_err(|err| {
            invalid("RALPH_LOOP_MAXITERATIONS", &value, format!("{}", err))
        })?;
    }
    if let Some(value) = var("RALPH_LOOP_SLEEPBETWEEN") {
        config.run.sleep_between = parse_duration(&value)
            .map_err(|err| invalid("RALPH_LOOP_SLEEPBETWEEN", &value, err))?;
    }
    if let Some(value) = var("RALPH_LOOP_STOPONFIRSTFAILURE") {
        config.run.stop_on_first_failure = parse_bool(&value)
            .map_err(|err| invalid("RALPH_LOOP_STOPONFIRSTFAILURE", &value, err))?;
    }
    if let Some(value) = var("RALPH_PATHS_PRD") {
        config.paths.prd = PathBuf::from(value);
    }
    if let Some(value) = var("RALPH_PATHS_PROGRESS") {
        config.paths.progress = PathBuf::from(value);
    }
    if let Some(value) = var("RALPH_PATHS_PROMPT") {
        config.paths.prompt = PathBuf::from(value);
    }
    if let Some(value) = var("RALPH_HOOKS_ENABLED") {
        config.hooks.enabled = parse_bool(&value)
            .map_err(|err| invalid("RALPH_HOOKS_ENABLED", &value, err))?;
    }
    if let Some(value) = var("RALPH_LOGPATH") {
        config.log_path = Some(PathBuf::from(value));
    }
    Ok(())
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err("expected true or false".to_string()),
    }
}

pub(crate) fn validate_config(config: &Config) -> Result<(), String> {
    if config.run.max_iterations < 1 {
        return Err(format!(
            "loop.maxIterations must be a positive integer (got {}).",
            config.run.max_iterations
        ));
    }
    AgentSpec::resolve(&config.agent)?;
    Ok(())
}

fn unknown_top_level_keys(mapping: &Mapping) -> Vec<String> {
    let allowed = ["agent", "loop", "paths", "hooks", "logPath"];

    mapping
        .keys()
        .filter_map(|key| key.as_str().map(|value| value.to_string()))
        .filter(|key| !allowed.contains(&key.as_str()))
        .collect()
}

/// Parses Go-style durations: `30m`, `2s`, `1h30m`, `500ms`, `1.5h`. A bare
/// `0` is accepted as zero.
pub(crate) fn parse_duration(raw: &str) -> Result<Duration, String> {
    let text = raw.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.is_empty() {
        return Err("duration must not be empty".to_string());
    }

    let invalid = || format!("invalid duration {:?}", raw);
    let mut seconds = 0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(format!("missing unit in duration {:?}", raw)),
            unit => return Err(format!("unknown unit {:?} in duration {:?}", unit, raw)),
        };
        seconds += value * scale;
        rest = &rest[unit_len..];
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| format!("duration {:?} is out of range", raw))
}

pub(crate) fn format_duration(duration: &Duration) -> String {
    if duration.is_zero() {
        return "0s".to_string();
    }
    if duration.as_secs() == 0 {
        return format!("{}ms", duration.as_millis());
    }

    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if seconds > 0 || out.is_empty() {
        out.push_str(&format!("{}s", seconds));
    }
    out
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(value) => Ok(Duration::from_secs(value)),
        RawDuration::Text(value) => parse_duration(&value).map_err(D::Error::custom),
    }
}

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawDuration>::deserialize(deserializer)?;
    let duration = match raw {
        None => return Ok(None),
        Some(RawDuration::Seconds(value)) => Duration::from_secs(value),
        Some(RawDuration::Text(value)) => parse_duration(&value).map_err(D::Error::custom)?,
    };
    Ok((!duration.is_zero()).then_some(duration))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStringList {
    One(String),
    Many(Vec<String>),
}

/// Accepts `null`, a single string, or a list of strings.
pub(crate) fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<RawStringList>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(RawStringList::One(value)) => vec![value],
        Some(RawStringList::Many(values)) => values,
    })
}
