use crate::config::ConfigError;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_BASE_URL: &str = "https://open.bigmodel.cn/api/paas/v4";
pub const DEFAULT_MODEL: &str = "autoglm-phone";
pub const DEFAULT_MAX_STEPS: &str = "100";
pub const DEFAULT_ADB_PATH: &str = "adb";
pub const DEFAULT_AGENT_PROGRAM: &str = "python";
pub const DEFAULT_AGENT_SCRIPT: &str = "main.py";

/// Output language hint passed to the automation agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    #[default]
    Cn,
    En,
}

impl Lang {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lang::Cn => "cn",
            Lang::En => "en",
        }
    }
}

impl fmt::Display for Lang {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lang {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cn" => Ok(Lang::Cn),
            "en" => Ok(Lang::En),
            other => Err(ConfigError::Invalid(format!(
                "lang must be 'cn' or 'en', got '{}'",
                other
            ))),
        }
    }
}

// Same spellings as `FromStr`
impl<'de> Deserialize<'de> for Lang {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Settings record persisted in `autoglm_config.json`.
///
/// Missing keys are filled from [`ConfigRecord::default`]; keys this crate does not
/// recognize are kept in `extra` and written back unchanged on save.
///
/// `Debug` never prints the API key.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigRecord {
    pub base_url: String,

    pub model: String,

    pub api_key: String,

    /// Step budget, kept as text the way the file stores it
    #[serde(deserialize_with = "string_or_integer")]
    pub max_steps: String,

    pub lang: Lang,

    /// Bridge tool executable
    pub adb_path: String,

    /// Program that hosts the automation agent
    pub agent_program: String,

    /// Script handed to `agent_program`; empty means the program is the agent itself
    pub agent_script: String,

    /// Working directory for the agent; empty inherits ours
    pub agent_workdir: String,

    #[serde(flatten)]
    pub extra: IndexMap<String, serde_json::Value>,
}

impl Default for ConfigRecord {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: String::new(),
            max_steps: DEFAULT_MAX_STEPS.to_string(),
            lang: Lang::Cn,
            adb_path: DEFAULT_ADB_PATH.to_string(),
            agent_program: DEFAULT_AGENT_PROGRAM.to_string(),
            agent_script: DEFAULT_AGENT_SCRIPT.to_string(),
            agent_workdir: String::new(),
            extra: IndexMap::new(),
        }
    }
}

impl fmt::Debug for ConfigRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigRecord")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &mask_secret(&self.api_key))
            .field("max_steps", &self.max_steps)
            .field("lang", &self.lang)
            .field("adb_path", &self.adb_path)
            .field("agent_program", &self.agent_program)
            .field("agent_script", &self.agent_script)
            .field("agent_workdir", &self.agent_workdir)
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConfigRecord {
    /// Check the fields the orchestrator relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("baseUrl must not be empty".to_string()));
        }

        self.max_steps_value()?;

        if self.adb_path.trim().is_empty() {
            return Err(ConfigError::Invalid("adbPath must not be empty".to_string()));
        }

        if self.agent_program.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "agentProgram must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// `maxSteps` as a positive integer
    pub fn max_steps_value(&self) -> Result<u32, ConfigError> {
        match self.max_steps.trim().parse::<u32>() {
            Ok(steps) if steps > 0 => Ok(steps),
            _ => Err(ConfigError::Invalid(format!(
                "maxSteps must be a positive integer, got '{}'",
                self.max_steps
            ))),
        }
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Set a field by its file key. Unrecognized keys are stored as string extras.
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "baseUrl" => self.base_url = value.to_string(),
            "model" => self.model = value.to_string(),
            "apiKey" => self.api_key = value.to_string(),
            "maxSteps" => {
                let previous = std::mem::replace(&mut self.max_steps, value.trim().to_string());
                if let Err(e) = self.max_steps_value() {
                    self.max_steps = previous;
                    return Err(e);
                }
            }
            "lang" => self.lang = value.parse()?,
            "adbPath" => self.adb_path = value.to_string(),
            "agentProgram" => self.agent_program = value.to_string(),
            "agentScript" => self.agent_script = value.to_string(),
            "agentWorkdir" => self.agent_workdir = value.to_string(),
            other => {
                self.extra.insert(
                    other.to_string(),
                    serde_json::Value::String(value.to_string()),
                );
            }
        }
        Ok(())
    }

    /// Copy of the record with the API key masked, for display.
    pub fn redacted(&self) -> Self {
        Self {
            api_key: mask_secret(&self.api_key),
            ..self.clone()
        }
    }
}

/// Mask a secret, keeping a short prefix so the user can tell keys apart.
pub fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let prefix: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 8 {
        "********".to_string()
    } else {
        format!("{}********", prefix)
    }
}

fn string_or_integer<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or integer, got {}",
            other
        ))),
    }
}
