use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Failed to write the config file back.
    WriteFile { path: PathBuf, source: std::io::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::WriteFile { path, source } => {
                write!(f, "failed to write config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::WriteFile { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    homeserver_url: String,
    access_token: Option<String>,
    /// Used for a password login when no access_token is set.
    login_name: Option<String>,
    password: Option<String>,
    /// Fence marker, e.g. "mermaid" for ```mermaid blocks.
    #[serde(default = "default_diagram_language")]
    diagram_language: String,
    /// Program and leading arguments of the Mermaid CLI.
    #[serde(default = "default_renderer_command")]
    renderer_command: Vec<String>,
    renderer_puppeteer_config: Option<String>,
    /// Directory for state files (logs, sync token, database). Defaults to current directory.
    data_dir: Option<String>,
    log_room_id: Option<String>,
    #[serde(default = "default_true")]
    autojoin: bool,
    /// 0 keeps records forever.
    #[serde(default = "default_record_retention_days")]
    record_retention_days: u32,
    /// 0 keeps pending commands until consumed.
    #[serde(default = "default_pending_command_ttl_minutes")]
    pending_command_ttl_minutes: u32,
    #[serde(default = "default_manage_power_action")]
    manage_power_action: String,
    #[serde(default)]
    notices_in_thread: bool,
}

fn default_diagram_language() -> String {
    "mermaid".to_string()
}

fn default_renderer_command() -> Vec<String> {
    vec!["mmdc".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_record_retention_days() -> u32 {
    30
}

fn default_pending_command_ttl_minutes() -> u32 {
    60
}

fn default_manage_power_action() -> String {
    "kick".to_string()
}

/// How the bot authenticates.
#[derive(Debug, Clone, PartialEq)]
pub enum Credentials {
    AccessToken(String),
    Password { login_name: String, password: String },
}

pub struct Config {
    /// Path to the config file (for saving the access token)
    pub config_path: PathBuf,
    pub homeserver_url: String,
    pub credentials: Credentials,
    pub diagram_language: String,
    pub renderer_command: Vec<String>,
    pub renderer_puppeteer_config: Option<PathBuf>,
    /// Directory for state files.
    pub data_dir: PathBuf,
    pub log_room_id: Option<String>,
    pub autojoin: bool,
    pub record_retention_days: u32,
    pub pending_command_ttl_minutes: u32,
    pub manage_power_action: String,
    pub notices_in_thread: bool,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        // Validate required fields
        let homeserver_url = file.homeserver_url.trim().trim_end_matches('/').to_string();
        if homeserver_url.is_empty() {
            return Err(ConfigError::Validation("homeserver_url is required".into()));
        }
        if !homeserver_url.starts_with("http://") && !homeserver_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "homeserver_url must start with http:// or https://".into(),
            ));
        }

        let credentials = match (file.access_token, file.login_name, file.password) {
            (Some(token), _, _) if !token.is_empty() => Credentials::AccessToken(token),
            (_, Some(login_name), Some(password)) if !login_name.is_empty() && !password.is_empty() => {
                Credentials::Password { login_name, password }
            }
            _ => {
                return Err(ConfigError::Validation(
                    "either access_token or login_name and password are required".into(),
                ));
            }
        };

        if file.diagram_language.trim().is_empty() {
            return Err(ConfigError::Validation("diagram_language must not be empty".into()));
        }
        if file.renderer_command.first().is_none_or(|p| p.is_empty()) {
            return Err(ConfigError::Validation("renderer_command must name a program".into()));
        }
        if file.manage_power_action.is_empty() {
            return Err(ConfigError::Validation("manage_power_action must not be empty".into()));
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            config_path,
            homeserver_url,
            credentials,
            diagram_language: file.diagram_language.trim().to_string(),
            renderer_command: file.renderer_command,
            renderer_puppeteer_config: file.renderer_puppeteer_config.map(PathBuf::from),
            data_dir,
            log_room_id: file.log_room_id.filter(|r| !r.is_empty()),
            autojoin: file.autojoin,
            record_retention_days: file.record_retention_days,
            pending_command_ttl_minutes: file.pending_command_ttl_minutes,
            manage_power_action: file.manage_power_action,
            notices_in_thread: file.notices_in_thread,
        })
    }

    /// Save `token` into the config file and drop the password login fields.
    pub fn store_access_token(&mut self, token: &str) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(&self.config_path)
            .map_err(|e| ConfigError::ReadFile { path: self.config_path.clone(), source: e })?;
        let mut json: Value = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: self.config_path.clone(), source: e })?;

        let Some(obj) = json.as_object_mut() else {
            return Err(ConfigError::Validation("config file is not a JSON object".into()));
        };
        obj.insert("access_token".to_string(), Value::String(token.to_string()));
        obj.remove("login_name");
        obj.remove("password");

        let pretty = serde_json::to_string_pretty(&json)
            .map_err(|e| ConfigError::ParseJson { path: self.config_path.clone(), source: e })?;
        std::fs::write(&self.config_path, pretty)
            .map_err(|e| ConfigError::WriteFile { path: self.config_path.clone(), source: e })?;

        self.credentials = Credentials::AccessToken(token.to_string());
        Ok(())
    }

    pub fn record_retention(&self) -> Option<chrono::Duration> {
        (self.record_retention_days > 0).then(|| chrono::Duration::days(self.record_retention_days.into()))
    }

    pub fn pending_ttl(&self) -> Option<chrono::Duration> {
        (self.pending_command_ttl_minutes > 0)
            .then(|| chrono::Duration::minutes(self.pending_command_ttl_minutes.into()))
    }
}
