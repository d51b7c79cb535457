use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub log: LogConfig,
    #[serde(default)]
    pub ledger: bean_ledger::Config,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthConfig {
    /// Usernames allowed on the admin routes
    pub admin_users: Vec<String>,
    /// Trust `X-Test-Username` instead of bearer tokens
    pub test_mode: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl AuthConfig {
    pub fn is_admin(&self, username: &str) -> bool {
        self.admin_users.iter().any(|admin| admin == username)
    }
}

/// Split a comma-separated user list, dropping blanks
pub fn parse_user_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            // Start with default configuration
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.workers", 4)?
            .set_default("auth.admin_users", Vec::<String>::new())?
            .set_default("auth.test_mode", false)?
            .set_default("log.level", "info")?
            .set_default("log.json", false)?;

        // Add environment-specific config file if it exists
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("BEAN_API")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("auth.admin_users")
                .try_parsing(true),
        );

        // Special handling for common env vars
        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("ledger.database.url", db_url)?;
        }

        if let Ok(secret) = env::var("JWT_SECRET") {
            builder = builder.set_override("ledger.signing.jwt_secret", secret)?;
        }

        if let Ok(key) = env::var("EXPORT_SIGNING_KEY") {
            builder = builder.set_override("ledger.signing.export_key", key)?;
        }

        if let Ok(admins) = env::var("ADMIN_USERS") {
            builder = builder.set_override("auth.admin_users", parse_user_list(&admins))?;
        }

        if let Ok(test_mode) = env::var("TEST_MODE") {
            builder = builder.set_override("auth.test_mode", parse_flag(&test_mode))?;
        }

        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.server.workers == 0 {
            return Err("At least one worker is required".to_string());
        }

        self.ledger.validate().map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut ledger = bean_ledger::Config::default();
        ledger.signing.jwt_secret = "jwt".into();
        ledger.signing.export_key = "export".into();

        Config {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8080,
                workers: 1,
            },
            auth: AuthConfig {
                admin_users: vec!["root".into()],
                test_mode: false,
            },
            log: LogConfig {
                level: "info".into(),
                json: false,
            },
            ledger,
        }
    }

    #[test]
    fn test_parse_user_list() {
        assert_eq!(parse_user_list("alice, bob,,carol "), vec!["alice", "bob", "carol"]);
        assert!(parse_user_list("").is_empty());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn test_is_admin() {
        let config = config();
        assert!(config.auth.is_admin("root"));
        assert!(!config.auth.is_admin("alice"));
    }

    #[test]
    fn test_validate() {
        assert!(config().validate().is_ok());

        let mut bad = config();
        bad.server.port = 0;
        assert!(bad.validate().is_err());

        let mut no_secret = config();
        no_secret.ledger.signing.export_key.clear();
        assert!(no_secret.validate().is_err());
    }
}
