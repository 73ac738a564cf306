use std::fs;
use std::time::Duration;

use anyhow::Result;
use lanyard_gateway::ratelimit::RateWindow;
use lanyard_gateway::GatewayConfig;
use lanyard_models::voice::IceServer;
use rand::Rng;
use serde::{Deserialize, Serialize};

fn harden_secret_file_permissions(path: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub roster: RosterConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Messages retained in memory for history paging.
    #[serde(default = "default_message_history")]
    pub message_history: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".into(),
            server_name: default_server_name(),
            message_history: default_message_history(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    #[serde(default = "default_jwt_expiry")]
    pub jwt_expiry_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: generate_random_hex(64),
            jwt_expiry_seconds: default_jwt_expiry(),
        }
    }
}

/// Tunables for the connection hub. The defaults are right for small
/// deployments; everything here maps onto `GatewayConfig`.
#[derive(Debug, Deserialize, Serialize)]
pub struct GatewaySection {
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    #[serde(default = "default_message_min_interval_ms")]
    pub message_min_interval_ms: u64,
    #[serde(default = "default_voice_join_max")]
    pub voice_join_max: usize,
    #[serde(default = "default_rate_window_secs")]
    pub voice_join_window_secs: u64,
    #[serde(default = "default_rate_window_secs")]
    pub voice_join_cooldown_secs: u64,
    #[serde(default = "default_voice_relief_max")]
    pub voice_relief_max: usize,
    #[serde(default = "default_rate_window_secs")]
    pub voice_relief_window_secs: u64,
    #[serde(default = "default_rate_window_secs")]
    pub voice_relief_cooldown_secs: u64,
    #[serde(default = "default_register_timeout_secs")]
    pub register_timeout_secs: u64,
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    #[serde(default = "default_joining_timeout_secs")]
    pub joining_timeout_secs: u64,
    #[serde(default = "default_drop_disconnect_threshold")]
    pub drop_disconnect_threshold: u32,
    #[serde(default = "default_drop_log_every")]
    pub drop_log_every: u32,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            outbound_queue: default_outbound_queue(),
            max_message_len: default_max_message_len(),
            message_min_interval_ms: default_message_min_interval_ms(),
            voice_join_max: default_voice_join_max(),
            voice_join_window_secs: default_rate_window_secs(),
            voice_join_cooldown_secs: default_rate_window_secs(),
            voice_relief_max: default_voice_relief_max(),
            voice_relief_window_secs: default_rate_window_secs(),
            voice_relief_cooldown_secs: default_rate_window_secs(),
            register_timeout_secs: default_register_timeout_secs(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            joining_timeout_secs: default_joining_timeout_secs(),
            drop_disconnect_threshold: default_drop_disconnect_threshold(),
            drop_log_every: default_drop_log_every(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Address of the media relay's control socket, e.g. "127.0.0.1:7700".
    /// Voice is disabled when unset.
    pub control_addr: Option<String>,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            control_addr: None,
            ice_servers: default_ice_servers(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RosterConfig {
    #[serde(default)]
    pub users: Vec<RosterUser>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RosterUser {
    pub id: i64,
    pub username: String,
    pub display_name: Option<String>,
}

impl Config {
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            jwt_secret: self.auth.jwt_secret.clone(),
            outbound_capacity: self.gateway.outbound_queue,
            max_message_len: self.gateway.max_message_len,
            message_min_interval: Duration::from_millis(self.gateway.message_min_interval_ms),
            voice_join_window: RateWindow {
                max_events: self.gateway.voice_join_max,
                window: Duration::from_secs(self.gateway.voice_join_window_secs),
                cooldown: Duration::from_secs(self.gateway.voice_join_cooldown_secs),
            },
            voice_relief_window: RateWindow {
                max_events: self.gateway.voice_relief_max,
                window: Duration::from_secs(self.gateway.voice_relief_window_secs),
                cooldown: Duration::from_secs(self.gateway.voice_relief_cooldown_secs),
            },
            register_timeout: Duration::from_secs(self.gateway.register_timeout_secs),
            watchdog_interval: Duration::from_secs(self.gateway.watchdog_interval_secs),
            joining_timeout: Duration::from_secs(self.gateway.joining_timeout_secs),
            drop_disconnect_threshold: self.gateway.drop_disconnect_threshold,
            drop_log_every: self.gateway.drop_log_every,
            keepalive_interval: Duration::from_secs(self.gateway.keepalive_interval_secs),
            ice_servers: self.relay.ice_servers.clone(),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Generate a cryptographically random hex string of the given length.
fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..16u8);
            char::from(if idx < 10 {
                b'0' + idx
            } else {
                b'a' + idx - 10
            })
        })
        .collect()
}

fn default_server_name() -> String {
    "localhost".into()
}
fn default_message_history() -> usize {
    1000
}
fn default_jwt_expiry() -> u64 {
    86_400
}
fn default_outbound_queue() -> usize {
    256
}
fn default_max_message_len() -> usize {
    4096
}
fn default_message_min_interval_ms() -> u64 {
    500
}
fn default_voice_join_max() -> usize {
    5
}
fn default_voice_relief_max() -> usize {
    5
}
fn default_rate_window_secs() -> u64 {
    30
}
fn default_register_timeout_secs() -> u64 {
    5
}
fn default_watchdog_interval_secs() -> u64 {
    10
}
fn default_joining_timeout_secs() -> u64 {
    30
}
fn default_drop_disconnect_threshold() -> u32 {
    100
}
fn default_drop_log_every() -> u32 {
    10
}
fn default_keepalive_interval_secs() -> u64 {
    20
}
fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec!["stun:stun.l.google.com:19302".into()],
        username: None,
        credential: None,
    }]
}

fn looks_like_placeholder_secret(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return true;
    }
    normalized.contains("change_me")
        || normalized.contains("replace_me")
        || normalized.starts_with("example")
        || normalized == "devkey"
        || normalized == "devsecret"
        || normalized == "secret"
}

fn validate_secret_configuration(config: &Config) -> Result<()> {
    let jwt_secret = config.auth.jwt_secret.trim();
    if jwt_secret.len() < 32 || looks_like_placeholder_secret(jwt_secret) {
        anyhow::bail!(
            "Invalid auth.jwt_secret: use a strong random secret (at least 32 characters) and never leave placeholder values"
        );
    }
    Ok(())
}

/// Generate a commented config file template with the given values filled in.
fn generate_config_template(config: &Config) -> String {
    format!(
        r#"# Lanyard Server Configuration
# Generated automatically on first run. Edit as needed.

[server]
bind_address = "{bind_address}"
server_name = "{server_name}"
# Chat messages retained in memory for history paging.
message_history = {message_history}

[auth]
jwt_secret = "{jwt_secret}"
jwt_expiry_seconds = {jwt_expiry}

[gateway]
# Per-connection outbound queue; slow consumers drop frames past this.
outbound_queue = {outbound_queue}
max_message_len = {max_message_len}
message_min_interval_ms = {message_min_interval_ms}
# Voice join attempts allowed per window before the cooldown kicks in.
voice_join_max = {voice_join_max}
voice_join_window_secs = {voice_join_window_secs}
voice_join_cooldown_secs = {voice_join_cooldown_secs}
# Unmute/undeafen changes allowed per window. Muting is never limited.
voice_relief_max = {voice_relief_max}
voice_relief_window_secs = {voice_relief_window_secs}
voice_relief_cooldown_secs = {voice_relief_cooldown_secs}
register_timeout_secs = {register_timeout_secs}
watchdog_interval_secs = {watchdog_interval_secs}
joining_timeout_secs = {joining_timeout_secs}
drop_disconnect_threshold = {drop_disconnect_threshold}
keepalive_interval_secs = {keepalive_interval_secs}

[relay]
# Address of the media relay control socket. Voice stays disabled until set.
# control_addr = "127.0.0.1:7700"

[[relay.ice_servers]]
urls = ["stun:stun.l.google.com:19302"]
# username = "turn-user"
# credential = "turn-pass"

# Accounts allowed to connect. Tokens are issued with --issue-token <id>.
# [[roster.users]]
# id = 1
# username = "alice"
# display_name = "Alice"
"#,
        bind_address = config.server.bind_address,
        server_name = config.server.server_name,
        message_history = config.server.message_history,
        jwt_secret = config.auth.jwt_secret,
        jwt_expiry = config.auth.jwt_expiry_seconds,
        outbound_queue = config.gateway.outbound_queue,
        max_message_len = config.gateway.max_message_len,
        message_min_interval_ms = config.gateway.message_min_interval_ms,
        voice_join_max = config.gateway.voice_join_max,
        voice_join_window_secs = config.gateway.voice_join_window_secs,
        voice_join_cooldown_secs = config.gateway.voice_join_cooldown_secs,
        voice_relief_max = config.gateway.voice_relief_max,
        voice_relief_window_secs = config.gateway.voice_relief_window_secs,
        voice_relief_cooldown_secs = config.gateway.voice_relief_cooldown_secs,
        register_timeout_secs = config.gateway.register_timeout_secs,
        watchdog_interval_secs = config.gateway.watchdog_interval_secs,
        joining_timeout_secs = config.gateway.joining_timeout_secs,
        drop_disconnect_threshold = config.gateway.drop_disconnect_threshold,
        keepalive_interval_secs = config.gateway.keepalive_interval_secs,
    )
}

// ── Config Loading ───────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!("Config file not found at '{}', generating defaults...", path);
            let config = Config::default();

            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }
            let template = generate_config_template(&config);
            fs::write(path, &template)?;
            let _ = harden_secret_file_permissions(path);
            tracing::info!("Generated default config at '{}'", path);
            config
        };
        let _ = harden_secret_file_permissions(path);

        // Environment variable overrides
        if let Ok(value) = std::env::var("LANYARD_BIND_ADDRESS") {
            config.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("LANYARD_SERVER_NAME") {
            config.server.server_name = value;
        }
        if let Ok(value) = std::env::var("LANYARD_JWT_SECRET") {
            config.auth.jwt_secret = value;
        }
        if let Ok(value) = std::env::var("LANYARD_JWT_EXPIRY_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.auth.jwt_expiry_seconds = parsed;
            }
        }
        if let Ok(value) = std::env::var("LANYARD_RELAY_CONTROL_ADDR") {
            config.relay.control_addr = if value.trim().is_empty() {
                None
            } else {
                Some(value)
            };
        }

        validate_secret_configuration(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_map_onto_gateway_config() {
        let config = Config::default();
        let gateway = config.gateway_config();
        assert_eq!(gateway.outbound_capacity, 256);
        assert_eq!(gateway.message_min_interval, Duration::from_millis(500));
        assert_eq!(gateway.voice_join_window.max_events, 5);
        assert_eq!(gateway.joining_timeout, Duration::from_secs(30));
        assert_eq!(gateway.ice_servers.len(), 1);
    }

    #[test]
    fn first_run_generates_parseable_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lanyard-test.toml");
        let path = path.to_str().expect("config path utf8");

        let generated = Config::load(path).expect("load config");
        assert!(std::path::Path::new(path).exists());

        // The generated file round-trips with the same secret.
        let reloaded = Config::load(path).expect("reload config");
        assert_eq!(reloaded.auth.jwt_secret, generated.auth.jwt_secret);
        assert_eq!(reloaded.auth.jwt_secret.len(), 64);
    }

    #[test]
    fn rejects_placeholder_secret() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lanyard-bad.toml");
        fs::write(
            &path,
            "[server]\nbind_address = \"0.0.0.0:8080\"\n\n[auth]\njwt_secret = \"change_me_please_change_me_please_now\"\n",
        )
        .expect("write config");
        assert!(Config::load(path.to_str().expect("config path utf8")).is_err());
    }

    #[test]
    fn parses_roster_and_relay_sections() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lanyard-roster.toml");
        fs::write(
            &path,
            r#"
[server]
bind_address = "127.0.0.1:9000"

[auth]
jwt_secret = "0123456789abcdef0123456789abcdef"

[relay]
control_addr = "127.0.0.1:7700"

[[roster.users]]
id = 1
username = "alice"
display_name = "Alice"

[[roster.users]]
id = 2
username = "bob"
"#,
        )
        .expect("write config");

        let config = Config::load(path.to_str().expect("config path utf8")).expect("load config");
        assert_eq!(config.relay.control_addr.as_deref(), Some("127.0.0.1:7700"));
        assert_eq!(config.roster.users.len(), 2);
        assert_eq!(config.roster.users[0].display_name.as_deref(), Some("Alice"));
        assert!(config.roster.users[1].display_name.is_none());
    }
}
