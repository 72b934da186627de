//! Endpoint and server configuration.

use std::env;
use std::path::PathBuf;
use std::process;

/// Default number of concurrently armed listener slots.
pub const DEFAULT_LISTEN_SLOTS: usize = 2;

/// Default rendezvous name prefix.
pub const DEFAULT_NAME_PREFIX: &str = "dipc";

/// Environment variable toggling the diagnostics server (unset or `1` = on).
pub const ENV_ENABLE: &str = "DIPC_ENABLE";

/// Environment variable overriding the server rendezvous path.
pub const ENV_TRANSPORT_PATH: &str = "DIPC_TRANSPORT_PATH";

/// Environment variable holding an address the server dials at startup.
pub const ENV_CONNECT_ADDRESS: &str = "DIPC_CONNECT_ADDRESS";

/// Environment variable tuning the listener slot count.
pub const ENV_LISTEN_SLOTS: &str = "DIPC_LISTEN_SLOTS";

/// Configuration for a single transport endpoint.
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Number of slots a listening endpoint keeps armed (minimum 1).
    ///
    /// With a single slot there is a window between accepting one
    /// connection and re-arming during which a second tool finds nobody
    /// listening; two or more slots close that window.
    pub listen_slots: usize,

    /// Prefix used when deriving the default rendezvous path.
    pub name_prefix: String,

    /// Explicit rendezvous path; overrides the derived default.
    pub transport_path: Option<PathBuf>,
}

impl IpcConfig {
    /// Creates a configuration with the defaults.
    pub fn new() -> Self {
        Self {
            listen_slots: DEFAULT_LISTEN_SLOTS,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            transport_path: None,
        }
    }

    /// Sets the listener slot count. Values below 1 are clamped to 1.
    pub fn with_listen_slots(mut self, slots: usize) -> Self {
        self.listen_slots = slots.max(1);
        self
    }

    /// Sets the prefix used for the derived rendezvous path.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Sets an explicit rendezvous path.
    pub fn with_transport_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.transport_path = Some(path.into());
        self
    }

    /// Reads `DIPC_TRANSPORT_PATH` and `DIPC_LISTEN_SLOTS` on top of the
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Ok(path) = env::var(ENV_TRANSPORT_PATH) {
            if !path.is_empty() {
                config.transport_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(slots) = env::var(ENV_LISTEN_SLOTS) {
            if let Ok(n) = slots.parse::<usize>() {
                config.listen_slots = n.max(1);
            }
        }
        config
    }

    /// Resolves the rendezvous path.
    ///
    /// The explicit path wins when set; otherwise the path is derived as
    /// `<tmpdir>/<prefix>-diagnostic-<pid>.socket` so a tool only needs the
    /// target process id to find the rendezvous.
    pub fn resolve_path(&self) -> PathBuf {
        match &self.transport_path {
            Some(path) => path.clone(),
            None => env::temp_dir().join(format!(
                "{}-diagnostic-{}.socket",
                self.name_prefix,
                process::id()
            )),
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the diagnostics server loop.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Transport settings for the server's own rendezvous point.
    pub ipc: IpcConfig,

    /// Master toggle; when false the server starts nothing at all.
    pub enabled: bool,

    /// Optional address the server dials at startup, for tools that cannot
    /// reach this process's rendezvous point themselves.
    pub connect_address: Option<PathBuf>,
}

impl ServerConfig {
    /// Creates a configuration with the defaults (enabled, no dial-out).
    pub fn new() -> Self {
        Self {
            ipc: IpcConfig::new(),
            enabled: true,
            connect_address: None,
        }
    }

    /// Replaces the transport settings.
    pub fn with_ipc(mut self, ipc: IpcConfig) -> Self {
        self.ipc = ipc;
        self
    }

    /// Enables or disables the server entirely.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the address dialed at startup.
    pub fn with_connect_address(mut self, address: impl Into<PathBuf>) -> Self {
        self.connect_address = Some(address.into());
        self
    }

    /// Reads `DIPC_ENABLE` and `DIPC_CONNECT_ADDRESS` on top of
    /// [`IpcConfig::from_env`].
    pub fn from_env() -> Self {
        let enabled = env::var(ENV_ENABLE).map(|v| v != "0").unwrap_or(true);
        let connect_address = env::var(ENV_CONNECT_ADDRESS)
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self {
            ipc: IpcConfig::from_env(),
            enabled,
            connect_address,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
