use serde::{Deserialize, Serialize};

/// Role of a backend inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendRole {
    /// A shard holding a partition of the logical schema.
    #[default]
    Normal,
    /// An attached server that is addressable but owns no partition.
    Attach,
    /// The passive backup node.
    Backup,
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

fn default_max_connections() -> usize {
    1024
}

/// Backend server configuration
///
/// One record per shard, persisted as part of `backend.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend name
    pub name: String,

    /// `host:port` of the primary
    pub address: String,

    pub user: String,

    pub password: String,

    /// Default database issued on connect (empty for none)
    #[serde(default)]
    pub database: String,

    #[serde(default = "default_charset")]
    pub charset: String,

    /// Idle queue capacity of the pool
    #[serde(default = "default_max_connections", rename = "max-connections")]
    pub max_connections: usize,

    /// Optional `host:port` of a read replica
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica: Option<String>,

    #[serde(default)]
    pub role: BackendRole,
}

impl BackendConfig {
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            user: "root".to_string(),
            password: String::new(),
            database: String::new(),
            charset: default_charset(),
            max_connections: default_max_connections(),
            replica: None,
            role: BackendRole::Normal,
        }
    }

    /// Set the credentials
    pub fn credentials(mut self, user: &str, password: &str) -> Self {
        self.user = user.to_string();
        self.password = password.to_string();
        self
    }

    /// Set the default database
    pub fn database(mut self, database: &str) -> Self {
        self.database = database.to_string();
        self
    }

    pub fn charset(mut self, charset: &str) -> Self {
        self.charset = charset.to_string();
        self
    }

    /// Set the pool capacity
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set a read replica address
    pub fn replica(mut self, address: &str) -> Self {
        self.replica = Some(address.to_string());
        self
    }

    pub fn role(mut self, role: BackendRole) -> Self {
        self.role = role;
        self
    }

    /// Connection string for logs, without the password.
    pub fn to_url(&self) -> String {
        format!(
            "mysql://{}:***@{}/{}",
            self.user, self.address, self.database
        )
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Backend name cannot be empty".to_string());
        }

        if self.address.is_empty() {
            return Err(format!("Backend '{}' has an empty address", self.name));
        }

        if self.max_connections == 0 {
            return Err(format!("Backend '{}': max-connections must be > 0", self.name));
        }

        if let Some(replica) = &self.replica {
            if replica.is_empty() {
                return Err(format!("Backend '{}' has an empty replica address", self.name));
            }
        }

        Ok(())
    }
}
