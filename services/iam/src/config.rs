use crate::auth::password::{MAX_COST, MIN_COST};
use anyhow::{Context, Result, bail};
use iam_token::{Algorithm, KeyLookup, KeyMaterial, KeySecret};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BIND: &str = "0.0.0.0:9000";
pub const DEFAULT_METRICS_BIND: &str = "0.0.0.0:9090";
pub const DEFAULT_ISSUER: &str = "iam";
pub const DEFAULT_AUDIENCE: &str = "iam-clients";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 8 * 60 * 60;
pub const MAX_SESSION_TTL_SECS: u64 = 30 * 24 * 60 * 60;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_DB_ACQUIRE_TIMEOUT_MS: u64 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            other => bail!("unknown storage backend: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
    pub application_name: String,
    /// Oldest migration version this binary accepts, if enforced.
    pub min_migration: Option<i64>,
}

/// Where one signing key comes from.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct KeyConfig {
    pub id: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default, alias = "private")]
    pub private_key_path: Option<PathBuf>,
    #[serde(default, alias = "public")]
    pub public_key_path: Option<PathBuf>,
    #[serde(default)]
    pub shared_secret: Option<String>,
}

fn default_algorithm() -> String {
    "RS256".to_string()
}

impl KeyConfig {
    /// Read key files and build the material the key ring parses.
    pub fn load(&self) -> Result<KeyMaterial> {
        let algorithm = Algorithm::from_str(&self.algorithm)
            .with_context(|| format!("parse algorithm for key {}", self.id))?;
        let secret = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = self
                    .shared_secret
                    .as_ref()
                    .with_context(|| format!("key {} needs shared_secret", self.id))?;
                KeySecret::Shared(secret.as_bytes().to_vec())
            }
            _ => {
                let private_path = self
                    .private_key_path
                    .as_ref()
                    .with_context(|| format!("key {} needs private_key_path", self.id))?;
                let public_path = self
                    .public_key_path
                    .as_ref()
                    .with_context(|| format!("key {} needs public_key_path", self.id))?;
                KeySecret::Pem {
                    private_key_pem: fs::read(private_path).with_context(|| {
                        format!("read private key {}", private_path.display())
                    })?,
                    public_key_pem: fs::read(public_path)
                        .with_context(|| format!("read public key {}", public_path.display()))?,
                }
            }
        };
        Ok(KeyMaterial {
            id: self.id.clone(),
            algorithm,
            secret,
        })
    }
}

// IAM service configuration sourced from environment variables and an
// optional YAML file.
#[derive(Debug, Clone)]
pub struct IamConfig {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub metrics_bind: SocketAddr,
    pub storage: StorageBackend,
    pub postgres: Option<PostgresConfig>,
    pub issuer: String,
    pub audience: String,
    pub key_lookup: KeyLookup,
    pub session_ttl: Duration,
    pub password_cost: u32,
    pub keys: Vec<KeyConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct IamConfigOverride {
    service_name: Option<String>,
    bind_addr: Option<String>,
    metrics_bind: Option<String>,
    storage: Option<String>,
    session_ttl_secs: Option<u64>,
    password_cost: Option<u32>,
    #[serde(default)]
    database: Option<DatabaseOverride>,
    #[serde(default)]
    jwt: Option<JwtOverride>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabaseOverride {
    url: Option<String>,
    max_connections: Option<u32>,
    acquire_timeout_ms: Option<u64>,
    minimum_migration: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct JwtOverride {
    issuer: Option<String>,
    audience: Option<String>,
    key_lookup: Option<KeyLookup>,
    keys: Option<Vec<KeyConfig>>,
}

impl IamConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env_or("IAM_BIND", DEFAULT_BIND)
            .parse()
            .with_context(|| "parse IAM_BIND")?;
        let metrics_bind = env_or("IAM_METRICS_BIND", DEFAULT_METRICS_BIND)
            .parse()
            .with_context(|| "parse IAM_METRICS_BIND")?;
        let database_url = std::env::var("IAM_DATABASE_URL").ok();
        let storage = match std::env::var("IAM_STORAGE") {
            Ok(value) => value.parse()?,
            Err(_) if database_url.is_some() => StorageBackend::Postgres,
            Err(_) => StorageBackend::Memory,
        };
        let service_name = env_or("IAM_SERVICE_NAME", "iam");
        let postgres = match database_url {
            Some(url) => Some(PostgresConfig {
                url,
                max_connections: env_parse("IAM_DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?,
                acquire_timeout_ms: env_parse(
                    "IAM_DB_ACQUIRE_TIMEOUT_MS",
                    DEFAULT_DB_ACQUIRE_TIMEOUT_MS,
                )?,
                application_name: service_name.clone(),
                min_migration: match std::env::var("IAM_MIN_MIGRATION") {
                    Ok(value) => Some(value.parse().with_context(|| "parse IAM_MIN_MIGRATION")?),
                    Err(_) => None,
                },
            }),
            None => None,
        };
        let key_lookup = match std::env::var("IAM_KEY_LOOKUP") {
            Ok(value) => value
                .parse::<KeyLookup>()
                .map_err(anyhow::Error::msg)
                .with_context(|| "parse IAM_KEY_LOOKUP")?,
            Err(_) => KeyLookup::default(),
        };
        let keys = match std::env::var("IAM_SIGNING_KEY_ID") {
            Ok(id) => vec![KeyConfig {
                id,
                algorithm: env_or("IAM_SIGNING_KEY_ALGORITHM", "RS256"),
                private_key_path: std::env::var("IAM_SIGNING_PRIVATE_KEY_PATH")
                    .ok()
                    .map(PathBuf::from),
                public_key_path: std::env::var("IAM_SIGNING_PUBLIC_KEY_PATH")
                    .ok()
                    .map(PathBuf::from),
                shared_secret: std::env::var("IAM_SIGNING_SHARED_SECRET").ok(),
            }],
            Err(_) => Vec::new(),
        };
        Ok(Self {
            service_name,
            bind_addr,
            metrics_bind,
            storage,
            postgres,
            issuer: env_or("IAM_JWT_ISSUER", DEFAULT_ISSUER),
            audience: env_or("IAM_JWT_AUDIENCE", DEFAULT_AUDIENCE),
            key_lookup,
            session_ttl: Duration::from_secs(env_parse(
                "IAM_SESSION_TTL_SECS",
                DEFAULT_SESSION_TTL_SECS,
            )?),
            password_cost: env_parse("IAM_PASSWORD_COST", bcrypt::DEFAULT_COST)?,
            keys,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("IAM_CONFIG_FILE") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read IAM_CONFIG_FILE: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from a YAML document onto this configuration.
    pub fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: IamConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse iam config yaml")?;
        if let Some(value) = override_cfg.service_name {
            self.service_name = value;
        }
        if let Some(value) = override_cfg.bind_addr {
            self.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.storage {
            self.storage = value.parse()?;
        }
        if let Some(value) = override_cfg.session_ttl_secs {
            self.session_ttl = Duration::from_secs(value);
        }
        if let Some(value) = override_cfg.password_cost {
            self.password_cost = value;
        }
        if let Some(database) = override_cfg.database {
            let service_name = self.service_name.clone();
            let current = self.postgres.get_or_insert_with(|| PostgresConfig {
                url: String::new(),
                max_connections: DEFAULT_DB_MAX_CONNECTIONS,
                acquire_timeout_ms: DEFAULT_DB_ACQUIRE_TIMEOUT_MS,
                application_name: service_name,
                min_migration: None,
            });
            if let Some(value) = database.url {
                current.url = value;
            }
            if let Some(value) = database.max_connections {
                current.max_connections = value;
            }
            if let Some(value) = database.acquire_timeout_ms {
                current.acquire_timeout_ms = value;
            }
            if let Some(value) = database.minimum_migration {
                current.min_migration = Some(value);
            }
        }
        if let Some(jwt) = override_cfg.jwt {
            if let Some(value) = jwt.issuer {
                self.issuer = value;
            }
            if let Some(value) = jwt.audience {
                self.audience = value;
            }
            if let Some(value) = jwt.key_lookup {
                self.key_lookup = value;
            }
            if let Some(keys) = jwt.keys {
                self.keys = keys;
            }
        }
        Ok(())
    }

    /// Reject configurations the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.keys.is_empty() {
            bail!("no signing keys configured");
        }
        if self.issuer.trim().is_empty() || self.audience.trim().is_empty() {
            bail!("jwt issuer and audience must be set");
        }
        if self.session_ttl.as_secs() == 0 || self.session_ttl.as_secs() > MAX_SESSION_TTL_SECS {
            bail!("session ttl must be between 1 and {MAX_SESSION_TTL_SECS} seconds");
        }
        if !(MIN_COST..=MAX_COST).contains(&self.password_cost) {
            bail!(
                "password cost must be between {} and {}",
                MIN_COST,
                MAX_COST
            );
        }
        if self.storage == StorageBackend::Postgres
            && self
                .postgres
                .as_ref()
                .map(|pg| pg.url.is_empty())
                .unwrap_or(true)
        {
            bail!("postgres storage selected but no database url configured");
        }
        Ok(())
    }

    /// Load every configured key's material from disk.
    pub fn load_key_material(&self) -> Result<Vec<KeyMaterial>> {
        self.keys.iter().map(KeyConfig::load).collect()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value.parse().with_context(|| format!("parse {key}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    fn clear_env() -> Vec<EnvGuard> {
        [
            "IAM_BIND",
            "IAM_METRICS_BIND",
            "IAM_STORAGE",
            "IAM_DATABASE_URL",
            "IAM_MIN_MIGRATION",
            "IAM_KEY_LOOKUP",
            "IAM_SIGNING_KEY_ID",
            "IAM_SESSION_TTL_SECS",
            "IAM_PASSWORD_COST",
            "IAM_JWT_ISSUER",
            "IAM_JWT_AUDIENCE",
            "IAM_CONFIG_FILE",
        ]
        .into_iter()
        .map(EnvGuard::unset)
        .collect()
    }

    #[test]
    #[serial]
    fn defaults_without_env() {
        let _guards = clear_env();
        let config = IamConfig::from_env().expect("config");
        assert_eq!(config.bind_addr, DEFAULT_BIND.parse().unwrap());
        assert_eq!(config.storage, StorageBackend::Memory);
        assert!(config.postgres.is_none());
        assert_eq!(config.key_lookup, KeyLookup::HeaderAddressed);
        assert_eq!(config.session_ttl, Duration::from_secs(DEFAULT_SESSION_TTL_SECS));
        assert_eq!(config.password_cost, bcrypt::DEFAULT_COST);
        assert!(config.keys.is_empty());
        assert!(config.validate().is_err(), "no keys configured");
    }

    #[test]
    #[serial]
    fn database_url_selects_postgres() {
        let _guards = clear_env();
        let _url = EnvGuard::set("IAM_DATABASE_URL", "postgres://localhost/iam");
        let _min = EnvGuard::set("IAM_MIN_MIGRATION", "1");
        let config = IamConfig::from_env().expect("config");
        assert_eq!(config.storage, StorageBackend::Postgres);
        let pg = config.postgres.expect("postgres");
        assert_eq!(pg.min_migration, Some(1));
        assert_eq!(pg.max_connections, DEFAULT_DB_MAX_CONNECTIONS);
    }

    #[test]
    #[serial]
    fn invalid_env_values_fail() {
        let _guards = clear_env();
        {
            let _bad = EnvGuard::set("IAM_BIND", "not-an-addr");
            assert!(IamConfig::from_env().is_err());
        }
        {
            let _bad = EnvGuard::set("IAM_KEY_LOOKUP", "round_robin");
            assert!(IamConfig::from_env().is_err());
        }
        {
            let _bad = EnvGuard::set("IAM_SESSION_TTL_SECS", "soon");
            assert!(IamConfig::from_env().is_err());
        }
    }

    #[test]
    #[serial]
    fn yaml_overrides_env_and_carries_keys() {
        let _guards = clear_env();
        let _issuer = EnvGuard::set("IAM_JWT_ISSUER", "from-env");
        let mut config = IamConfig::from_env().expect("config");
        config
            .apply_yaml(
                r#"
bind_addr: "127.0.0.1:7000"
session_ttl_secs: 60
password_cost: 4
jwt:
  issuer: "from-yaml"
  audience: "clients"
  key_lookup: scan_all
  keys:
    - id: "k1"
      public: "/etc/iam/k1.pub"
      private: "/etc/iam/k1.pem"
    - id: "k2"
      algorithm: "HS256"
      shared_secret: "0123456789abcdef0123456789abcdef"
database:
  url: "postgres://db/iam"
  minimum_migration: 1
"#,
            )
            .expect("yaml");
        assert_eq!(config.bind_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.issuer, "from-yaml");
        assert_eq!(config.audience, "clients");
        assert_eq!(config.key_lookup, KeyLookup::ScanAll);
        assert_eq!(config.session_ttl, Duration::from_secs(60));
        assert_eq!(config.keys.len(), 2);
        assert_eq!(config.keys[0].algorithm, "RS256");
        assert_eq!(
            config.keys[0].public_key_path.as_deref(),
            Some(std::path::Path::new("/etc/iam/k1.pub"))
        );
        assert_eq!(config.postgres.as_ref().map(|pg| pg.url.as_str()), Some("postgres://db/iam"));
        // Storage stays memory unless chosen explicitly.
        assert_eq!(config.storage, StorageBackend::Memory);
        config.validate().expect("valid");
    }

    #[test]
    fn validate_rejects_postgres_without_url() {
        let mut config = test_config();
        config.storage = StorageBackend::Postgres;
        assert!(config.validate().is_err());
        config.password_cost = 40;
        config.storage = StorageBackend::Memory;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_bounds_session_ttl() {
        let mut config = test_config();
        config.session_ttl = Duration::from_secs(MAX_SESSION_TTL_SECS);
        config.validate().expect("largest ttl");
        for secs in [0, MAX_SESSION_TTL_SECS + 1, u64::MAX] {
            config.session_ttl = Duration::from_secs(secs);
            assert!(config.validate().is_err(), "{secs}");
        }
    }

    #[test]
    fn cost_bounds_are_enforced() {
        let mut config = test_config();
        for cost in [MIN_COST, MAX_COST] {
            config.password_cost = cost;
            config.validate().expect("cost in range");
        }
        for cost in [MIN_COST - 1, MAX_COST + 1] {
            config.password_cost = cost;
            assert!(config.validate().is_err(), "{cost}");
        }
    }

    #[test]
    fn shared_secret_key_loads_without_files() {
        let key = KeyConfig {
            id: "hs".to_string(),
            algorithm: "HS256".to_string(),
            private_key_path: None,
            public_key_path: None,
            shared_secret: Some("0123456789abcdef0123456789abcdef".to_string()),
        };
        let material = key.load().expect("material");
        assert_eq!(material.algorithm, Algorithm::HS256);
    }

    #[test]
    fn asymmetric_key_requires_paths_and_readable_files() {
        let mut key = KeyConfig {
            id: "rsa".to_string(),
            algorithm: "RS256".to_string(),
            private_key_path: None,
            public_key_path: None,
            shared_secret: None,
        };
        assert!(key.load().is_err());
        key.private_key_path = Some(PathBuf::from("/nonexistent/private.pem"));
        key.public_key_path = Some(PathBuf::from("/nonexistent/public.pem"));
        let err = key.load().expect_err("missing files");
        assert!(err.to_string().contains("read private key"));
    }

    #[test]
    fn pem_files_are_read_from_disk() {
        let dir = std::env::temp_dir().join(format!("iam-config-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("dir");
        let (private_pem, public_pem) = iam_token::testutil::ed25519_pem_pair(21);
        fs::write(dir.join("k.pem"), &private_pem).expect("write");
        fs::write(dir.join("k.pub"), &public_pem).expect("write");
        let key = KeyConfig {
            id: "ed".to_string(),
            algorithm: "EdDSA".to_string(),
            private_key_path: Some(dir.join("k.pem")),
            public_key_path: Some(dir.join("k.pub")),
            shared_secret: None,
        };
        let material = key.load().expect("material");
        let ring = iam_token::KeyRing::from_material(vec![material]).expect("ring");
        assert!(ring.resolve_key("ed").is_some());
        let _ = fs::remove_dir_all(&dir);
    }

    fn test_config() -> IamConfig {
        IamConfig {
            service_name: "iam-test".to_string(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            metrics_bind: "127.0.0.1:0".parse().unwrap(),
            storage: StorageBackend::Memory,
            postgres: None,
            issuer: DEFAULT_ISSUER.to_string(),
            audience: DEFAULT_AUDIENCE.to_string(),
            key_lookup: KeyLookup::HeaderAddressed,
            session_ttl: Duration::from_secs(60),
            password_cost: MIN_COST,
            keys: vec![KeyConfig {
                id: "hs".to_string(),
                algorithm: "HS256".to_string(),
                private_key_path: None,
                public_key_path: None,
                shared_secret: Some("0123456789abcdef0123456789abcdef".to_string()),
            }],
        }
    }
}
