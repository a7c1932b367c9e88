//! Storage policies: named, typed configuration for one backend instance.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;

use crate::{HoardError, Result};

/// Backend type tag of a storage policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyType {
    Local,
    S3,
    Oss,
    Cos,
    Sftp,
    OneDrive,
}

impl PolicyType {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::Local => "local",
            PolicyType::S3 => "s3",
            PolicyType::Oss => "oss",
            PolicyType::Cos => "cos",
            PolicyType::Sftp => "sftp",
            PolicyType::OneDrive => "onedrive",
        }
    }

    /// Parse a type tag. Unknown tags are `UnsupportedPolicyType`.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(PolicyType::Local),
            "s3" => Ok(PolicyType::S3),
            "oss" => Ok(PolicyType::Oss),
            "cos" => Ok(PolicyType::Cos),
            "sftp" => Ok(PolicyType::Sftp),
            "onedrive" => Ok(PolicyType::OneDrive),
            other => Err(HoardError::UnsupportedPolicyType(other.to_string())),
        }
    }
}

impl std::fmt::Display for PolicyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local disk policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    pub root: String,
}

/// S3-compatible object store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    #[serde(default)]
    pub region: String,
}

/// Aliyun OSS configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OssConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

/// Tencent COS configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CosConfig {
    pub bucket_url: String,
    pub secret_id: String,
    pub secret_key: String,
}

/// SFTP server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub root: String,
}

fn default_sftp_port() -> u16 {
    22
}

/// Microsoft Graph (OneDrive) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneDriveConfig {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default)]
    pub root_path: String,
    /// Graph API base URL.
    #[serde(default = "default_graph_base")]
    pub graph_base: String,
    /// OAuth token endpoint.
    #[serde(default = "default_token_url")]
    pub token_url: String,
}

fn default_graph_base() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_token_url() -> String {
    "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string()
}

/// Typed configuration, one variant per backend type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Local(LocalConfig),
    S3(S3Config),
    Oss(OssConfig),
    Cos(CosConfig),
    Sftp(SftpConfig),
    OneDrive(OneDriveConfig),
}

fn decode<T: DeserializeOwned>(policy_type: PolicyType, raw: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| HoardError::InvalidPolicyConfig(format!("{policy_type}: {e}")))
}

fn require(policy_type: PolicyType, fields: &[(&str, &str)]) -> Result<()> {
    for (name, value) in fields {
        if value.trim().is_empty() {
            return Err(HoardError::InvalidPolicyConfig(format!(
                "{policy_type}: {name} is required"
            )));
        }
    }
    Ok(())
}

impl BackendConfig {
    /// Decode and validate the JSON configuration for `policy_type`.
    pub fn parse(policy_type: PolicyType, raw: &str) -> Result<Self> {
        let config = match policy_type {
            PolicyType::Local => {
                let c: LocalConfig = decode(policy_type, raw)?;
                require(policy_type, &[("root", c.root.as_str())])?;
                BackendConfig::Local(c)
            }
            PolicyType::S3 => {
                let c: S3Config = decode(policy_type, raw)?;
                require(
                    policy_type,
                    &[
                        ("endpoint", c.endpoint.as_str()),
                        ("accessKey", c.access_key.as_str()),
                        ("secretKey", c.secret_key.as_str()),
                        ("bucket", c.bucket.as_str()),
                    ],
                )?;
                BackendConfig::S3(c)
            }
            PolicyType::Oss => {
                let c: OssConfig = decode(policy_type, raw)?;
                require(
                    policy_type,
                    &[
                        ("endpoint", c.endpoint.as_str()),
                        ("accessKey", c.access_key.as_str()),
                        ("secretKey", c.secret_key.as_str()),
                        ("bucket", c.bucket.as_str()),
                    ],
                )?;
                BackendConfig::Oss(c)
            }
            PolicyType::Cos => {
                let c: CosConfig = decode(policy_type, raw)?;
                require(
                    policy_type,
                    &[
                        ("bucketUrl", c.bucket_url.as_str()),
                        ("secretId", c.secret_id.as_str()),
                        ("secretKey", c.secret_key.as_str()),
                    ],
                )?;
                BackendConfig::Cos(c)
            }
            PolicyType::Sftp => {
                let c: SftpConfig = decode(policy_type, raw)?;
                require(policy_type, &[("host", c.host.as_str()), ("user", c.user.as_str())])?;
                if c.port == 0 {
                    return Err(HoardError::InvalidPolicyConfig(
                        "sftp: port must not be 0".to_string(),
                    ));
                }
                BackendConfig::Sftp(c)
            }
            PolicyType::OneDrive => {
                let c: OneDriveConfig = decode(policy_type, raw)?;
                require(
                    policy_type,
                    &[
                        ("client_id", c.client_id.as_str()),
                        ("refresh_token", c.refresh_token.as_str()),
                    ],
                )?;
                BackendConfig::OneDrive(c)
            }
        };
        Ok(config)
    }

    /// Type tag of this configuration.
    pub fn policy_type(&self) -> PolicyType {
        match self {
            BackendConfig::Local(_) => PolicyType::Local,
            BackendConfig::S3(_) => PolicyType::S3,
            BackendConfig::Oss(_) => PolicyType::Oss,
            BackendConfig::Cos(_) => PolicyType::Cos,
            BackendConfig::Sftp(_) => PolicyType::Sftp,
            BackendConfig::OneDrive(_) => PolicyType::OneDrive,
        }
    }
}

/// A storage policy record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoragePolicy {
    /// Policy ID.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Backend type tag.
    pub policy_type: String,
    /// Type-specific configuration as JSON text.
    pub config: String,
    /// Whether this is the process-wide default.
    pub is_default: bool,
    /// 1 enabled, 0 disabled.
    pub status: i64,
    /// Optional public base URL for direct links.
    pub base_url: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl StoragePolicy {
    /// Check if the policy is enabled.
    pub fn is_enabled(&self) -> bool {
        self.status == 1
    }

    /// Decode the typed backend configuration.
    pub fn backend_config(&self) -> Result<BackendConfig> {
        BackendConfig::parse(PolicyType::parse(&self.policy_type)?, &self.config)
    }

    /// Public URL for `path` under `base_url`, if one is configured.
    pub fn public_url(&self, path: &str) -> Option<String> {
        let base = self.base_url.as_deref()?.trim();
        if base.is_empty() {
            return None;
        }
        let encoded: Vec<String> = path
            .trim_start_matches('/')
            .split('/')
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        Some(format!("{}/{}", base.trim_end_matches('/'), encoded.join("/")))
    }
}

/// Data for creating a new storage policy.
#[derive(Debug, Clone)]
pub struct NewStoragePolicy {
    pub name: String,
    pub policy_type: String,
    pub config: String,
    pub is_default: bool,
    pub base_url: Option<String>,
}

impl NewStoragePolicy {
    /// Create a policy of the given type from a JSON configuration value.
    pub fn new(name: impl Into<String>, policy_type: PolicyType, config: serde_json::Value) -> Self {
        Self::raw(name, policy_type.as_str(), config.to_string())
    }

    /// Create a local disk policy.
    pub fn local(name: impl Into<String>, root: impl Into<String>) -> Self {
        let root: String = root.into();
        Self::new(name, PolicyType::Local, serde_json::json!({ "root": root }))
    }

    /// Create a policy from an unchecked type tag and JSON text.
    ///
    /// Validation happens when the policy is resolved.
    pub fn raw(
        name: impl Into<String>,
        policy_type: impl Into<String>,
        config: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            policy_type: policy_type.into(),
            config: config.into(),
            is_default: false,
            base_url: None,
        }
    }

    /// Mark the policy as the default.
    pub fn with_default(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }

    /// Set the public base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

const POLICY_COLUMNS: &str =
    "id, name, policy_type, config, is_default, status, base_url, created_at";

/// Repository for storage policy operations.
pub struct PolicyRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> PolicyRepository<'a> {
    /// Create a new PolicyRepository with the given database pool reference.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new policy. A new default clears every other default.
    pub async fn create(&self, policy: &NewStoragePolicy) -> Result<StoragePolicy> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;

        if policy.is_default {
            sqlx::query("UPDATE storage_policies SET is_default = 0 WHERE is_default = 1")
                .execute(&mut *tx)
                .await
                .map_err(|e| HoardError::Database(e.to_string()))?;
        }

        let result = sqlx::query(
            "INSERT INTO storage_policies (name, policy_type, config, is_default, status, base_url, created_at)
             VALUES (?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&policy.name)
        .bind(&policy.policy_type)
        .bind(&policy.config)
        .bind(policy.is_default)
        .bind(&policy.base_url)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| HoardError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;

        let id = result.last_insert_rowid();
        self.get_by_id(id)
            .await?
            .ok_or_else(|| HoardError::NotFound(format!("storage policy {id}")))
    }

    /// Get a policy by ID.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<StoragePolicy>> {
        let policy = sqlx::query_as::<_, StoragePolicy>(&format!(
            "SELECT {POLICY_COLUMNS} FROM storage_policies WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| HoardError::Database(e.to_string()))?;

        Ok(policy)
    }

    /// List all policies.
    pub async fn list(&self) -> Result<Vec<StoragePolicy>> {
        let policies = sqlx::query_as::<_, StoragePolicy>(&format!(
            "SELECT {POLICY_COLUMNS} FROM storage_policies ORDER BY id"
        ))
        .fetch_all(self.pool)
        .await
        .map_err(|e| HoardError::Database(e.to_string()))?;

        Ok(policies)
    }

    /// The enabled default policy, else the first enabled policy.
    pub async fn get_default(&self) -> Result<StoragePolicy> {
        let policy = sqlx::query_as::<_, StoragePolicy>(&format!(
            "SELECT {POLICY_COLUMNS} FROM storage_policies
             WHERE status = 1
             ORDER BY is_default DESC, id ASC
             LIMIT 1"
        ))
        .fetch_optional(self.pool)
        .await
        .map_err(|e| HoardError::Database(e.to_string()))?;

        policy.ok_or_else(|| HoardError::NotFound("enabled storage policy".to_string()))
    }

    /// Make `id` the only default policy.
    pub async fn set_default(&self, id: i64) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;

        sqlx::query("UPDATE storage_policies SET is_default = 0 WHERE id != ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;

        let result = sqlx::query("UPDATE storage_policies SET is_default = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(HoardError::NotFound(format!("storage policy {id}")));
        }

        tx.commit()
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;
        info!(policy_id = id, "default storage policy changed");
        Ok(())
    }

    /// Enable or disable a policy.
    pub async fn set_status(&self, id: i64, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE storage_policies SET status = ? WHERE id = ?")
            .bind(if enabled { 1i64 } else { 0i64 })
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(HoardError::NotFound(format!("storage policy {id}")));
        }
        Ok(())
    }

    /// Replace a policy's JSON configuration.
    pub async fn update_config(&self, id: i64, config: &str) -> Result<()> {
        let result = sqlx::query("UPDATE storage_policies SET config = ? WHERE id = ?")
            .bind(config)
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| HoardError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(HoardError::NotFound(format!("storage policy {id}")));
        }
        Ok(())
    }

    /// Create a default local policy rooted at `root` when no policy exists yet.
    pub async fn ensure_default_local(&self, root: &str) -> Result<StoragePolicy> {
        if let Ok(policy) = self.get_default().await {
            return Ok(policy);
        }

        info!(root, "bootstrapping default local storage policy");
        self.create(&NewStoragePolicy::local("local", root).with_default(true))
            .await
    }
}
