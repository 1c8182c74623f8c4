use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::{CommitError, Result};
use crate::target::PartitionSpec;

/// Claves conocidas de configuración.
pub mod keys {
    /// Tabla destino del job.
    pub const OUTPUT_TABLE: &str = "output.table";
    /// Partición destino, formato `k1=v1,k2=v2`. Vacío = tabla sin particiones.
    pub const OUTPUT_PARTITION: &str = "output.partition";
    /// `fail` (por defecto) u `overwrite`.
    pub const OUTPUT_OVERWRITE: &str = "output.overwrite";
    pub const WAREHOUSE_DIR: &str = "output.warehouse_dir";
    pub const SCRATCH_DIR: &str = "output.scratch_dir";
    pub const NUM_TASKS: &str = "job.num_tasks";
    pub const MAX_TASK_ATTEMPTS: &str = "job.max_task_attempts";
    pub const SPECULATIVE: &str = "job.speculative";
    pub const COMMIT_MAX_RETRIES: &str = "commit.max_retries";
    pub const COMMIT_RETRY_BACKOFF_MS: &str = "commit.retry_backoff_ms";

    pub const ALL: &[&str] = &[
        OUTPUT_TABLE,
        OUTPUT_PARTITION,
        OUTPUT_OVERWRITE,
        WAREHOUSE_DIR,
        SCRATCH_DIR,
        NUM_TASKS,
        MAX_TASK_ATTEMPTS,
        SPECULATIVE,
        COMMIT_MAX_RETRIES,
        COMMIT_RETRY_BACKOFF_MS,
    ];
}

const ENV_PREFIX: &str = "OUTCOMMIT_";

pub const DEFAULT_WAREHOUSE_DIR: &str = "/data/warehouse";
pub const DEFAULT_MAX_TASK_ATTEMPTS: u32 = 3;
pub const DEFAULT_COMMIT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_COMMIT_RETRY_BACKOFF_MS: u64 = 200;

/// Configuración clave→valor del framework anfitrión.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    entries: BTreeMap<String, String>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuración vacía con las variables `OUTCOMMIT_*` aplicadas encima.
    pub fn from_env() -> Self {
        let mut conf = Self::new();
        conf.overlay_env();
        conf
    }

    /// Lee un objeto JSON plano `{"clave": "valor"}`.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&raw).map_err(|e| {
            CommitError::InvalidConfig(format!("{}: {e}", path.as_ref().display()))
        })
    }

    /// Cada clave conocida puede sobreescribirse con una env var,
    /// ej: `output.warehouse_dir` -> `OUTCOMMIT_OUTPUT_WAREHOUSE_DIR`.
    pub fn overlay_env(&mut self) {
        for key in keys::ALL {
            if let Ok(v) = std::env::var(env_var_for(key)) {
                self.set(*key, v);
            }
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        self.parse_with(key, |v| v.parse::<u32>().ok())
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        self.parse_with(key, |v| v.parse::<u64>().ok())
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        self.parse_with(key, |v| match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        })
    }

    fn parse_with<T>(&self, key: &str, f: impl Fn(&str) -> Option<T>) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => f(raw.trim()).map(Some).ok_or_else(|| {
                CommitError::InvalidConfig(format!("valor inválido para {key}: {raw:?}"))
            }),
        }
    }
}

fn env_var_for(key: &str) -> String {
    format!("{ENV_PREFIX}{}", key.replace('.', "_").to_uppercase())
}

/// Qué hacer si la partición destino ya existe al publicar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    #[default]
    Fail,
    Overwrite,
}

impl OverwritePolicy {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(OverwritePolicy::Fail),
            "overwrite" => Ok(OverwritePolicy::Overwrite),
            other => Err(CommitError::InvalidConfig(format!(
                "{} debe ser fail u overwrite, no {other:?}",
                keys::OUTPUT_OVERWRITE
            ))),
        }
    }
}

/// Vista tipada y validada de las claves de salida y commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConf {
    pub table: Option<String>,
    pub partition: PartitionSpec,
    pub overwrite: OverwritePolicy,
    pub warehouse_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub num_tasks: Option<u32>,
    pub max_task_attempts: u32,
    pub speculative: bool,
    pub commit_max_retries: u32,
    pub commit_retry_backoff: Duration,
}

impl OutputConf {
    pub fn from_conf(conf: &Configuration) -> Result<Self> {
        let warehouse_dir =
            PathBuf::from(conf.get(keys::WAREHOUSE_DIR).unwrap_or(DEFAULT_WAREHOUSE_DIR));
        let scratch_dir = conf
            .get(keys::SCRATCH_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| warehouse_dir.join("_scratch"));

        let partition = match conf.get(keys::OUTPUT_PARTITION) {
            Some(raw) => PartitionSpec::parse(raw)?,
            None => PartitionSpec::default(),
        };

        let overwrite = match conf.get(keys::OUTPUT_OVERWRITE) {
            Some(raw) => OverwritePolicy::parse(raw)?,
            None => OverwritePolicy::default(),
        };

        let max_task_attempts = conf
            .get_u32(keys::MAX_TASK_ATTEMPTS)?
            .unwrap_or(DEFAULT_MAX_TASK_ATTEMPTS)
            .max(1);

        Ok(Self {
            table: conf.get(keys::OUTPUT_TABLE).map(str::to_string),
            partition,
            overwrite,
            warehouse_dir,
            scratch_dir,
            num_tasks: conf.get_u32(keys::NUM_TASKS)?,
            max_task_attempts,
            speculative: conf.get_bool(keys::SPECULATIVE)?.unwrap_or(false),
            commit_max_retries: conf
                .get_u32(keys::COMMIT_MAX_RETRIES)?
                .unwrap_or(DEFAULT_COMMIT_MAX_RETRIES),
            commit_retry_backoff: Duration::from_millis(
                conf.get_u64(keys::COMMIT_RETRY_BACKOFF_MS)?
                    .unwrap_or(DEFAULT_COMMIT_RETRY_BACKOFF_MS),
            ),
        })
    }
}
