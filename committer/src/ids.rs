//! Identificadores de job, tarea lógica e intento de tarea.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CommitError, Result};

const JOB_PREFIX: &str = "job_";

/// Identificador único de una ejecución de job. Nunca se reutiliza.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Acuña un id nuevo: `job_<yyyymmddHHMM>_<uuid>`.
    pub fn new() -> Self {
        let stamp = Utc::now().format("%Y%m%d%H%M");
        let uid = uuid::Uuid::new_v4().simple();
        JobId(format!("{JOB_PREFIX}{stamp}_{uid}"))
    }

    /// Reconstruye un id existente (por ejemplo, para recuperar un job tras un crash).
    pub fn parse(raw: &str) -> Result<Self> {
        let valid = raw.starts_with(JOB_PREFIX)
            && raw.len() > JOB_PREFIX.len()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(CommitError::InvalidConfig(format!("job id inválido: {raw}")));
        }
        Ok(JobId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn suffix(&self) -> &str {
        self.0.strip_prefix(JOB_PREFIX).unwrap_or(&self.0)
    }
}

impl Default for JobId {
    fn default() -> Self {
        JobId::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tarea lógica dentro de un job. Puede tener varios intentos.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub job_id: JobId,
    pub index: u32,
}

impl TaskId {
    pub fn new(job_id: JobId, index: u32) -> Self {
        Self { job_id, index }
    }

    /// Nombre de directorio estable para la salida commiteada de esta tarea.
    pub fn dir_name(&self) -> String {
        format!("task_{:06}", self.index)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task_{}_m_{:06}", self.job_id.suffix(), self.index)
    }
}

/// Un intento concreto de ejecución de una tarea lógica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskAttemptId {
    pub task_id: TaskId,
    pub attempt: u32,
}

impl TaskAttemptId {
    pub fn new(task_id: TaskId, attempt: u32) -> Self {
        Self { task_id, attempt }
    }

    /// Intento 0 de la tarea `index` del job.
    pub fn first(job_id: JobId, index: u32) -> Self {
        Self::new(TaskId::new(job_id, index), 0)
    }

    /// Identidad del siguiente reintento de la misma tarea lógica.
    pub fn next_attempt(&self) -> Self {
        Self::new(self.task_id.clone(), self.attempt + 1)
    }

    pub fn job_id(&self) -> &JobId {
        &self.task_id.job_id
    }
}

impl fmt::Display for TaskAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempt_{}_m_{:06}_{}",
            self.task_id.job_id.suffix(),
            self.task_id.index,
            self.attempt
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_nuevos_no_se_repiten() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("job_"));
    }

    #[test]
    fn parse_acepta_ids_acuñados_y_rechaza_basura() {
        let id = JobId::new();
        assert_eq!(JobId::parse(id.as_str()).unwrap(), id);
        assert!(JobId::parse("job_").is_err());
        assert!(JobId::parse("job_../../etc").is_err());
        assert!(JobId::parse("otra_cosa").is_err());
    }

    #[test]
    fn next_attempt_mantiene_la_tarea_logica() {
        let first = TaskAttemptId::first(JobId::new(), 3);
        let retry = first.next_attempt();
        assert_eq!(retry.task_id, first.task_id);
        assert_eq!(retry.attempt, 1);
        assert_ne!(retry, first);
        assert!(retry.to_string().ends_with("_m_000003_1"));
    }
}
