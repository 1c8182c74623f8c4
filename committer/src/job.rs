use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Committed,
    Aborted,
}

/// Resumen de una corrida: qué se publicó y cuánto costó llegar ahí.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Causa del abort, si lo hubo
    pub error: Option<String>,
    /// Destino en formato `tabla[k=v]`
    pub target: Option<String>,

    /// -------- Métricas del job --------
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_tasks: u32,
    pub committed_tasks: u32,
    pub failed_attempts: u32,
    pub retries: u32,
    pub speculative_losers: u32,
    /// Veces que se llamó a commit_job (1 si no hubo errores transitorios)
    pub commit_attempts: u32,
    pub records_written: u64,
}

impl JobReport {
    pub fn new(job_id: JobId, target: Option<String>, total_tasks: u32) -> Self {
        Self {
            job_id,
            status: JobStatus::Aborted,
            error: None,
            target,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            total_tasks,
            committed_tasks: 0,
            failed_attempts: 0,
            retries: 0,
            speculative_losers: 0,
            commit_attempts: 0,
            records_written: 0,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.status == JobStatus::Committed
    }
}
