use std::{path::PathBuf, sync::Arc};

use crate::catalog::Catalog;
use crate::conf::OutputConf;
use crate::error::Result;
use crate::ids::{JobId, TaskAttemptId};
use crate::target::OutputTarget;

/// Subdirectorio del área del job con los staging de cada intento.
pub const ATTEMPTS_DIR: &str = "_attempts";
/// Subdirectorio del área del job con la salida ya commiteada por tarea.
pub const COMMITTED_DIR: &str = "out";

/// Ubicaciones físicas de un destino para un intento concreto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalLocation {
    /// Staging privado del intento: `<scratch>/<job>/_attempts/<intento>/<tabla>/<k=v>`.
    pub staging_dir: PathBuf,
    /// Área del job (todavía invisible): `<scratch>/<job>/out/<tabla>/<k=v>`.
    pub holding_dir: PathBuf,
    /// Ubicación final visible según el catálogo.
    pub final_path: PathBuf,
}

/// Traduce destinos lógicos a rutas. Función pura del destino, del job y del catálogo.
#[derive(Clone)]
pub struct PartitionResolver {
    catalog: Arc<dyn Catalog>,
    scratch_dir: PathBuf,
}

impl PartitionResolver {
    pub fn new(catalog: Arc<dyn Catalog>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            catalog,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn from_conf(catalog: Arc<dyn Catalog>, conf: &OutputConf) -> Self {
        Self::new(catalog, conf.scratch_dir.clone())
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Área del job donde se acumula la salida commiteada de las tareas.
    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.scratch_dir.join(job_id.as_str())
    }

    pub fn attempt_dir(&self, attempt: &TaskAttemptId) -> PathBuf {
        self.job_dir(attempt.job_id())
            .join(ATTEMPTS_DIR)
            .join(attempt.to_string())
    }

    pub fn holding_dir(&self, job_id: &JobId, target: &OutputTarget) -> PathBuf {
        self.job_dir(job_id).join(COMMITTED_DIR).join(target.rel_path())
    }

    /// Falla con `UnresolvableTarget` si el catálogo no acepta el destino.
    pub fn resolve(
        &self,
        target: &OutputTarget,
        attempt: &TaskAttemptId,
    ) -> Result<PhysicalLocation> {
        let final_path = self.catalog.resolve_partition_location(target)?;
        Ok(PhysicalLocation {
            staging_dir: self.attempt_dir(attempt).join(target.rel_path()),
            holding_dir: self.holding_dir(attempt.job_id(), target),
            final_path,
        })
    }
}
