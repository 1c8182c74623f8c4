use thiserror::Error;

/// Taxonomía de errores del protocolo de commit.
///
/// - errores de tarea (`StagingIo`, `WriterClosed`, `ConflictingAttempt`): se resuelven
///   reintentando el intento completo con una identidad nueva
/// - errores transitorios de job (`CommitTimeout`, `CatalogUnavailable`): el driver los
///   reintenta hasta un límite y después aborta el job
/// - el resto son fatales para el job
#[derive(Debug, Error)]
pub enum CommitError {
    /// No se pudo construir un contexto. Con configuración válida no debería pasar nunca.
    #[error("no se pudo construir el contexto: {0}")]
    ContextConstruction(String),

    /// Tabla o especificación de partición inválida según el catálogo.
    #[error("destino irresoluble {target}: {reason}")]
    UnresolvableTarget { target: String, reason: String },

    /// Escritura sobre un writer ya cerrado o abandonado.
    #[error("el writer del intento {attempt} ya está cerrado")]
    WriterClosed { attempt: String },

    /// Fallo de E/S en el área de staging.
    #[error("error de E/S en staging: {0}")]
    StagingIo(#[from] std::io::Error),

    /// La partición destino ya existe y la política es fallar.
    #[error("la partición {target} ya fue publicada")]
    AlreadyCommitted { target: String },

    /// El staging del job desapareció y la ubicación final no tiene sus datos.
    #[error("la salida de {target} se perdió antes de publicarse")]
    OutputLost { target: String },

    #[error("timeout durante el commit: {0}")]
    CommitTimeout(String),

    #[error("catálogo no disponible: {0}")]
    CatalogUnavailable(String),

    /// Operación no permitida en el estado actual del job.
    #[error("operación {op} inválida con el job en estado {state}")]
    InvalidJobState { op: &'static str, state: String },

    /// Otro intento de la misma tarea lógica ya reclamó el commit.
    #[error("la tarea {task} ya fue commiteada por el intento {winner}; se rechaza {attempt}")]
    ConflictingAttempt {
        task: String,
        winner: String,
        attempt: String,
    },

    /// El intento fue descartado (abortTask/abortJob) mientras intentaba commitear.
    #[error("el intento {0} fue descartado")]
    AttemptDiscarded(String),

    /// commitJob invocado antes de que todas las tareas terminaran.
    #[error("tareas sin commit: {0:?}")]
    IncompleteTasks(Vec<String>),

    #[error("el job {0} fue abortado")]
    JobAborted(String),

    #[error("configuración inválida: {0}")]
    InvalidConfig(String),
}

impl CommitError {
    /// Errores que justifican reintentar la misma operación.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CommitError::StagingIo(_)
                | CommitError::CommitTimeout(_)
                | CommitError::CatalogUnavailable(_)
        )
    }

    /// Errores cuyo alcance es un único intento de tarea.
    pub fn is_task_scoped(&self) -> bool {
        matches!(
            self,
            CommitError::StagingIo(_)
                | CommitError::WriterClosed { .. }
                | CommitError::ConflictingAttempt { .. }
                | CommitError::AttemptDiscarded(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CommitError>;
