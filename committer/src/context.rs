//! Construcción de contextos de job y de tarea.
//!
//! El framework anfitrión expone sus contextos con dos formas distintas según la
//! versión desplegada: structs concretos que se construyen directamente, o traits
//! que exigen un tipo concreto privado. La forma activa se elige al compilar con la
//! feature `interface-contexts`, para el contexto de job y para el de intento; el
//! resto del crate sólo ve [`JobContext`] y [`TaskContext`].

use std::sync::Arc;

use crate::conf::{Configuration, OutputConf};
use crate::error::Result;
use crate::ids::{JobId, TaskAttemptId};

#[cfg(feature = "interface-contexts")]
use host::{HostJobContext as _, HostTaskAttemptContext as _};

/* =========================
   Forma "clase concreta"
   ========================= */

#[cfg(not(feature = "interface-contexts"))]
mod host {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct HostJobContext {
        conf: Arc<Configuration>,
        job_id: JobId,
    }

    impl HostJobContext {
        pub fn new(conf: Arc<Configuration>, job_id: JobId) -> Self {
            Self { conf, job_id }
        }

        pub fn configuration(&self) -> &Arc<Configuration> {
            &self.conf
        }

        pub fn job_id(&self) -> &JobId {
            &self.job_id
        }
    }

    pub type JobHandle = HostJobContext;

    pub fn job_handle(conf: Arc<Configuration>, job_id: JobId) -> JobHandle {
        HostJobContext::new(conf, job_id)
    }

    #[derive(Debug, Clone)]
    pub struct HostTaskAttemptContext {
        job: JobHandle,
        attempt_id: TaskAttemptId,
    }

    impl HostTaskAttemptContext {
        pub fn new(job: JobHandle, attempt_id: TaskAttemptId) -> Self {
            Self { job, attempt_id }
        }

        pub fn job(&self) -> &JobHandle {
            &self.job
        }

        pub fn attempt_id(&self) -> &TaskAttemptId {
            &self.attempt_id
        }
    }

    pub type TaskHandle = HostTaskAttemptContext;

    pub fn task_handle(job: JobHandle, attempt_id: TaskAttemptId) -> TaskHandle {
        HostTaskAttemptContext::new(job, attempt_id)
    }
}

/* =========================
   Forma "interfaz"
   ========================= */

#[cfg(feature = "interface-contexts")]
mod host {
    use super::*;

    pub trait HostJobContext: std::fmt::Debug + Send + Sync {
        fn configuration(&self) -> &Arc<Configuration>;
        fn job_id(&self) -> &JobId;
    }

    /// Implementación privada exigida por la forma interfaz.
    #[derive(Debug)]
    struct JobContextImpl {
        conf: Arc<Configuration>,
        job_id: JobId,
    }

    impl HostJobContext for JobContextImpl {
        fn configuration(&self) -> &Arc<Configuration> {
            &self.conf
        }

        fn job_id(&self) -> &JobId {
            &self.job_id
        }
    }

    pub type JobHandle = Arc<dyn HostJobContext>;

    pub fn job_handle(conf: Arc<Configuration>, job_id: JobId) -> JobHandle {
        Arc::new(JobContextImpl { conf, job_id })
    }

    pub trait HostTaskAttemptContext: std::fmt::Debug + Send + Sync {
        fn job(&self) -> &JobHandle;
        fn attempt_id(&self) -> &TaskAttemptId;
    }

    #[derive(Debug)]
    struct TaskAttemptContextImpl {
        job: JobHandle,
        attempt_id: TaskAttemptId,
    }

    impl HostTaskAttemptContext for TaskAttemptContextImpl {
        fn job(&self) -> &JobHandle {
            &self.job
        }

        fn attempt_id(&self) -> &TaskAttemptId {
            &self.attempt_id
        }
    }

    pub type TaskHandle = Arc<dyn HostTaskAttemptContext>;

    pub fn task_handle(job: JobHandle, attempt_id: TaskAttemptId) -> TaskHandle {
        Arc::new(TaskAttemptContextImpl { job, attempt_id })
    }
}

/// Snapshot de configuración + JobId. Las tareas lo comparten en sólo lectura.
#[derive(Debug, Clone)]
pub struct JobContext {
    inner: host::JobHandle,
}

impl JobContext {
    pub fn job_id(&self) -> &JobId {
        self.inner.job_id()
    }

    pub fn configuration(&self) -> &Configuration {
        self.inner.configuration()
    }

    pub fn output_conf(&self) -> Result<OutputConf> {
        OutputConf::from_conf(self.configuration())
    }
}

/// JobContext + el intento que lo usa. Cada intento tiene el suyo.
#[derive(Debug, Clone)]
pub struct TaskContext {
    job: JobContext,
    inner: host::TaskHandle,
}

impl TaskContext {
    pub fn job(&self) -> &JobContext {
        &self.job
    }

    pub fn job_id(&self) -> &JobId {
        self.job.job_id()
    }

    pub fn attempt_id(&self) -> &TaskAttemptId {
        self.inner.attempt_id()
    }

    pub fn configuration(&self) -> &Configuration {
        self.job.configuration()
    }
}

/// Único punto de construcción de contextos.
pub struct ContextFactory;

impl ContextFactory {
    /// Contexto de job con un JobId recién acuñado.
    pub fn make_job_context(conf: Configuration) -> JobContext {
        Self::make_job_context_with_id(conf, JobId::new())
    }

    /// Igual que [`make_job_context`](Self::make_job_context) con configuración por defecto.
    pub fn make_default_job_context() -> JobContext {
        Self::make_job_context(Configuration::default())
    }

    pub fn make_job_context_with_id(conf: Configuration, job_id: JobId) -> JobContext {
        JobContext {
            inner: host::job_handle(Arc::new(conf), job_id),
        }
    }

    /// Contexto de tarea con job e intento recién acuñados.
    pub fn make_task_context(conf: Configuration) -> TaskContext {
        let job = Self::make_job_context(conf);
        let attempt_id = TaskAttemptId::first(job.job_id().clone(), 0);
        Self::make_task_context_for(&job, attempt_id)
    }

    pub fn make_default_task_context() -> TaskContext {
        Self::make_task_context(Configuration::default())
    }

    /// Contexto para un intento concreto de un job existente.
    pub fn make_task_context_for(job: &JobContext, attempt_id: TaskAttemptId) -> TaskContext {
        TaskContext {
            job: job.clone(),
            inner: host::task_handle(job.inner.clone(), attempt_id),
        }
    }
}
