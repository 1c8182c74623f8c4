//! Capa de commit de salida: las tareas escriben en staging privado y un job
//! publica todas sus particiones de una vez, o nada.

pub mod catalog;
pub mod conf;
pub mod context;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod ids;
pub mod job;
pub mod records;
pub mod resolver;
pub mod target;
pub mod writer;

pub use catalog::{Catalog, FsCatalog, PublishRequest};
pub use conf::{keys, Configuration, OutputConf, OverwritePolicy};
pub use context::{ContextFactory, JobContext, TaskContext};
pub use coordinator::{JobCommitState, OutputCommitCoordinator, RecoveryOutcome, TaskCommitState};
pub use error::{CommitError, Result};
pub use ids::{JobId, TaskAttemptId, TaskId};
pub use job::{JobReport, JobStatus};
pub use records::{Record, Records};
pub use resolver::{PartitionResolver, PhysicalLocation};
pub use target::{OutputTarget, PartitionSpec};
pub use writer::{StagedOutput, TaskOutputWriter};
