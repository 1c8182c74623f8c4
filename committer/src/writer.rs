use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::PathBuf,
};
use tracing::debug;

use crate::context::TaskContext;
use crate::error::{CommitError, Result};
use crate::ids::TaskAttemptId;
use crate::records::{Record, PART_FILE_PREFIX};
use crate::resolver::PartitionResolver;
use crate::target::OutputTarget;

/// Un archivo de staging cerrado por un writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub target: OutputTarget,
    pub path: PathBuf,
    pub records: u64,
}

/// Todo lo que un intento dejó en su staging antes del commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedOutput {
    pub attempt: TaskAttemptId,
    pub files: Vec<StagedFile>,
}

impl StagedOutput {
    pub fn empty(attempt: TaskAttemptId) -> Self {
        Self {
            attempt,
            files: Vec::new(),
        }
    }

    pub fn records(&self) -> u64 {
        self.files.iter().map(|f| f.records).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records() == 0
    }

    /// Destinos distintos con datos, en orden.
    pub fn targets(&self) -> Vec<OutputTarget> {
        let mut out: Vec<OutputTarget> = self.files.iter().map(|f| f.target.clone()).collect();
        out.sort();
        out.dedup();
        out
    }

    /// Junta la salida de otro writer del mismo intento.
    pub fn merge(&mut self, other: StagedOutput) -> Result<()> {
        if other.attempt != self.attempt {
            return Err(CommitError::ConflictingAttempt {
                task: self.attempt.task_id.to_string(),
                winner: self.attempt.to_string(),
                attempt: other.attempt.to_string(),
            });
        }
        self.files.extend(other.files);
        Ok(())
    }
}

enum WriterState {
    Open(BufWriter<File>),
    Closed,
    Abandoned,
}

/// Writer de un intento hacia un destino. Escribe JSONL en el staging del intento;
/// nada es visible fuera de ese staging hasta el commit.
pub struct TaskOutputWriter {
    attempt: TaskAttemptId,
    target: OutputTarget,
    path: PathBuf,
    state: WriterState,
    records: u64,
}

impl TaskOutputWriter {
    pub fn open(
        ctx: &TaskContext,
        target: &OutputTarget,
        resolver: &PartitionResolver,
    ) -> Result<Self> {
        let attempt = ctx.attempt_id().clone();
        let loc = resolver.resolve(target, &attempt)?;
        fs::create_dir_all(&loc.staging_dir)?;

        let path = loc.staging_dir.join(format!(
            "{PART_FILE_PREFIX}{:06}-{}.jsonl",
            attempt.task_id.index, attempt.attempt
        ));
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;

        debug!("writer abierto para {} en {}", attempt, path.display());

        Ok(Self {
            attempt,
            target: target.clone(),
            path,
            state: WriterState::Open(BufWriter::new(file)),
            records: 0,
        })
    }

    pub fn target(&self) -> &OutputTarget {
        &self.target
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn write(&mut self, record: &Record) -> Result<()> {
        let WriterState::Open(writer) = &mut self.state else {
            return Err(self.closed_error());
        };
        serde_json::to_writer(&mut *writer, record).map_err(io::Error::from)?;
        writer.write_all(b"\n")?;
        self.records += 1;
        Ok(())
    }

    /// Vacía y sincroniza el archivo. El resultado sigue siendo privado del intento.
    pub fn close(&mut self) -> Result<StagedOutput> {
        match std::mem::replace(&mut self.state, WriterState::Closed) {
            WriterState::Open(writer) => {
                let file = writer.into_inner().map_err(|e| e.into_error())?;
                file.sync_all()?;
                Ok(StagedOutput {
                    attempt: self.attempt.clone(),
                    files: vec![StagedFile {
                        target: self.target.clone(),
                        path: self.path.clone(),
                        records: self.records,
                    }],
                })
            }
            previous => {
                self.state = previous;
                Err(self.closed_error())
            }
        }
    }

    /// Descarta lo escrito. Se puede llamar varias veces.
    pub fn abandon(&mut self) -> Result<()> {
        self.state = WriterState::Abandoned;
        self.records = 0;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn closed_error(&self) -> CommitError {
        CommitError::WriterClosed {
            attempt: self.attempt.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FsCatalog;
    use crate::conf::Configuration;
    use crate::context::ContextFactory;
    use crate::ids::TaskAttemptId;
    use crate::records::read_jsonl;
    use serde_json::json;
    use std::sync::Arc;

    fn setup(sub: &str) -> (PartitionResolver, TaskContext) {
        let base = std::env::temp_dir()
            .join("writer_tests")
            .join(format!("{sub}_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&base).unwrap();
        let cat = FsCatalog::open(base.join("wh")).unwrap();
        cat.create_table("t1", &[]).unwrap();
        let resolver = PartitionResolver::new(Arc::new(cat), base.join("scratch"));

        let job = ContextFactory::make_job_context(Configuration::new());
        let ctx = ContextFactory::make_task_context_for(
            &job,
            TaskAttemptId::first(job.job_id().clone(), 2),
        );
        (resolver, ctx)
    }

    #[test]
    fn close_devuelve_staged_output_con_los_registros() {
        let (resolver, ctx) = setup("close");
        let target = OutputTarget::unpartitioned("t1").unwrap();
        let mut w = TaskOutputWriter::open(&ctx, &target, &resolver).unwrap();

        w.write(&json!({"i1": 1, "i2": 1})).unwrap();
        w.write(&json!({"i1": 2, "i2": 2})).unwrap();
        let staged = w.close().unwrap();

        assert_eq!(staged.attempt, *ctx.attempt_id());
        assert_eq!(staged.records(), 2);
        assert_eq!(staged.targets(), vec![target.clone()]);
        assert_eq!(read_jsonl(&staged.files[0].path).unwrap().len(), 2);

        // nada visible en la ubicación final
        let loc = resolver.resolve(&target, ctx.attempt_id()).unwrap();
        assert!(!loc.final_path.exists());
    }

    #[test]
    fn escribir_despues_de_close_o_abandon_falla() {
        let (resolver, ctx) = setup("closed");
        let target = OutputTarget::unpartitioned("t1").unwrap();

        let mut w = TaskOutputWriter::open(&ctx, &target, &resolver).unwrap();
        w.close().unwrap();
        assert!(matches!(w.write(&json!({})), Err(CommitError::WriterClosed { .. })));
        assert!(matches!(w.close(), Err(CommitError::WriterClosed { .. })));

        let retry =
            ContextFactory::make_task_context_for(ctx.job(), ctx.attempt_id().next_attempt());
        let mut w = TaskOutputWriter::open(&retry, &target, &resolver).unwrap();
        w.abandon().unwrap();
        assert!(matches!(w.write(&json!({})), Err(CommitError::WriterClosed { .. })));
    }

    #[test]
    fn abandon_borra_lo_escrito_y_es_idempotente() {
        let (resolver, ctx) = setup("abandon");
        let target = OutputTarget::unpartitioned("t1").unwrap();
        let mut w = TaskOutputWriter::open(&ctx, &target, &resolver).unwrap();
        w.write(&json!({"i1": 1})).unwrap();

        w.abandon().unwrap();
        w.abandon().unwrap();

        let loc = resolver.resolve(&target, ctx.attempt_id()).unwrap();
        assert!(crate::records::read_dir_records(&loc.staging_dir).unwrap().is_empty());
        assert_eq!(w.records_written(), 0);
    }

    #[test]
    fn open_con_destino_irresoluble_falla_antes_de_escribir() {
        let (resolver, ctx) = setup("irresoluble");
        let target = OutputTarget::unpartitioned("desconocida").unwrap();
        assert!(matches!(
            TaskOutputWriter::open(&ctx, &target, &resolver),
            Err(CommitError::UnresolvableTarget { .. })
        ));
    }

    #[test]
    fn merge_rechaza_salida_de_otro_intento() {
        let attempt = TaskAttemptId::first(crate::ids::JobId::new(), 0);
        let mut a = StagedOutput::empty(attempt.clone());
        assert!(a.merge(StagedOutput::empty(attempt.clone())).is_ok());
        assert!(a.merge(StagedOutput::empty(attempt.next_attempt())).is_err());
    }
}
