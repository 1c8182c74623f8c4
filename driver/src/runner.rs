//! Driver de un job: reparte la entrada, corre los intentos de tarea en paralelo,
//! reintenta los que fallan y conduce el commit del job.

use anyhow::Result;
use chrono::Utc;
use committer::{
    engine::{self, Edge},
    keys, Catalog, CommitError, Configuration, ContextFactory, JobContext, JobReport, JobStatus,
    OutputCommitCoordinator, OutputConf, OutputTarget, RecoveryOutcome, TaskAttemptId,
    TaskContext, TaskOutputWriter,
};
use std::{env, sync::Arc, time::Duration};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info, warn};

const DEFAULT_WORKER_CONCURRENCY: usize = 2;
pub const DEFAULT_NUM_TASKS: u32 = 2;

/// Hook llamado al empezar cada intento, antes de preparar su staging; un error
/// hace fallar el intento. Sirve para inyectar fallos y demoras.
pub type TaskHook = Arc<dyn Fn(&TaskAttemptId) -> committer::Result<()> + Send + Sync>;

/// Cuántas tareas corren a la vez. Se puede sobreescribir con WORKER_CONCURRENCY.
fn worker_concurrency() -> usize {
    env::var("WORKER_CONCURRENCY")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_WORKER_CONCURRENCY)
}

/// Contadores de una tarea lógica, sumados al JobReport al final.
#[derive(Debug, Default)]
struct TaskStats {
    committed: bool,
    records: u64,
    failed_attempts: u32,
    retries: u32,
    speculative_losers: u32,
    error: Option<String>,
}

enum AttemptResult {
    Won(u64),
    Lost,
    Failed(CommitError),
}

pub struct JobRunner {
    catalog: Arc<dyn Catalog>,
    conf: Configuration,
    concurrency: usize,
    hook: Option<TaskHook>,
}

impl JobRunner {
    pub fn new(catalog: Arc<dyn Catalog>, conf: Configuration) -> Self {
        Self {
            catalog,
            conf,
            concurrency: worker_concurrency(),
            hook: None,
        }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn with_task_hook(mut self, hook: TaskHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Corre el conteo de grado de salida sobre `edges` y publica el resultado en
    /// el destino configurado.
    ///
    /// Devuelve `Err` sólo si el job no pudo arrancar (configuración o destino
    /// inválidos). Cualquier fallo posterior termina en un reporte `Aborted`.
    pub async fn run(&self, edges: Vec<Edge>) -> Result<JobReport> {
        let mut conf = self.conf.clone();
        let num_tasks = match conf.get_u32(keys::NUM_TASKS)? {
            Some(n) if n > 0 => n,
            _ => DEFAULT_NUM_TASKS,
        };
        conf.set(keys::NUM_TASKS, num_tasks.to_string());

        let output = OutputConf::from_conf(&conf)?;
        let target = OutputTarget::from_conf(&output)?;
        let job = ContextFactory::make_job_context(conf);
        let coord = Arc::new(OutputCommitCoordinator::new(&job, self.catalog.clone())?);

        let mut report = JobReport::new(job.job_id().clone(), Some(target.to_string()), num_tasks);
        info!("job {} -> {} ({} tareas)", job.job_id(), target, num_tasks);

        coord.setup_job(&job)?;
        report.started_at = Some(Utc::now());

        // --------- Fase de tareas ---------
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (index, shard) in engine::split_edges(&edges, num_tasks).into_iter().enumerate() {
            let sem = sem.clone();
            let coord = coord.clone();
            let job = job.clone();
            let target = target.clone();
            let hook = self.hook.clone();
            let speculative = output.speculative;
            let max_attempts = output.max_task_attempts;

            tasks.spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return TaskStats {
                        error: Some("job abortado antes de empezar la tarea".to_string()),
                        ..Default::default()
                    };
                };
                run_task(
                    coord,
                    job,
                    target,
                    index as u32,
                    Arc::new(shard),
                    hook,
                    speculative,
                    max_attempts,
                )
                .await
            });
        }

        // la primera tarea que agota sus intentos aborta el job sin esperar al resto
        let mut task_error = None;
        while let Some(joined) = tasks.join_next().await {
            let stats = joined.unwrap_or_else(|e| TaskStats {
                error: Some(format!("join error: {e}")),
                ..Default::default()
            });
            report.failed_attempts += stats.failed_attempts;
            report.retries += stats.retries;
            report.speculative_losers += stats.speculative_losers;
            report.records_written += stats.records;
            if stats.committed {
                report.committed_tasks += 1;
                continue;
            }

            let err = stats.error.unwrap_or_else(|| "tarea sin commit".to_string());
            warn!("job {}: una tarea agotó sus intentos ({err}); se aborta", job.job_id());
            sem.close();
            tasks.abort_all();
            abort(&coord, &job).await;
            while tasks.join_next().await.is_some() {}
            task_error = Some(err);
            break;
        }

        if let Some(err) = task_error {
            return Ok(finish(report, JobStatus::Aborted, Some(err)));
        }

        // --------- Commit del job ---------
        let status = commit_with_retry(&coord, &job, &output, &mut report).await;
        Ok(match status {
            Ok(()) => finish(report, JobStatus::Committed, None),
            Err(e) => finish(report, JobStatus::Aborted, Some(e.to_string())),
        })
    }

    /// Retoma un job interrumpido a partir de lo que dejó en disco.
    pub async fn recover(&self, job_id: committer::JobId) -> Result<RecoveryOutcome> {
        let job = ContextFactory::make_job_context_with_id(self.conf.clone(), job_id);
        let coord = OutputCommitCoordinator::new(&job, self.catalog.clone())?;
        let outcome = tokio::task::spawn_blocking(move || coord.recover_job(&job)).await??;
        Ok(outcome)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task(
    coord: Arc<OutputCommitCoordinator>,
    job: JobContext,
    target: OutputTarget,
    index: u32,
    shard: Arc<Vec<Edge>>,
    hook: Option<TaskHook>,
    speculative: bool,
    max_attempts: u32,
) -> TaskStats {
    let mut stats = TaskStats::default();
    let mut next = TaskAttemptId::first(job.job_id().clone(), index);

    for round in 0..max_attempts {
        // en la primera ronda se lanza un duplicado especulativo si está activado
        let mut ids = vec![next.clone()];
        if speculative && round == 0 {
            ids.push(next.next_attempt());
        }
        next = ids[ids.len() - 1].next_attempt();
        if round > 0 {
            stats.retries += 1;
            info!("reintentando task_{index:06} con {}", ids[0]);
        }

        let mut pending = Vec::new();
        for id in ids {
            let ctx = ContextFactory::make_task_context_for(&job, id);
            let coord = coord.clone();
            let target = target.clone();
            let shard = shard.clone();
            let hook = hook.clone();
            pending.push(tokio::task::spawn_blocking(move || {
                let res = run_attempt(&coord, &ctx, &target, &shard, hook.as_ref());
                settle(&coord, &ctx, res)
            }));
        }

        let mut last_error = None;
        for handle in pending {
            match handle.await {
                Ok(AttemptResult::Won(records)) => {
                    stats.committed = true;
                    stats.records = records;
                }
                Ok(AttemptResult::Lost) => stats.speculative_losers += 1,
                Ok(AttemptResult::Failed(e)) => {
                    stats.failed_attempts += 1;
                    last_error = Some(e);
                }
                Err(e) => {
                    stats.failed_attempts += 1;
                    warn!("panic o join error en task_{index:06}: {e}");
                }
            }
        }

        if stats.committed {
            return stats;
        }
        if let Some(e) = &last_error {
            if matches!(e, CommitError::JobAborted(_)) {
                stats.error = Some(e.to_string());
                return stats;
            }
        }
        stats.error = last_error.map(|e| e.to_string());
    }

    stats
}

/// Un intento completo: staging, escritura, commit de tarea.
fn run_attempt(
    coord: &OutputCommitCoordinator,
    ctx: &TaskContext,
    target: &OutputTarget,
    shard: &[Edge],
    hook: Option<&TaskHook>,
) -> committer::Result<u64> {
    if let Some(h) = hook {
        (**h)(ctx.attempt_id())?;
    }
    coord.setup_task(ctx)?;
    let records = engine::count_out_edges(shard);

    if records.is_empty() {
        coord.skip_task_commit(ctx)?;
        return Ok(0);
    }

    let mut writer = TaskOutputWriter::open(ctx, target, coord.resolver())?;
    let written = records
        .iter()
        .try_for_each(|r| writer.write(r))
        .and_then(|()| writer.close());
    let staged = match written {
        Ok(staged) => staged,
        Err(e) => {
            if let Err(abandon) = writer.abandon() {
                warn!("no se pudo descartar el writer de {}: {abandon}", ctx.attempt_id());
            }
            return Err(e);
        }
    };

    if !coord.needs_task_commit(ctx)? {
        coord.skip_task_commit(ctx)?;
        return Ok(0);
    }
    let n = staged.records();
    coord.commit_task(ctx, staged)?;
    Ok(n)
}

/// Traduce el resultado del intento y aborta su staging si no ganó.
fn settle(
    coord: &OutputCommitCoordinator,
    ctx: &TaskContext,
    res: committer::Result<u64>,
) -> AttemptResult {
    let outcome = match res {
        Ok(n) => return AttemptResult::Won(n),
        Err(CommitError::ConflictingAttempt { winner, .. }) => {
            info!("{} perdió contra {}; se descarta", ctx.attempt_id(), winner);
            AttemptResult::Lost
        }
        Err(e) => {
            warn!("intento {} falló: {e}", ctx.attempt_id());
            AttemptResult::Failed(e)
        }
    };
    if let Err(e) = coord.abort_task(ctx) {
        warn!("abort_task {} falló: {e}", ctx.attempt_id());
    }
    outcome
}

/// Reintenta `commit_job` mientras el error sea transitorio. Agotados los
/// reintentos, o ante un error fatal, aborta el job.
async fn commit_with_retry(
    coord: &Arc<OutputCommitCoordinator>,
    job: &JobContext,
    conf: &OutputConf,
    report: &mut JobReport,
) -> committer::Result<()> {
    let mut backoff = conf.commit_retry_backoff;
    let mut attempt = 0;

    loop {
        attempt += 1;
        report.commit_attempts = attempt;

        let c = coord.clone();
        let j = job.clone();
        let res = match tokio::task::spawn_blocking(move || c.commit_job(&j)).await {
            Ok(r) => r,
            Err(e) => Err(CommitError::CommitTimeout(format!("join error: {e}"))),
        };

        match res {
            Ok(()) => {
                info!("job {} commiteado tras {} intento(s)", job.job_id(), attempt);
                return Ok(());
            }
            Err(e) if e.is_transient() && attempt <= conf.commit_max_retries => {
                warn!(
                    "commit_job {} falló ({e}); reintento {}/{} en {:?}",
                    job.job_id(),
                    attempt,
                    conf.commit_max_retries,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(10));
            }
            Err(e) => {
                warn!("commit_job {} falló definitivamente: {e}", job.job_id());
                abort(coord, job).await;
                return Err(e);
            }
        }
    }
}

async fn abort(coord: &Arc<OutputCommitCoordinator>, job: &JobContext) {
    let c = coord.clone();
    let j = job.clone();
    match tokio::task::spawn_blocking(move || c.abort_job(&j)).await {
        Ok(Ok(())) => debug!("job {} abortado", job.job_id()),
        Ok(Err(e)) => warn!("abort_job {} falló: {e}", job.job_id()),
        Err(e) => warn!("abort_job {}: join error {e}", job.job_id()),
    }
}

fn finish(mut report: JobReport, status: JobStatus, error: Option<String>) -> JobReport {
    report.status = status;
    report.error = error;
    report.finished_at = Some(Utc::now());
    report
}
