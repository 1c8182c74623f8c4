//! Máquina de estados del commit en dos fases.
//!
//! Job:   Open -> TaskPhase -> Committing -> Committed
//!                     \            \
//!                      +-----------+-> Aborting -> Aborted
//!
//! Intento: Running -> StagedReady -> Committed  (o -> Discarded)
//!
//! Cada intento escribe en `<scratch>/<job>/_attempts/<intento>/...`. `commit_task`
//! renombra ese staging a `<scratch>/<job>/out/<destino>/task_NNNNNN`, que sigue
//! siendo invisible. `commit_job` publica `<scratch>/<job>/out/<destino>` en el
//! catálogo, todas las particiones de una vez.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, PublishRequest};
use crate::conf::{OutputConf, OverwritePolicy};
use crate::context::{JobContext, TaskContext};
use crate::error::{CommitError, Result};
use crate::ids::{JobId, TaskAttemptId};
use crate::records;
use crate::resolver::PartitionResolver;
use crate::target::OutputTarget;
use crate::writer::StagedOutput;

/// Marcador con el intento dueño de una salida commiteada.
const ATTEMPT_MARKER: &str = "_ATTEMPT";
/// Marcador con el job dueño de un destino; viaja con los datos al publicarse.
const JOB_MARKER: &str = "_JOB";
/// Manifiesto escrito al empezar `commit_job`; permite recuperar tras un crash.
pub const COMMIT_MANIFEST: &str = "_COMMIT_MANIFEST.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobCommitState {
    Open,
    TaskPhase,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl JobCommitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobCommitState::Committed | JobCommitState::Aborted)
    }
}

impl fmt::Display for JobCommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskCommitState {
    Running,
    StagedReady,
    Committed,
    Discarded,
}

impl TaskCommitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskCommitState::Committed | TaskCommitState::Discarded)
    }
}

/// Qué encontró `recover_job` y qué hizo al respecto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryOutcome {
    /// No hay área del job: nunca empezó o ya se limpió.
    NothingToRecover,
    /// La publicación había terminado; sólo faltaba limpiar.
    AlreadyPublished,
    /// La publicación estaba a medias y se completó.
    Completed,
    /// El job no llegó a commitear (o no se pudo completar) y se abortó.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub target: OutputTarget,
    pub staged_path: PathBuf,
    pub final_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitManifest {
    pub job_id: JobId,
    pub policy: OverwritePolicy,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
}

impl CommitManifest {
    fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                CommitError::InvalidConfig(format!("manifiesto corrupto {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(self).map_err(io::Error::from)?;
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[derive(Debug)]
struct AttemptRecord {
    state: TaskCommitState,
    staged: Option<StagedOutput>,
}

#[derive(Debug)]
struct JobState {
    state: JobCommitState,
    /// Arena de intentos; nunca se comparten contadores mutables entre intentos.
    attempts: HashMap<TaskAttemptId, AttemptRecord>,
    /// Intento ganador por índice de tarea lógica.
    winners: BTreeMap<u32, TaskAttemptId>,
    last_error: Option<String>,
}

/// Coordinador del commit de salida de un job.
pub struct OutputCommitCoordinator {
    job_id: JobId,
    conf: OutputConf,
    resolver: PartitionResolver,
    state: Mutex<JobState>,
    /// commit_job / abort_job / recover_job nunca corren a la vez.
    job_ops: Mutex<()>,
}

impl OutputCommitCoordinator {
    pub fn new(job: &JobContext, catalog: Arc<dyn Catalog>) -> Result<Self> {
        let conf = job.output_conf()?;
        let resolver = PartitionResolver::from_conf(catalog, &conf);
        Ok(Self {
            job_id: job.job_id().clone(),
            conf,
            resolver,
            state: Mutex::new(JobState {
                state: JobCommitState::Open,
                attempts: HashMap::new(),
                winners: BTreeMap::new(),
                last_error: None,
            }),
            job_ops: Mutex::new(()),
        })
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn resolver(&self) -> &PartitionResolver {
        &self.resolver
    }

    pub fn output_conf(&self) -> &OutputConf {
        &self.conf
    }

    pub fn state(&self) -> Result<JobCommitState> {
        Ok(self.lock("state")?.state)
    }

    pub fn task_state(&self, attempt: &TaskAttemptId) -> Result<Option<TaskCommitState>> {
        Ok(self.lock("task_state")?.attempts.get(attempt).map(|r| r.state))
    }

    /// Ganador de cada tarea lógica, por índice.
    pub fn winners(&self) -> Result<Vec<TaskAttemptId>> {
        Ok(self.lock("winners")?.winners.values().cloned().collect())
    }

    pub fn last_error(&self) -> Result<Option<String>> {
        Ok(self.lock("last_error")?.last_error.clone())
    }

    /// Destino configurado por `output.table`/`output.partition`, si lo hay.
    pub fn configured_target(&self) -> Result<Option<OutputTarget>> {
        match self.conf.table {
            Some(_) => OutputTarget::from_conf(&self.conf).map(Some),
            None => Ok(None),
        }
    }

    /* ---------------- nivel tarea ---------------- */

    /// Prepara el staging del intento. Repetirlo para el mismo intento no hace nada.
    pub fn setup_task(&self, ctx: &TaskContext) -> Result<()> {
        self.check_job(ctx.job_id())?;
        let attempt = ctx.attempt_id();
        {
            let mut st = self.lock("setup_task")?;
            Self::require_task_phase(&st, "setup_task", &self.job_id)?;
            if st.attempts.contains_key(attempt) {
                return Ok(());
            }
            st.attempts.insert(
                attempt.clone(),
                AttemptRecord {
                    state: TaskCommitState::Running,
                    staged: None,
                },
            );
        }
        fs::create_dir_all(self.resolver.attempt_dir(attempt))?;
        debug!("setup_task {}", attempt);
        Ok(())
    }

    /// true si el intento dejó datos en su staging.
    pub fn needs_task_commit(&self, ctx: &TaskContext) -> Result<bool> {
        self.check_job(ctx.job_id())?;
        let attempt = ctx.attempt_id();
        if let Some(rec) = self.lock("needs_task_commit")?.attempts.get(attempt) {
            if rec.state.is_terminal() {
                return Ok(false);
            }
        }

        let dir = self.resolver.attempt_dir(attempt);
        if !dir.exists() {
            return Ok(false);
        }
        for file in records::list_part_files(&dir)? {
            if fs::metadata(&file)?.len() > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Promueve el staging del intento al área del job (aún invisible).
    ///
    /// Sólo un intento por tarea lógica gana; los demás reciben `ConflictingAttempt`.
    /// Reintentar el commit del ganador completa lo pendiente o no hace nada.
    pub fn commit_task(&self, ctx: &TaskContext, staged: StagedOutput) -> Result<()> {
        self.check_job(ctx.job_id())?;
        let attempt = ctx.attempt_id().clone();
        if staged.attempt != attempt {
            return Err(CommitError::ConflictingAttempt {
                task: attempt.task_id.to_string(),
                winner: attempt.to_string(),
                attempt: staged.attempt.to_string(),
            });
        }

        // 1) Reclamar la tarea lógica
        {
            let mut st = self.lock("commit_task")?;
            Self::require_task_phase(&st, "commit_task", &self.job_id)?;

            match st.attempts.get(&attempt).map(|r| r.state) {
                Some(TaskCommitState::Committed) => return Ok(()),
                Some(TaskCommitState::Discarded) => {
                    return Err(CommitError::AttemptDiscarded(attempt.to_string()))
                }
                _ => {}
            }

            let index = attempt.task_id.index;
            if let Some(winner) = st.winners.get(&index) {
                if *winner != attempt {
                    return Err(CommitError::ConflictingAttempt {
                        task: attempt.task_id.to_string(),
                        winner: winner.to_string(),
                        attempt: attempt.to_string(),
                    });
                }
            }
            st.winners.insert(index, attempt.clone());
            st.attempts
                .entry(attempt.clone())
                .or_insert(AttemptRecord {
                    state: TaskCommitState::Running,
                    staged: None,
                })
                .state = TaskCommitState::StagedReady;
        }

        // 2) Mover el staging al área del job
        let promoted = match self.promote(&attempt, &staged) {
            Ok(p) => p,
            Err(e) => {
                warn!("commit_task {} falló: {e}", attempt);
                let mut st = self.lock("commit_task")?;
                if st.winners.get(&attempt.task_id.index) == Some(&attempt) {
                    st.winners.remove(&attempt.task_id.index);
                }
                if let Some(rec) = st.attempts.get_mut(&attempt) {
                    if rec.state == TaskCommitState::StagedReady {
                        rec.state = TaskCommitState::Running;
                    }
                }
                return Err(e);
            }
        };

        // 3) Registrar, salvo que el job o el intento se hayan abortado mientras tanto
        let mut st = self.lock("commit_task")?;
        let discarded = st
            .attempts
            .get(&attempt)
            .map(|r| r.state == TaskCommitState::Discarded)
            .unwrap_or(true);
        let aborted = matches!(st.state, JobCommitState::Aborting | JobCommitState::Aborted);
        if discarded || aborted {
            drop(st);
            for dir in promoted {
                remove_dir_if_exists(&dir)?;
            }
            return Err(if aborted {
                CommitError::JobAborted(self.job_id.to_string())
            } else {
                CommitError::AttemptDiscarded(attempt.to_string())
            });
        }

        let records = staged.records();
        if let Some(rec) = st.attempts.get_mut(&attempt) {
            rec.state = TaskCommitState::Committed;
            rec.staged = Some(staged);
        }
        drop(st);

        remove_dir_if_exists(&self.resolver.attempt_dir(&attempt))?;
        info!("commit_task {} ({} registros)", attempt, records);
        Ok(())
    }

    /// Registra como terminado un intento sin salida (`needs_task_commit` == false).
    pub fn skip_task_commit(&self, ctx: &TaskContext) -> Result<()> {
        self.commit_task(ctx, StagedOutput::empty(ctx.attempt_id().clone()))
    }

    /// Descarta el staging del intento. Idempotente; no exige `setup_task` previo.
    pub fn abort_task(&self, ctx: &TaskContext) -> Result<()> {
        self.check_job(ctx.job_id())?;
        let attempt = ctx.attempt_id();
        {
            let mut st = self.lock("abort_task")?;
            let rec = st.attempts.entry(attempt.clone()).or_insert(AttemptRecord {
                state: TaskCommitState::Running,
                staged: None,
            });
            if rec.state == TaskCommitState::Committed {
                warn!("abort_task sobre {} ya commiteado; se ignora", attempt);
                return Ok(());
            }
            rec.state = TaskCommitState::Discarded;
            rec.staged = None;
            if st.winners.get(&attempt.task_id.index) == Some(attempt) {
                st.winners.remove(&attempt.task_id.index);
            }
        }
        remove_dir_if_exists(&self.resolver.attempt_dir(attempt))?;
        debug!("abort_task {}", attempt);
        Ok(())
    }

    /// Mueve cada destino del staging del intento a `out/<destino>/task_NNNNNN`.
    /// Devuelve los directorios promovidos.
    fn promote(&self, attempt: &TaskAttemptId, staged: &StagedOutput) -> Result<Vec<PathBuf>> {
        let attempt_dir = self.resolver.attempt_dir(attempt);
        if let Some(stray) = staged.files.iter().find(|f| !f.path.starts_with(&attempt_dir)) {
            return Err(CommitError::StagingIo(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} está fuera del staging de {}", stray.path.display(), attempt),
            )));
        }

        let mut done: Vec<(PathBuf, PathBuf)> = Vec::new();
        for target in staged.targets() {
            let src = attempt_dir.join(target.rel_path());
            let dst = self
                .resolver
                .holding_dir(&self.job_id, &target)
                .join(attempt.task_id.dir_name());

            match self.promote_one(attempt, &src, &dst) {
                Ok(true) => done.push((src, dst)),
                Ok(false) => {}
                Err(e) => {
                    for (src, dst) in done.into_iter().rev() {
                        if let Err(undo) = fs::rename(&dst, &src) {
                            warn!("no se pudo deshacer {}: {undo}", dst.display());
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(staged
            .targets()
            .iter()
            .map(|t| {
                self.resolver
                    .holding_dir(&self.job_id, t)
                    .join(attempt.task_id.dir_name())
            })
            .collect())
    }

    /// true si movió algo; false si ya estaba promovido por este mismo intento.
    fn promote_one(&self, attempt: &TaskAttemptId, src: &Path, dst: &Path) -> Result<bool> {
        let me = attempt.to_string();
        if dst.exists() {
            let owner = fs::read_to_string(dst.join(ATTEMPT_MARKER)).unwrap_or_default();
            if owner.trim() == me {
                return Ok(false);
            }
            return Err(CommitError::ConflictingAttempt {
                task: attempt.task_id.to_string(),
                winner: owner.trim().to_string(),
                attempt: me,
            });
        }
        if !src.is_dir() {
            return Err(CommitError::StagingIo(io::Error::new(
                io::ErrorKind::NotFound,
                format!("staging inexistente: {}", src.display()),
            )));
        }

        fs::write(src.join(ATTEMPT_MARKER), &me)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(src, dst)?;
        Ok(true)
    }

    /* ---------------- nivel job ---------------- */

    /// Prepara el área del job. No toca la ubicación final.
    pub fn setup_job(&self, job: &JobContext) -> Result<()> {
        self.check_job(job.job_id())?;
        let _ops = self.lock_ops("setup_job")?;
        {
            let st = self.lock("setup_job")?;
            match st.state {
                JobCommitState::Open => {}
                JobCommitState::TaskPhase => return Ok(()),
                other => {
                    return Err(CommitError::InvalidJobState {
                        op: "setup_job",
                        state: other.to_string(),
                    })
                }
            }
        }

        if let Some(target) = self.configured_target()? {
            self.resolver.catalog().validate_target(&target)?;
        }
        fs::create_dir_all(self.resolver.job_dir(&self.job_id))?;

        self.lock("setup_job")?.state = JobCommitState::TaskPhase;
        info!("setup_job {}", self.job_id);
        Ok(())
    }

    /// Publica de forma atómica todas las particiones del job.
    ///
    /// Los errores transitorios dejan el job en `Committing` para que el driver
    /// reintente; cualquier otro error lo pasa a `Aborting`.
    pub fn commit_job(&self, job: &JobContext) -> Result<()> {
        self.check_job(job.job_id())?;
        let _ops = self.lock_ops("commit_job")?;

        let (targets, losers) = {
            let mut st = self.lock("commit_job")?;
            let current = st.state;
            match current {
                JobCommitState::TaskPhase => {
                    self.check_barrier(&st)?;
                    let losers = Self::discard_losers(&mut st);
                    st.state = JobCommitState::Committing;
                    (self.job_targets(&st)?, losers)
                }
                JobCommitState::Committing => (self.job_targets(&st)?, Vec::new()),
                JobCommitState::Committed => {
                    return Err(CommitError::AlreadyCommitted {
                        target: self.describe_targets(&st),
                    })
                }
                JobCommitState::Aborting | JobCommitState::Aborted => {
                    return Err(CommitError::JobAborted(self.job_id.to_string()))
                }
                JobCommitState::Open => {
                    return Err(CommitError::InvalidJobState {
                        op: "commit_job",
                        state: JobCommitState::Open.to_string(),
                    })
                }
            }
        };

        for attempt in &losers {
            info!("descartando intento perdedor {}", attempt);
            if let Err(e) = remove_dir_if_exists(&self.resolver.attempt_dir(attempt)) {
                warn!("no se pudo borrar el staging de {}: {e}", attempt);
            }
        }

        let result = self
            .write_manifest(&targets)
            .and_then(|manifest| self.publish_pending(&manifest).map(|_| ()));

        let mut st = self.lock("commit_job")?;
        match result {
            Ok(()) => {
                st.state = JobCommitState::Committed;
                st.last_error = None;
                drop(st);
                self.cleanup_job_dir();
                info!("commit_job {}: {} destino(s) publicados", self.job_id, targets.len());
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!("commit_job {} falló (transitorio): {e}", self.job_id);
                st.last_error = Some(e.to_string());
                Err(e)
            }
            Err(e) => {
                warn!("commit_job {} falló: {e}; el job pasa a Aborting", self.job_id);
                st.state = JobCommitState::Aborting;
                st.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Descarta el área del job sin tocar la ubicación final.
    pub fn abort_job(&self, job: &JobContext) -> Result<()> {
        self.check_job(job.job_id())?;
        let _ops = self.lock_ops("abort_job")?;
        {
            let mut st = self.lock("abort_job")?;
            if st.state.is_terminal() {
                return Err(CommitError::InvalidJobState {
                    op: "abort_job",
                    state: st.state.to_string(),
                });
            }
            st.state = JobCommitState::Aborting;
            for rec in st.attempts.values_mut() {
                if !rec.state.is_terminal() {
                    rec.state = TaskCommitState::Discarded;
                    rec.staged = None;
                }
            }
        }

        remove_dir_if_exists(&self.resolver.job_dir(&self.job_id))?;

        self.lock("abort_job")?.state = JobCommitState::Aborted;
        info!("abort_job {}", self.job_id);
        Ok(())
    }

    /// Tras un reinicio: mira el área del job y el catálogo, y completa la
    /// publicación o aborta. Nunca deja la ubicación final a medias.
    pub fn recover_job(&self, job: &JobContext) -> Result<RecoveryOutcome> {
        self.check_job(job.job_id())?;
        let _ops = self.lock_ops("recover_job")?;
        {
            let st = self.lock("recover_job")?;
            if st.state.is_terminal() {
                return Err(CommitError::InvalidJobState {
                    op: "recover_job",
                    state: st.state.to_string(),
                });
            }
        }

        let job_dir = self.resolver.job_dir(&self.job_id);
        if !job_dir.exists() {
            info!("recover_job {}: nada que recuperar", self.job_id);
            return Ok(RecoveryOutcome::NothingToRecover);
        }

        let Some(manifest) = CommitManifest::load(&job_dir.join(COMMIT_MANIFEST))? else {
            info!("recover_job {}: el commit nunca empezó, se aborta", self.job_id);
            remove_dir_if_exists(&job_dir)?;
            self.lock("recover_job")?.state = JobCommitState::Aborted;
            return Ok(RecoveryOutcome::Aborted);
        };

        self.lock("recover_job")?.state = JobCommitState::Committing;
        match self.publish_pending(&manifest) {
            Ok(done) => {
                self.lock("recover_job")?.state = JobCommitState::Committed;
                self.cleanup_job_dir();
                if done == 0 {
                    info!("recover_job {}: la publicación ya había terminado", self.job_id);
                    Ok(RecoveryOutcome::AlreadyPublished)
                } else {
                    info!("recover_job {}: publicación completada ({done} destinos)", self.job_id);
                    Ok(RecoveryOutcome::Completed)
                }
            }
            Err(e) if e.is_transient() => {
                self.lock("recover_job")?.last_error = Some(e.to_string());
                Err(e)
            }
            Err(e) => {
                warn!("recover_job {}: no se pudo completar ({e}); se aborta", self.job_id);
                remove_dir_if_exists(&job_dir)?;
                let mut st = self.lock("recover_job")?;
                st.state = JobCommitState::Aborted;
                st.last_error = Some(e.to_string());
                Ok(RecoveryOutcome::Aborted)
            }
        }
    }

    /* ---------------- helpers ---------------- */

    fn lock(&self, op: &'static str) -> Result<MutexGuard<'_, JobState>> {
        self.state.lock().map_err(|_| CommitError::InvalidJobState {
            op,
            state: "lock envenenado".to_string(),
        })
    }

    fn lock_ops(&self, op: &'static str) -> Result<MutexGuard<'_, ()>> {
        self.job_ops.lock().map_err(|_| CommitError::InvalidJobState {
            op,
            state: "lock envenenado".to_string(),
        })
    }

    fn check_job(&self, job_id: &JobId) -> Result<()> {
        if *job_id != self.job_id {
            return Err(CommitError::InvalidConfig(format!(
                "contexto del job {job_id} usado con el coordinador de {}",
                self.job_id
            )));
        }
        Ok(())
    }

    fn require_task_phase(st: &JobState, op: &'static str, job_id: &JobId) -> Result<()> {
        match st.state {
            JobCommitState::TaskPhase => Ok(()),
            JobCommitState::Aborting | JobCommitState::Aborted => {
                Err(CommitError::JobAborted(job_id.to_string()))
            }
            other => Err(CommitError::InvalidJobState {
                op,
                state: other.to_string(),
            }),
        }
    }

    /// Cada tarea lógica conocida (y cada índice esperado por `job.num_tasks`)
    /// debe tener un ganador commiteado.
    fn check_barrier(&self, st: &JobState) -> Result<()> {
        let mut indices: BTreeSet<u32> = st.attempts.keys().map(|a| a.task_id.index).collect();
        if let Some(n) = self.conf.num_tasks {
            indices.extend(0..n);
        }

        let mut missing = Vec::new();
        for index in indices {
            let committed = st
                .winners
                .get(&index)
                .and_then(|w| st.attempts.get(w))
                .map(|r| r.state == TaskCommitState::Committed)
                .unwrap_or(false);
            if !committed {
                missing.push(format!("task_{index:06}"));
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(CommitError::IncompleteTasks(missing))
        }
    }

    /// Intentos no ganadores que siguen vivos: se marcan descartados.
    fn discard_losers(st: &mut JobState) -> Vec<TaskAttemptId> {
        let mut losers = Vec::new();
        for (attempt, rec) in st.attempts.iter_mut() {
            if !rec.state.is_terminal() {
                rec.state = TaskCommitState::Discarded;
                rec.staged = None;
                losers.push(attempt.clone());
            }
        }
        losers
    }

    /// Destino configurado + todo destino con salida commiteada.
    fn job_targets(&self, st: &JobState) -> Result<Vec<OutputTarget>> {
        let mut targets: BTreeSet<OutputTarget> = BTreeSet::new();
        if let Some(t) = self.configured_target()? {
            targets.insert(t);
        }
        for winner in st.winners.values() {
            if let Some(staged) = st.attempts.get(winner).and_then(|r| r.staged.as_ref()) {
                targets.extend(staged.targets());
            }
        }
        Ok(targets.into_iter().collect())
    }

    fn describe_targets(&self, st: &JobState) -> String {
        match self.job_targets(st) {
            Ok(ts) => ts.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", "),
            Err(_) => self.job_id.to_string(),
        }
    }

    /// Escribe el manifiesto si no existe; si ya existe (reintento), lo reutiliza.
    fn write_manifest(&self, targets: &[OutputTarget]) -> Result<CommitManifest> {
        let path = self.resolver.job_dir(&self.job_id).join(COMMIT_MANIFEST);
        if let Some(existing) = CommitManifest::load(&path)? {
            return Ok(existing);
        }

        let mut entries = Vec::new();
        for target in targets {
            let staged_path = self.resolver.holding_dir(&self.job_id, target);
            // destino sin datos: se publica igual, vacío
            fs::create_dir_all(&staged_path)?;
            fs::write(staged_path.join(JOB_MARKER), self.job_id.as_str())?;
            entries.push(ManifestEntry {
                target: target.clone(),
                final_path: self.resolver.catalog().resolve_partition_location(target)?,
                staged_path,
            });
        }

        let manifest = CommitManifest {
            job_id: self.job_id.clone(),
            policy: self.conf.overwrite,
            created_at: Utc::now(),
            entries,
        };
        manifest.store(&path)?;
        Ok(manifest)
    }

    /// Completa la publicación del manifiesto y devuelve cuántos destinos
    /// publicó o registró en esta llamada.
    ///
    /// Una entrada sin staging ya se movió a su ubicación final. Si el catálogo
    /// no la registró, se registra; si la ubicación final no tiene el marcador
    /// de este job, la salida se perdió y el commit no puede terminar.
    fn publish_pending(&self, manifest: &CommitManifest) -> Result<usize> {
        let catalog = self.resolver.catalog();
        let mut requests = Vec::new();
        let mut unregistered = Vec::new();
        for entry in &manifest.entries {
            if entry.staged_path.exists() {
                if manifest.policy == OverwritePolicy::Fail
                    && catalog.partition_exists(&entry.target)?
                {
                    return Err(CommitError::AlreadyCommitted {
                        target: entry.target.to_string(),
                    });
                }
                requests.push(PublishRequest {
                    target: entry.target.clone(),
                    staged_path: entry.staged_path.clone(),
                });
                continue;
            }

            if !self.owns_location(&entry.final_path) {
                warn!(
                    "{}: sin staging y sin datos del job en {}",
                    entry.target,
                    entry.final_path.display()
                );
                return Err(CommitError::OutputLost {
                    target: entry.target.to_string(),
                });
            }
            if !catalog.partition_exists(&entry.target)? {
                unregistered.push(entry);
            }
        }

        if !requests.is_empty() {
            catalog.publish_partitions(&requests, manifest.policy)?;
        }
        for entry in &unregistered {
            warn!("{}: datos en su lugar pero sin registrar; se registran", entry.target);
            catalog.register_partition(&entry.target, &entry.final_path)?;
        }
        Ok(requests.len() + unregistered.len())
    }

    /// true si `location` contiene el marcador de este job.
    fn owns_location(&self, location: &Path) -> bool {
        fs::read_to_string(location.join(JOB_MARKER))
            .map(|owner| owner.trim() == self.job_id.as_str())
            .unwrap_or(false)
    }

    fn cleanup_job_dir(&self) {
        let dir = self.resolver.job_dir(&self.job_id);
        if let Err(e) = remove_dir_if_exists(&dir) {
            warn!("no se pudo limpiar {}: {e}", dir.display());
        }
    }
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
