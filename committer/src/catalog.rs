//! Contrato del catálogo/metastore y una implementación sobre un directorio local.
//!
//! El catálogo decide qué es visible: los lectores sólo ven particiones
//! registradas, y [`Catalog::publish_partitions`] registra un conjunto entero de
//! particiones de una vez o ninguna.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, info, warn};

use crate::conf::OverwritePolicy;
use crate::error::{CommitError, Result};
use crate::records::{self, Records};
use crate::target::{OutputTarget, PartitionSpec};

const REGISTRY_FILE: &str = "_catalog.json";
const TRASH_DIR: &str = "_trash";

/// Una partición lista para publicarse desde su directorio de staging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub target: OutputTarget,
    pub staged_path: PathBuf,
}

/// Lo que el protocolo de commit necesita del catálogo.
///
/// Se inyecta como `Arc<dyn Catalog>`; cada job o test puede traer el suyo.
pub trait Catalog: Send + Sync {
    /// Falla con `UnresolvableTarget` si la tabla no existe o la partición no
    /// coincide con sus columnas de partición.
    fn validate_target(&self, target: &OutputTarget) -> Result<()>;

    /// Ubicación final (visible) del destino.
    fn resolve_partition_location(&self, target: &OutputTarget) -> Result<PathBuf>;

    fn partition_exists(&self, target: &OutputTarget) -> Result<bool>;

    /// Publica todas las particiones o ninguna. Para un lector, el cambio es atómico.
    fn publish_partitions(&self, requests: &[PublishRequest], policy: OverwritePolicy)
        -> Result<()>;

    fn publish_partition(
        &self,
        target: &OutputTarget,
        staged_path: &Path,
        policy: OverwritePolicy,
    ) -> Result<()> {
        let req = PublishRequest {
            target: target.clone(),
            staged_path: staged_path.to_path_buf(),
        };
        self.publish_partitions(std::slice::from_ref(&req), policy)
    }

    /// Registra una partición cuyos datos ya están en su ubicación final (por
    /// ejemplo, un publish interrumpido entre el movimiento y el registro).
    fn register_partition(&self, target: &OutputTarget, location: &Path) -> Result<()>;

    fn list_partitions(&self, table: &str) -> Result<Vec<PartitionSpec>>;

    /// Vista de lector: registros de las particiones publicadas que cumplen `filter`.
    fn read_rows(&self, table: &str, filter: &PartitionSpec) -> Result<Records>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPartition {
    pub spec: PartitionSpec,
    pub location: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    #[serde(default)]
    pub partition_columns: Vec<String>,
    /// Clave: `PartitionSpec` en formato `k=v,...` ("" si no hay particiones).
    #[serde(default)]
    pub partitions: BTreeMap<String, PublishedPartition>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Registry {
    tables: BTreeMap<String, TableDef>,
}

/// Catálogo sobre un directorio "warehouse": `<warehouse>/<tabla>/<k=v>/...`.
/// El registro se persiste en `<warehouse>/_catalog.json`.
#[derive(Debug)]
pub struct FsCatalog {
    warehouse: PathBuf,
    registry: Mutex<Registry>,
}

/// Movimiento ya hecho, para poder deshacerlo.
struct Undo {
    from: PathBuf,
    to: PathBuf,
}

impl FsCatalog {
    /// Abre (o inicializa) el catálogo de `warehouse`.
    pub fn open(warehouse: impl Into<PathBuf>) -> Result<Self> {
        let warehouse = warehouse.into();
        fs::create_dir_all(&warehouse)?;

        let reg_path = warehouse.join(REGISTRY_FILE);
        let registry = if reg_path.exists() {
            let raw = fs::read_to_string(&reg_path)?;
            serde_json::from_str(&raw).map_err(|e| {
                CommitError::CatalogUnavailable(format!("{}: {e}", reg_path.display()))
            })?
        } else {
            Registry::default()
        };

        Ok(Self {
            warehouse,
            registry: Mutex::new(registry),
        })
    }

    pub fn warehouse_dir(&self) -> &Path {
        &self.warehouse
    }

    /// Crea la tabla. Repetir con las mismas columnas no hace nada.
    pub fn create_table(&self, name: &str, partition_columns: &[&str]) -> Result<()> {
        // valida nombre de tabla y columnas con las mismas reglas que los destinos
        OutputTarget::unpartitioned(name)?;
        PartitionSpec::new(partition_columns.iter().map(|c| (*c, "x")))?;

        let columns: Vec<String> = partition_columns.iter().map(|c| c.to_string()).collect();
        let mut reg = self.lock()?;

        if let Some(existing) = reg.tables.get(name) {
            if existing.partition_columns == columns {
                return Ok(());
            }
            return Err(CommitError::InvalidConfig(format!(
                "la tabla {name} ya existe con particiones {:?}",
                existing.partition_columns
            )));
        }

        let mut next = reg.clone();
        next.tables.insert(
            name.to_string(),
            TableDef {
                name: name.to_string(),
                partition_columns: columns,
                partitions: BTreeMap::new(),
            },
        );
        self.persist(&next)?;
        *reg = next;

        info!("tabla {} creada en el catálogo", name);
        Ok(())
    }

    pub fn table(&self, name: &str) -> Result<TableDef> {
        let reg = self.lock()?;
        reg.tables
            .get(name)
            .cloned()
            .ok_or_else(|| unresolvable(name, "tabla desconocida"))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|_| CommitError::CatalogUnavailable("lock del registro envenenado".into()))
    }

    /// Escribe el registro en un temporal y lo renombra encima del anterior.
    fn persist(&self, reg: &Registry) -> Result<()> {
        let tmp = self.warehouse.join(format!("{REGISTRY_FILE}.tmp"));
        let bytes = serde_json::to_vec_pretty(reg)
            .map_err(|e| CommitError::CatalogUnavailable(e.to_string()))?;
        fs::write(&tmp, bytes).map_err(catalog_io)?;
        fs::rename(&tmp, self.warehouse.join(REGISTRY_FILE)).map_err(catalog_io)?;
        Ok(())
    }

    fn check_target(reg: &Registry, target: &OutputTarget) -> Result<()> {
        let table = reg
            .tables
            .get(&target.table)
            .ok_or_else(|| unresolvable(&target.to_string(), "tabla desconocida"))?;

        let keys: Vec<&str> = target.partition.keys().collect();
        if keys != table.partition_columns {
            return Err(unresolvable(
                &target.to_string(),
                &format!(
                    "la tabla se particiona por {:?} y se pidió {:?}",
                    table.partition_columns, keys
                ),
            ));
        }
        Ok(())
    }

    fn is_published(reg: &Registry, target: &OutputTarget) -> bool {
        reg.tables
            .get(&target.table)
            .map(|t| t.partitions.contains_key(&target.partition.to_string()))
            .unwrap_or(false)
    }

    fn location_of(&self, target: &OutputTarget) -> PathBuf {
        self.warehouse.join(target.rel_path())
    }

    /// Mueve cada staging a su ubicación final. Si algo falla, deshace lo hecho.
    fn move_into_place(&self, requests: &[PublishRequest]) -> Result<(Vec<Undo>, Vec<PathBuf>)> {
        let mut undo: Vec<Undo> = Vec::new();
        let mut trash: Vec<PathBuf> = Vec::new();

        for req in requests {
            let final_path = self.location_of(&req.target);
            let step = (|| -> std::io::Result<()> {
                if final_path.exists() {
                    let dest = self
                        .warehouse
                        .join(TRASH_DIR)
                        .join(uuid::Uuid::new_v4().simple().to_string());
                    fs::create_dir_all(self.warehouse.join(TRASH_DIR))?;
                    fs::rename(&final_path, &dest)?;
                    undo.push(Undo {
                        from: final_path.clone(),
                        to: dest.clone(),
                    });
                    trash.push(dest);
                }
                if let Some(parent) = final_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(&req.staged_path, &final_path)?;
                undo.push(Undo {
                    from: req.staged_path.clone(),
                    to: final_path.clone(),
                });
                Ok(())
            })();

            if let Err(e) = step {
                warn!("fallo moviendo {} a {}: {e}", req.target, final_path.display());
                Self::rollback(undo);
                return Err(catalog_io(e));
            }
        }

        Ok((undo, trash))
    }

    fn rollback(undo: Vec<Undo>) {
        for Undo { from, to } in undo.into_iter().rev() {
            if let Err(e) = fs::rename(&to, &from) {
                warn!(
                    "no se pudo deshacer el movimiento {} -> {}: {e}",
                    from.display(),
                    to.display()
                );
            }
        }
    }
}

impl Catalog for FsCatalog {
    fn validate_target(&self, target: &OutputTarget) -> Result<()> {
        let reg = self.lock()?;
        Self::check_target(&reg, target)
    }

    fn resolve_partition_location(&self, target: &OutputTarget) -> Result<PathBuf> {
        self.validate_target(target)?;
        Ok(self.location_of(target))
    }

    fn partition_exists(&self, target: &OutputTarget) -> Result<bool> {
        let reg = self.lock()?;
        Self::check_target(&reg, target)?;
        Ok(Self::is_published(&reg, target))
    }

    fn publish_partitions(
        &self,
        requests: &[PublishRequest],
        policy: OverwritePolicy,
    ) -> Result<()> {
        let mut reg = self.lock()?;

        // 1) Validar todo antes de tocar el disco
        for (i, req) in requests.iter().enumerate() {
            Self::check_target(&reg, &req.target)?;
            if requests[..i].iter().any(|other| other.target == req.target) {
                return Err(CommitError::InvalidConfig(format!(
                    "destino repetido en la publicación: {}",
                    req.target
                )));
            }
            if policy == OverwritePolicy::Fail && Self::is_published(&reg, &req.target) {
                return Err(CommitError::AlreadyCommitted {
                    target: req.target.to_string(),
                });
            }
            if !req.staged_path.is_dir() {
                return Err(CommitError::StagingIo(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("staging inexistente: {}", req.staged_path.display()),
                )));
            }
        }

        // 2) Mover datos a su lugar
        let (undo, trash) = self.move_into_place(requests)?;

        // 3) Registrar todas las particiones de una vez
        let mut next = reg.clone();
        for req in requests {
            if let Some(table) = next.tables.get_mut(&req.target.table) {
                table.partitions.insert(
                    req.target.partition.to_string(),
                    PublishedPartition {
                        spec: req.target.partition.clone(),
                        location: self.location_of(&req.target),
                    },
                );
            }
        }
        if let Err(e) = self.persist(&next) {
            Self::rollback(undo);
            return Err(e);
        }
        *reg = next;
        drop(reg);

        for dir in trash {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!("no se pudo borrar {}: {e}", dir.display());
            }
        }

        for req in requests {
            debug!("partición {} publicada", req.target);
        }
        Ok(())
    }

    fn register_partition(&self, target: &OutputTarget, location: &Path) -> Result<()> {
        let mut reg = self.lock()?;
        Self::check_target(&reg, target)?;
        if location != self.location_of(target) {
            return Err(unresolvable(
                &target.to_string(),
                &format!("{} no es la ubicación de la partición", location.display()),
            ));
        }
        if !location.is_dir() {
            return Err(CommitError::StagingIo(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("partición sin datos: {}", location.display()),
            )));
        }

        let mut next = reg.clone();
        if let Some(table) = next.tables.get_mut(&target.table) {
            table.partitions.insert(
                target.partition.to_string(),
                PublishedPartition {
                    spec: target.partition.clone(),
                    location: location.to_path_buf(),
                },
            );
        }
        self.persist(&next)?;
        *reg = next;

        info!("partición {} registrada sobre datos ya movidos", target);
        Ok(())
    }

    fn list_partitions(&self, table: &str) -> Result<Vec<PartitionSpec>> {
        let reg = self.lock()?;
        let def = reg
            .tables
            .get(table)
            .ok_or_else(|| unresolvable(table, "tabla desconocida"))?;
        Ok(def.partitions.values().map(|p| p.spec.clone()).collect())
    }

    fn read_rows(&self, table: &str, filter: &PartitionSpec) -> Result<Records> {
        let reg = self.lock()?;
        let def = reg
            .tables
            .get(table)
            .ok_or_else(|| unresolvable(table, "tabla desconocida"))?;

        let mut out = Vec::new();
        for part in def.partitions.values() {
            if part.spec.matches(filter) {
                out.extend(records::read_dir_records(&part.location).map_err(catalog_io)?);
            }
        }
        Ok(out)
    }
}

fn unresolvable(target: &str, reason: &str) -> CommitError {
    CommitError::UnresolvableTarget {
        target: target.to_string(),
        reason: reason.to_string(),
    }
}

fn catalog_io(e: std::io::Error) -> CommitError {
    CommitError::CatalogUnavailable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir()
            .join("catalog_tests")
            .join(format!("{sub}_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn staged_dir(root: &Path, name: &str, rows: &[&str]) -> PathBuf {
        let dir = root.join("staging").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("part-0.jsonl"), rows.join("\n")).unwrap();
        dir
    }

    fn ds(v: &str) -> OutputTarget {
        OutputTarget::new("t2", PartitionSpec::parse(&format!("ds={v}")).unwrap()).unwrap()
    }

    #[test]
    fn validate_target_exige_columnas_de_particion() {
        let tmp = temp_dir("validate");
        let cat = FsCatalog::open(&tmp).unwrap();
        cat.create_table("t1", &[]).unwrap();
        cat.create_table("t2", &["ds"]).unwrap();

        assert!(cat.validate_target(&OutputTarget::unpartitioned("t1").unwrap()).is_ok());
        assert!(cat.validate_target(&ds("x")).is_ok());

        let err = cat.validate_target(&OutputTarget::unpartitioned("t2").unwrap());
        assert!(matches!(err, Err(CommitError::UnresolvableTarget { .. })));
        let err = cat.validate_target(&OutputTarget::unpartitioned("nope").unwrap());
        assert!(matches!(err, Err(CommitError::UnresolvableTarget { .. })));
    }

    #[test]
    fn create_table_es_idempotente_y_detecta_conflictos() {
        let tmp = temp_dir("create");
        let cat = FsCatalog::open(&tmp).unwrap();
        cat.create_table("t2", &["ds"]).unwrap();
        cat.create_table("t2", &["ds"]).unwrap();
        assert!(cat.create_table("t2", &["hr"]).is_err());
        assert!(cat.create_table("_oculta", &[]).is_err());
    }

    #[test]
    fn publish_partitions_registra_y_persiste() {
        let tmp = temp_dir("publish");
        let cat = FsCatalog::open(tmp.join("wh")).unwrap();
        cat.create_table("t2", &["ds"]).unwrap();

        let a = staged_dir(&tmp, "a", &[r#"{"i1":1}"#]);
        let b = staged_dir(&tmp, "b", &[r#"{"i1":2}"#]);
        cat.publish_partitions(
            &[
                PublishRequest { target: ds("a"), staged_path: a.clone() },
                PublishRequest { target: ds("b"), staged_path: b.clone() },
            ],
            OverwritePolicy::Fail,
        )
        .unwrap();

        assert!(!a.exists());
        assert!(cat.partition_exists(&ds("a")).unwrap());
        assert_eq!(
            cat.read_rows("t2", &PartitionSpec::parse("ds=b").unwrap()).unwrap(),
            vec![json!({"i1":2})]
        );

        // otro proceso que abre el mismo warehouse ve lo mismo
        let reopened = FsCatalog::open(tmp.join("wh")).unwrap();
        assert_eq!(reopened.list_partitions("t2").unwrap().len(), 2);
    }

    #[test]
    fn publish_con_politica_fail_no_toca_nada_si_alguna_existe() {
        let tmp = temp_dir("fail_policy");
        let cat = FsCatalog::open(tmp.join("wh")).unwrap();
        cat.create_table("t2", &["ds"]).unwrap();

        let first = staged_dir(&tmp, "first", &[r#"{"v":"viejo"}"#]);
        cat.publish_partition(&ds("a"), &first, OverwritePolicy::Fail).unwrap();

        let again = staged_dir(&tmp, "again", &[r#"{"v":"nuevo"}"#]);
        let other = staged_dir(&tmp, "other", &[r#"{"v":"otro"}"#]);
        let err = cat.publish_partitions(
            &[
                PublishRequest { target: ds("b"), staged_path: other.clone() },
                PublishRequest { target: ds("a"), staged_path: again.clone() },
            ],
            OverwritePolicy::Fail,
        );
        assert!(matches!(err, Err(CommitError::AlreadyCommitted { .. })));

        // ni "b" se publicó ni "a" cambió
        assert!(!cat.partition_exists(&ds("b")).unwrap());
        assert!(other.exists() && again.exists());
        assert_eq!(
            cat.read_rows("t2", &PartitionSpec::default()).unwrap(),
            vec![json!({"v":"viejo"})]
        );
    }

    #[test]
    fn publish_con_overwrite_reemplaza_sin_mezclar() {
        let tmp = temp_dir("overwrite");
        let cat = FsCatalog::open(tmp.join("wh")).unwrap();
        cat.create_table("t1", &[]).unwrap();
        let t1 = OutputTarget::unpartitioned("t1").unwrap();

        let first = staged_dir(&tmp, "first", &[r#"{"v":1}"#, r#"{"v":2}"#]);
        cat.publish_partition(&t1, &first, OverwritePolicy::Fail).unwrap();

        let second = staged_dir(&tmp, "second", &[r#"{"v":3}"#]);
        cat.publish_partition(&t1, &second, OverwritePolicy::Overwrite).unwrap();

        assert_eq!(
            cat.read_rows("t1", &PartitionSpec::default()).unwrap(),
            vec![json!({"v":3})]
        );
    }

    #[test]
    fn register_partition_hace_visibles_datos_ya_movidos() {
        let tmp = temp_dir("register");
        let cat = FsCatalog::open(tmp.join("wh")).unwrap();
        cat.create_table("t2", &["ds"]).unwrap();

        let final_path = cat.resolve_partition_location(&ds("a")).unwrap();
        fs::create_dir_all(&final_path).unwrap();
        fs::write(final_path.join("part-0.jsonl"), r#"{"i1":7}"#).unwrap();
        assert!(cat.read_rows("t2", &PartitionSpec::default()).unwrap().is_empty());

        cat.register_partition(&ds("a"), &final_path).unwrap();
        assert!(cat.partition_exists(&ds("a")).unwrap());
        assert_eq!(
            cat.read_rows("t2", &PartitionSpec::default()).unwrap(),
            vec![json!({"i1":7})]
        );

        // ubicación ajena o vacía: se rechaza
        assert!(cat.register_partition(&ds("b"), &final_path).is_err());
        let missing = cat.resolve_partition_location(&ds("c")).unwrap();
        assert!(cat.register_partition(&ds("c"), &missing).is_err());
    }

    #[test]
    fn publish_falla_y_deshace_si_un_staging_desaparece_a_mitad() {
        let tmp = temp_dir("rollback");
        let cat = FsCatalog::open(tmp.join("wh")).unwrap();
        cat.create_table("t2", &["ds"]).unwrap();

        let a = staged_dir(&tmp, "a", &[r#"{"i1":1}"#]);
        // "b" existe como archivo, no como directorio: falla la validación previa
        let b = tmp.join("staging").join("b");
        fs::write(&b, "no soy un directorio").unwrap();

        let err = cat.publish_partitions(
            &[
                PublishRequest { target: ds("a"), staged_path: a.clone() },
                PublishRequest { target: ds("b"), staged_path: b },
            ],
            OverwritePolicy::Fail,
        );
        assert!(err.is_err());
        assert!(a.exists());
        assert!(cat.list_partitions("t2").unwrap().is_empty());
    }
}
