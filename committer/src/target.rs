use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

use crate::conf::OutputConf;
use crate::error::{CommitError, Result};

/// Restricciones clave/valor de una partición, en orden. Vacía = sin particiones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionSpec(Vec<(String, String)>);

impl PartitionSpec {
    pub fn new<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut out = Vec::new();
        for (k, v) in pairs {
            let (k, v) = (k.into(), v.into());
            validate_component(&k)?;
            validate_component(&v)?;
            if out.iter().any(|(existing, _): &(String, String)| *existing == k) {
                return Err(CommitError::InvalidConfig(format!(
                    "clave de partición repetida: {k}"
                )));
            }
            out.push((k, v));
        }
        Ok(PartitionSpec(out))
    }

    /// Formato `ds=foobar,hr=01`. También acepta valores entre comillas
    /// simples (`ds='foobar'`), como en los filtros de lectura.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(PartitionSpec::default());
        }

        let mut pairs = Vec::new();
        for part in raw.split(',') {
            let (k, v) = part.split_once('=').ok_or_else(|| {
                CommitError::InvalidConfig(format!("partición sin '=': {part:?}"))
            })?;
            let v = v.trim().trim_matches('\'');
            pairs.push((k.trim().to_string(), v.to_string()));
        }
        Self::new(pairs)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// true si cada restricción del filtro está presente con el mismo valor.
    pub fn matches(&self, filter: &PartitionSpec) -> bool {
        filter.0.iter().all(|(k, v)| self.get(k) == Some(v.as_str()))
    }

    /// Segmentos de directorio estilo Hive: `ds=foobar/hr=01`.
    pub fn rel_path(&self) -> PathBuf {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&joined.join(","))
    }
}

fn validate_component(s: &str) -> Result<()> {
    let bad = s.is_empty()
        || s.starts_with('.')
        || s.starts_with('_')
        || s.chars()
            .any(|c| matches!(c, '/' | '\\' | '=' | ',' | '\'') || c.is_control());
    if bad {
        return Err(CommitError::InvalidConfig(format!(
            "componente de partición inválido: {s:?}"
        )));
    }
    Ok(())
}

/// Destino lógico: tabla + partición. Inmutable durante el job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputTarget {
    pub table: String,
    pub partition: PartitionSpec,
}

impl OutputTarget {
    pub fn new(table: impl Into<String>, partition: PartitionSpec) -> Result<Self> {
        let table = table.into();
        validate_component(&table).map_err(|_| CommitError::UnresolvableTarget {
            target: table.clone(),
            reason: "nombre de tabla inválido".to_string(),
        })?;
        Ok(Self { table, partition })
    }

    pub fn unpartitioned(table: impl Into<String>) -> Result<Self> {
        Self::new(table, PartitionSpec::default())
    }

    /// Destino configurado del job (`output.table` + `output.partition`).
    pub fn from_conf(conf: &OutputConf) -> Result<Self> {
        let table = conf.table.clone().ok_or_else(|| {
            CommitError::InvalidConfig("falta output.table".to_string())
        })?;
        Self::new(table, conf.partition.clone())
    }

    /// Ruta relativa `tabla/k=v/...`, usada tanto en staging como en el destino final.
    pub fn rel_path(&self) -> PathBuf {
        let mut path = PathBuf::from(&self.table);
        if !self.partition.is_empty() {
            path.push(self.partition.rel_path());
        }
        path
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.partition.is_empty() {
            write!(f, "{}", self.table)
        } else {
            write!(f, "{}[{}]", self.table, self.partition)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_particion_simple_y_compuesta() {
        let p = PartitionSpec::parse("ds=foobar").unwrap();
        assert_eq!(p.get("ds"), Some("foobar"));
        assert_eq!(p.rel_path(), PathBuf::from("ds=foobar"));

        let p = PartitionSpec::parse(" ds=2024-01-01 , hr='07' ").unwrap();
        assert_eq!(p.keys().collect::<Vec<_>>(), vec!["ds", "hr"]);
        assert_eq!(p.get("hr"), Some("07"));
        assert_eq!(p.to_string(), "ds=2024-01-01,hr=07");
        assert_eq!(p.rel_path(), PathBuf::from("ds=2024-01-01").join("hr=07"));
    }

    #[test]
    fn parse_vacio_es_sin_particiones() {
        assert!(PartitionSpec::parse("").unwrap().is_empty());
        assert!(PartitionSpec::parse("   ").unwrap().is_empty());
    }

    #[test]
    fn parse_rechaza_componentes_peligrosos() {
        assert!(PartitionSpec::parse("ds").is_err());
        assert!(PartitionSpec::parse("ds=../x").is_err());
        assert!(PartitionSpec::parse("ds=a/b").is_err());
        assert!(PartitionSpec::parse("_tmp=x").is_err());
        assert!(PartitionSpec::parse("ds=a,ds=b").is_err());
    }

    #[test]
    fn matches_aplica_filtro_parcial() {
        let p = PartitionSpec::parse("ds=foobar,hr=01").unwrap();
        assert!(p.matches(&PartitionSpec::default()));
        assert!(p.matches(&PartitionSpec::parse("ds='foobar'").unwrap()));
        assert!(!p.matches(&PartitionSpec::parse("ds=otro").unwrap()));
        assert!(!PartitionSpec::default().matches(&PartitionSpec::parse("ds=foobar").unwrap()));
    }

    #[test]
    fn output_target_rel_path_y_display() {
        let t = OutputTarget::new("t1", PartitionSpec::parse("ds=foobar").unwrap()).unwrap();
        assert_eq!(t.rel_path(), PathBuf::from("t1").join("ds=foobar"));
        assert_eq!(t.to_string(), "t1[ds=foobar]");

        let t = OutputTarget::unpartitioned("t1").unwrap();
        assert_eq!(t.rel_path(), PathBuf::from("t1"));
        assert_eq!(t.to_string(), "t1");

        assert!(matches!(
            OutputTarget::unpartitioned("a/b"),
            Err(CommitError::UnresolvableTarget { .. })
        ));
    }
}
