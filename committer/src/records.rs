use serde_json::Value;
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};

/// Tipo genérico de registro (fila de datos), representado como JSON.
pub type Record = Value;

/// Colección en memoria de registros.
pub type Records = Vec<Record>;

/// Prefijo de los archivos de datos; cualquier otro archivo (marcadores,
/// manifiestos) se ignora al leer.
pub const PART_FILE_PREFIX: &str = "part-";

/// Lee un archivo JSONL (un registro por línea).
pub fn read_jsonl(path: &Path) -> io::Result<Records> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let rec: Value = serde_json::from_str(&line)?;
        out.push(rec);
    }

    Ok(out)
}

/// Archivos `part-*.jsonl` bajo `dir` (a cualquier profundidad), ordenados.
pub fn list_part_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let pattern = dir.join("**").join(format!("{PART_FILE_PREFIX}*.jsonl"));
    let pattern = pattern.to_string_lossy();

    let entries = glob::glob(&pattern)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Lee todos los archivos de datos bajo `dir`. Directorio inexistente = vacío.
pub fn read_dir_records(dir: &Path) -> io::Result<Records> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for file in list_part_files(dir)? {
        out.extend(read_jsonl(&file)?);
    }
    Ok(out)
}
