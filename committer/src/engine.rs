//! Cómputo de ejemplo que alimenta al protocolo de commit: grado de salida por
//! vértice a partir de un archivo de aristas `origen destino`.

use serde_json::json;
use std::{
    collections::{hash_map::DefaultHasher, BTreeMap},
    hash::{Hash, Hasher},
    io,
    path::Path,
};

use crate::records::Records;

/// Arista dirigida `src -> dst`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub src: i64,
    pub dst: i64,
}

/// Lee aristas separadas por espacios, una por línea. Ignora líneas vacías.
pub fn parse_edges<R: io::Read>(input: R) -> io::Result<Vec<Edge>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);

    let mut out = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let fields: Vec<&str> = row.iter().filter(|f| !f.is_empty()).collect();
        match fields.as_slice() {
            [] => continue,
            [src, dst] => out.push(Edge {
                src: parse_vertex(src, line)?,
                dst: parse_vertex(dst, line)?,
            }),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("línea {}: se esperaban 2 vértices, hay {}", line + 1, fields.len()),
                ))
            }
        }
    }
    Ok(out)
}

pub fn read_edges(path: &Path) -> io::Result<Vec<Edge>> {
    parse_edges(std::fs::File::open(path)?)
}

fn parse_vertex(raw: &str, line: usize) -> io::Result<i64> {
    raw.parse::<i64>().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("línea {}: vértice inválido {raw:?}: {e}", line + 1),
        )
    })
}

/// Hash simple de clave → partición (0..num_partitions-1)
pub fn hash_key_to_partition<K: Hash>(key: &K, num_partitions: u32) -> u32 {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() % num_partitions.max(1) as u64) as u32
}

/// Reparte las aristas en `n` shards según el vértice de origen, así cada vértice
/// queda entero en una sola tarea.
pub fn split_edges(edges: &[Edge], n: u32) -> Vec<Vec<Edge>> {
    let n = n.max(1);
    let mut shards = vec![Vec::new(); n as usize];
    for e in edges {
        shards[hash_key_to_partition(&e.src, n) as usize].push(*e);
    }
    shards
}

/// Cuenta aristas salientes por vértice: `{"i1": vértice, "i2": grado}`, ordenado por vértice.
pub fn count_out_edges(edges: &[Edge]) -> Records {
    let mut counts: BTreeMap<i64, i64> = BTreeMap::new();
    for e in edges {
        *counts.entry(e.src).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|(v, c)| json!({ "i1": v, "i2": c }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EDGES: &str = "1 2\n2 3\n2 4\n4 1\n";

    #[test]
    fn parse_edges_lee_pares_separados_por_espacio() {
        let edges = parse_edges(EDGES.as_bytes()).unwrap();
        assert_eq!(edges.len(), 4);
        assert_eq!(edges[1], Edge { src: 2, dst: 3 });
    }

    #[test]
    fn parse_edges_tolera_espacios_extra_y_lineas_vacias() {
        let edges = parse_edges("  1   2 \n\n4 1\n".as_bytes()).unwrap();
        assert_eq!(edges, vec![Edge { src: 1, dst: 2 }, Edge { src: 4, dst: 1 }]);
    }

    #[test]
    fn parse_edges_rechaza_lineas_mal_formadas() {
        assert!(parse_edges("1 2 3\n".as_bytes()).is_err());
        assert!(parse_edges("1 x\n".as_bytes()).is_err());
    }

    #[test]
    fn count_out_edges_da_el_grado_de_salida() {
        let edges = parse_edges(EDGES.as_bytes()).unwrap();
        assert_eq!(
            count_out_edges(&edges),
            vec![
                json!({"i1": 1, "i2": 1}),
                json!({"i1": 2, "i2": 2}),
                json!({"i1": 4, "i2": 1}),
            ]
        );
    }

    #[test]
    fn split_edges_deja_cada_vertice_en_un_solo_shard() {
        let edges = parse_edges(EDGES.as_bytes()).unwrap();
        let shards = split_edges(&edges, 3);
        assert_eq!(shards.len(), 3);
        assert_eq!(shards.iter().map(Vec::len).sum::<usize>(), 4);

        let with_two: Vec<_> = shards.iter().filter(|s| s.iter().any(|e| e.src == 2)).collect();
        assert_eq!(with_two.len(), 1);
        assert_eq!(with_two[0].iter().filter(|e| e.src == 2).count(), 2);
    }

    #[test]
    fn hash_key_to_partition_retorna_id_en_rango() {
        for k in 0..100i64 {
            assert!(hash_key_to_partition(&k, 7) < 7);
        }
        assert_eq!(hash_key_to_partition(&"x", 0), 0);
    }
}
