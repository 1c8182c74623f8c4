use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use committer::{
    engine, keys, Catalog, Configuration, FsCatalog, JobId, OutputConf, PartitionSpec,
};
use driver::JobRunner;
use std::{path::PathBuf, sync::Arc};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "driver")]
#[command(about = "Corre jobs con commit de salida en dos fases sobre un warehouse local")]
struct Cli {
    /// Archivo JSON con claves de configuración ({"output.table": "t1", ...})
    #[arg(long, global = true, value_name = "ARCHIVO")]
    conf: Option<PathBuf>,

    /// Directorio del warehouse (pisa output.warehouse_dir)
    #[arg(long, global = true, value_name = "DIR")]
    warehouse: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Registra una tabla en el catálogo
    CreateTable {
        #[arg(value_name = "TABLA")]
        table: String,

        /// Columnas de partición, separadas por coma (ej: ds,hr)
        #[arg(long, value_delimiter = ',')]
        partition_cols: Vec<String>,
    },
    /// Cuenta aristas salientes por vértice y publica el resultado
    Run {
        /// Archivo de aristas "origen destino", una por línea
        #[arg(value_name = "ARISTAS")]
        input: PathBuf,

        #[arg(long)]
        table: Option<String>,

        /// Partición destino, ej: ds=foobar
        #[arg(long)]
        partition: Option<String>,

        /// Reemplaza la partición si ya existe
        #[arg(long)]
        overwrite: bool,

        #[arg(long)]
        tasks: Option<u32>,

        /// Lanza un intento duplicado por tarea
        #[arg(long)]
        speculative: bool,
    },
    /// Lee las filas publicadas de una tabla
    Read {
        #[arg(value_name = "TABLA")]
        table: String,

        /// Filtro de partición, ej: ds='foobar'
        #[arg(long, default_value = "")]
        filter: String,
    },
    /// Completa o aborta un job interrumpido
    Recover {
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("driver=debug,committer=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let mut conf = match &cli.conf {
        Some(path) => Configuration::load_json(path)?,
        None => Configuration::new(),
    };
    conf.overlay_env();
    if let Some(dir) = &cli.warehouse {
        conf.set(keys::WAREHOUSE_DIR, dir.to_string_lossy());
    }

    let warehouse = OutputConf::from_conf(&conf)?.warehouse_dir;
    let catalog = Arc::new(FsCatalog::open(&warehouse)?);

    match cli.command {
        Commands::CreateTable {
            table,
            partition_cols,
        } => {
            let cols: Vec<&str> = partition_cols.iter().map(String::as_str).collect();
            catalog.create_table(&table, &cols)?;
            println!("tabla {} lista en {}", table, warehouse.display());
        }

        Commands::Run {
            input,
            table,
            partition,
            overwrite,
            tasks,
            speculative,
        } => {
            if let Some(t) = table {
                conf.set(keys::OUTPUT_TABLE, t);
            }
            if let Some(p) = partition {
                conf.set(keys::OUTPUT_PARTITION, p);
            }
            if overwrite {
                conf.set(keys::OUTPUT_OVERWRITE, "overwrite");
            }
            if let Some(n) = tasks {
                conf.set(keys::NUM_TASKS, n.to_string());
            }
            if speculative {
                conf.set(keys::SPECULATIVE, "true");
            }

            let edges = engine::read_edges(&input)?;
            info!("{} aristas leídas de {}", edges.len(), input.display());

            let report = JobRunner::new(catalog, conf).run(edges).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_committed() {
                bail!(
                    "job {} abortado: {}",
                    report.job_id,
                    report.error.unwrap_or_default()
                );
            }
        }

        Commands::Read { table, filter } => {
            let filter = PartitionSpec::parse(&filter)?;
            for row in catalog.read_rows(&table, &filter)? {
                println!("{row}");
            }
        }

        Commands::Recover { job_id } => {
            let job_id = JobId::parse(&job_id)?;
            let outcome = JobRunner::new(catalog, conf).recover(job_id).await?;
            println!("{}", serde_json::to_string(&outcome)?);
        }
    }

    Ok(())
}
