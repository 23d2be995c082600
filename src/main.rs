// ==========================================
// 健康数据导入引擎 - 命令行入口
// ==========================================
// 命令:
//   import <FILE>        导入单个文件（摘要 JSON → stdout，进度 → stderr）
//   batch <FILE>...      依次导入多个文件
//   history              查看最近的导入历史
//   clear <KIND>         删除某种类的已存数据
//   export               导出全部数据（csv / json）
// ==========================================

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use health_import::db::get_default_db_path;
use health_import::exporter::{self, ExportFormat};
use health_import::{
    logging, ConfigManager, HealthImporter, HealthImporterImpl, HealthStore, HealthStoreImpl,
    ImportSource, MetricKind, ProgressEvent,
};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Importer = HealthImporterImpl<HealthStoreImpl, ConfigManager>;

#[derive(Parser)]
#[command(name = "health-import")]
#[command(version = health_import::VERSION)]
#[command(about = "Import health export files (CSV / JSON / XML) into a local store", long_about = None)]
struct Cli {
    /// Database path (defaults to HEALTH_IMPORT_DB_PATH or the user data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import one export file
    Import {
        file: PathBuf,

        /// Suppress progress output
        #[arg(short, long)]
        quiet: bool,
    },

    /// Import several files one after another
    Batch {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show recent import history
    History {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Remove the stored series of one kind (e.g. heartRate, workout)
    Clear { kind: String },

    /// Export stored data
    Export {
        #[arg(short, long, value_enum, default_value = "csv")]
        format: CliExportFormat,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CliExportFormat {
    Csv,
    Json,
}

impl From<CliExportFormat> for ExportFormat {
    fn from(f: CliExportFormat) -> Self {
        match f {
            CliExportFormat::Csv => ExportFormat::Csv,
            CliExportFormat::Json => ExportFormat::Json,
        }
    }
}

fn open_importer(db: Option<PathBuf>) -> Result<Importer> {
    let db_path = match db {
        Some(p) => p.display().to_string(),
        None => get_default_db_path(),
    };
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("无法创建数据目录: {}", parent.display()))?;
        }
    }
    tracing::info!(db_path = %db_path, "使用数据库");

    let store = HealthStoreImpl::new(&db_path).context("无法打开数据库")?;
    let config = ConfigManager::from_connection(store.connection());
    Ok(HealthImporterImpl::new(store, config))
}

async fn run_import(importer: &Importer, file: PathBuf, quiet: bool) -> Result<()> {
    let source = ImportSource::from_path(&file).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if quiet {
                continue;
            }
            match event {
                ProgressEvent::Status(status) => eprintln!("[status] {}", status),
                ProgressEvent::Percent(p) => eprintln!("[progress] {}%", p),
            }
        }
    });

    // Ctrl-C 取消导入
    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_token.cancel();
        }
    });

    let result = importer.import(source, Some(tx), cancel).await;
    ctrl_c.abort();
    let _ = printer.await;

    match result {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Err(e) => bail!("导入失败 [{}]: {}", e.stage(), e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_with_default("warn");
    let cli = Cli::parse();
    let importer = open_importer(cli.db)?;

    match cli.command {
        Commands::Import { file, quiet } => run_import(&importer, file, quiet).await?,
        Commands::Batch { files } => {
            let names: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
            let results = importer.batch_import(files).await;
            let mut failed = 0;
            for (name, result) in names.iter().zip(results) {
                match result {
                    Ok(summary) => println!("{}\t{}", name, serde_json::to_string(&summary)?),
                    Err(e) => {
                        failed += 1;
                        eprintln!("{}\t[{}] {}", name, e.stage(), e);
                    }
                }
            }
            if failed > 0 {
                bail!("{} 个文件导入失败", failed);
            }
        }
        Commands::History { limit } => {
            let history = importer.store().recent_history(limit).await?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        Commands::Clear { kind } => {
            let Some(kind) = MetricKind::parse(&kind) else {
                bail!("未知种类: {}", kind);
            };
            let removed = importer.store().clear_kind(kind).await?;
            println!("{} {}", kind, if removed { "cleared" } else { "was empty" });
        }
        Commands::Export { format, output } => {
            let snapshot = importer.store().read_all().await?;
            let text = exporter::export_to_string(&snapshot, format.into())?;
            match output {
                Some(path) => std::fs::write(&path, text)
                    .with_context(|| format!("无法写入: {}", path.display()))?,
                None => std::io::stdout().write_all(text.as_bytes())?,
            }
        }
    }

    Ok(())
}
