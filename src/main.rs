use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use photolib_lib::config::ConfigSection;
use photolib_lib::logging::{get_log_dir, LogConfig, SizeRotatingWriter};
use photolib_lib::{CaptureTime, Library, LibraryLayout, MetadataChange};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "photolib", version, about = "媒体库目录：同步、重建、导入与元数据改写")]
struct Cli {
    /// 媒体库根目录
    root: PathBuf,

    /// 不输出进度事件
    #[arg(long, short)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 增量同步目录与磁盘
    Sync,
    /// 预览同步会做的改动，不修改任何内容
    Preview,
    /// 从磁盘重建目录
    Rebuild,
    /// 把未整理的文件导入为规范布局
    Adopt,
    /// 修改拍摄时间或评分
    Edit {
        #[arg(long, required = true, num_args = 1..)]
        id: Vec<i64>,
        /// 拍摄时间，格式 "YYYY:MM:DD HH:MM:SS"
        #[arg(long, conflicts_with = "rating")]
        date: Option<String>,
        #[arg(long)]
        rating: Option<u8>,
    },
    /// 移到回收站
    Delete {
        #[arg(long, required = true, num_args = 1..)]
        id: Vec<i64>,
    },
    /// 从回收站恢复（墓碑 id）
    Restore {
        #[arg(long, required = true, num_args = 1..)]
        id: Vec<i64>,
    },
    /// 未完成的操作、缓存统计与重复审计
    Status,
    /// 列出所有条目
    List,
    /// 列出回收站
    Trash,
    /// 清理过期的操作记录与缓存
    Maintain,
}

/// 初始化日志系统，返回的 guard 需要一直持有
fn init_logging(root: &Path) -> Option<WorkerGuard> {
    let log_dir = get_log_dir(root);
    let config = LogConfig::load(&LibraryLayout::new(root).meta_dir());

    if !config.enabled || std::fs::create_dir_all(&log_dir).is_err() {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return None;
    }

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(config.tracing_level().into())
        .add_directive("sqlx=warn".parse().ok()?);

    let writer = match SizeRotatingWriter::new(&log_dir, config.max_size_mb) {
        Ok(writer) => writer,
        Err(e) => {
            eprintln!("无法创建日志文件: {}", e);
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .try_init();
            return None;
        }
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(writer);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    // 在 debug 模式下也输出到控制台
    #[cfg(debug_assertions)]
    {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false);
        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer);
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    #[cfg(not(debug_assertions))]
    {
        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer);
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    Some(guard)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_change(date: Option<String>, rating: Option<u8>) -> anyhow::Result<MetadataChange> {
    match (date, rating) {
        (Some(date), None) => {
            let taken_at = CaptureTime::parse(&date)
                .with_context(|| format!("无法解析拍摄时间: {}", date))?;
            Ok(MetadataChange::CaptureTime(taken_at))
        }
        (None, Some(rating)) => Ok(MetadataChange::Rating(rating)),
        _ => bail!("需要 --date 或 --rating 之一"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli.root);

    let mut library = Library::open(&cli.root)
        .await
        .with_context(|| format!("无法打开媒体库: {:?}", cli.root))?;

    if !cli.quiet {
        let mut events = library.subscribe(256);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{}", line);
                }
            }
        });
    }

    // Ctrl-C 在文件边界取消当前操作
    let cancel = library.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("收到中断信号，正在取消");
            cancel.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    let result = run(&library, cli.command).await;
    library.close().await;
    result
}

async fn run(library: &Library, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Sync => print_json(&library.synchronize().await?),
        Command::Preview => print_json(&library.preview_sync().await?),
        Command::Rebuild => print_json(&library.rebuild().await?),
        Command::Adopt => print_json(&library.adopt().await?),
        Command::Edit { id, date, rating } => {
            let change = parse_change(date, rating)?;
            if let [single] = id.as_slice() {
                print_json(&library.edit_metadata(*single, change).await?)
            } else {
                print_json(&library.edit_metadata_bulk(&id, change).await?)
            }
        }
        Command::Delete { id } => print_json(&library.delete_entries(&id).await?),
        Command::Restore { id } => print_json(&library.restore_entries(&id).await?),
        Command::Status => print_json(&serde_json::json!({
            "root": library.root(),
            "entries": library.entries().await?.len(),
            "incompleteOperations": library.incomplete_operations().await?,
            "hashCache": library.hash_cache_stats().await,
            "identityViolations": library.audit_duplicates().await?,
            "sharedContent": library.shared_content().await?,
        })),
        Command::List => print_json(&library.entries().await?),
        Command::Trash => print_json(&library.deleted_entries().await?),
        Command::Maintain => {
            let removed = library.cleanup_operations().await?;
            print_json(&serde_json::json!({ "removedOperations": removed }))
        }
    }
}
