use clap::{Parser, Subcommand};
use std::path::PathBuf;
use syncengine_lib::commands::{log, sync, transfer};
use syncengine_lib::core::{ProgressReporter, ProgressUpdate};
use syncengine_lib::AppState;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "syncengine", version, about = "多目标文件同步与备份")]
struct Cli {
    /// 数据目录（数据库、日志、缓存），默认使用系统配置目录
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 按选项文件执行同步
    Sync {
        options: PathBuf,
        /// 只输出计划，不修改任何文件
        #[arg(long)]
        preview: bool,
    },
    /// 列出传输任务
    Tasks,
    /// 从云端存储按对象 id 下载
    Fetch {
        storage: PathBuf,
        object_id: String,
        destination: PathBuf,
        #[arg(long)]
        encryption: Option<PathBuf>,
    },
    /// 恢复暂停或中断的下载任务
    Resume {
        task_id: String,
        #[arg(long)]
        encryption: Option<PathBuf>,
    },
    /// 取消传输任务
    Cancel { task_id: String },
    /// 设置全局下载限速（字节/秒，0 为不限速）
    SpeedLimit { bytes_per_sec: u64 },
    /// 查看或修改日志配置
    LogConfig {
        #[arg(long)]
        level: Option<String>,
        #[arg(long)]
        max_size_mb: Option<u32>,
        #[arg(long)]
        enabled: Option<bool>,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli, mut state: AppState) -> anyhow::Result<()> {
    match cli.command {
        Command::Sync { options, preview } => {
            let options = sync::load_options(&options).map_err(anyhow::Error::msg)?;
            if preview {
                let plan = sync::preview_sync(&state, &options)
                    .await
                    .map_err(anyhow::Error::msg)?;
                for line in sync::describe_plan(&plan) {
                    println!("{}", line);
                }
                return Ok(());
            }

            let (tx, mut rx) = mpsc::channel::<ProgressUpdate>(64);
            let printer = tokio::spawn(async move {
                while let Some(update) = rx.recv().await {
                    if update.is_info() {
                        eprintln!("{}", update.message);
                    } else {
                        eprintln!(
                            "[{:5.1}%] {} ({} B/s, 剩余 {}s)",
                            update.percent, update.message, update.speed, update.eta
                        );
                    }
                }
            });

            let engine = state.engine.clone();
            let ctrl_c = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    engine.cancel();
                }
            });

            let report = sync::run_sync(&state, &options, ProgressReporter::new(tx)).await;
            ctrl_c.abort();
            let _ = printer.await;
            print_json(&report.map_err(anyhow::Error::msg)?)
        }
        Command::Tasks => print_json(&transfer::list_tasks(&state).await),
        Command::Fetch {
            storage,
            object_id,
            destination,
            encryption,
        } => {
            let id = transfer::fetch_object(
                &state,
                &storage,
                &object_id,
                destination,
                encryption.as_deref(),
            )
            .await
            .map_err(anyhow::Error::msg)?;
            println!("任务 {}", id);
            print_json(&transfer::wait_task(&state, &id).await.map_err(anyhow::Error::msg)?)
        }
        Command::Resume { task_id, encryption } => {
            transfer::resume_task(&state, &task_id, encryption.as_deref())
                .await
                .map_err(anyhow::Error::msg)?;
            print_json(&transfer::wait_task(&state, &task_id).await.map_err(anyhow::Error::msg)?)
        }
        Command::Cancel { task_id } => transfer::cancel_task(&state, &task_id)
            .await
            .map_err(anyhow::Error::msg),
        Command::SpeedLimit { bytes_per_sec } => {
            transfer::set_speed_limit(&mut state, bytes_per_sec).map_err(anyhow::Error::msg)
        }
        Command::LogConfig {
            level,
            max_size_mb,
            enabled,
        } => {
            let config = if level.is_none() && max_size_mb.is_none() && enabled.is_none() {
                log::get_log_config(&state)
            } else {
                log::set_log_config(&state, enabled, max_size_mb, level.as_deref())
                    .map_err(anyhow::Error::msg)?
            };
            print_json(&config)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(syncengine_lib::config::resolve_data_dir);

    let _guard = syncengine_lib::logging::init(&data_dir);
    tracing::info!("数据目录: {:?}", data_dir);

    let state = AppState::with_dir(&data_dir).await?;
    let result = run(cli, state.clone()).await;
    state.cleanup().await;
    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }
    result
}
