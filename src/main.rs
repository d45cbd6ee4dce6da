use anyhow::Context;
use clap::{Parser, Subcommand};
use drive_transfer::{
    config::LogConfig, logging, AccountHint, AccountType, AppConfig, DownloadTarget,
    DriveService, JsonCredentialStore, ProgressTask, ReqwestTransport, UploadOptions,
    UploadSource, VariantDownload,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// 远程存储传输工具
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config/app.toml")]
    config: String,

    /// 使用指定ID的账号（默认按用途自动选择）
    #[arg(short, long, global = true)]
    account: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 查看文件元数据
    Info {
        /// 文件链接或ID
        remote: String,
    },
    /// 下载文件（支持断点续传）
    Download {
        remote: String,
        /// 保存目录（默认使用配置中的下载目录）
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// 上传一个或多个文件
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// 目标文件夹ID
        #[arg(short, long)]
        folder: Option<String>,
    },
    /// 获取访问令牌
    Token {
        #[arg(short = 't', long = "type", default_value = "download")]
        account_type: AccountType,
    },
    /// 列出视频的可用清晰度
    Variants { remote: String },
    /// 下载最高清晰度的视频
    Video {
        remote: String,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

/// 加载日志配置
///
/// 尝试从配置文件加载，失败时返回默认配置
async fn load_log_config(config_path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(config_path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }

    LogConfig::default()
}

/// 进度写入日志
fn log_progress<T: Send + 'static>(label: &str, task: &ProgressTask<T>) {
    let label = label.to_string();
    task.on_progress(move |p| info!("{}: {:.1}%", label, p * 100.0));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_config = load_log_config(&args.config).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("Drive Transfer v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(&args.config).await;
    let store = JsonCredentialStore::open(&config.auth.credentials_file)
        .await
        .with_context(|| format!("无法打开凭证文件: {:?}", config.auth.credentials_file))?;
    let transport = ReqwestTransport::new(&config.drive).context("创建HTTP客户端失败")?;
    let download_dir = config.download.download_dir.clone();
    let service = DriveService::new(config, Arc::new(store), Arc::new(transport));

    let hint = match args.account {
        Some(id) => AccountHint::Id(id),
        None => AccountHint::Auto,
    };

    if let Err(e) = run(&service, args.command, hint, download_dir).await {
        error!("执行失败: {:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(
    service: &DriveService,
    command: Command,
    hint: AccountHint,
    download_dir: PathBuf,
) -> anyhow::Result<()> {
    match command {
        Command::Info { remote } => {
            let file = service.get_file_info(&remote, hint).await?;
            println!("{}", serde_json::to_string_pretty(&file)?);
        }
        Command::Download { remote, out } => {
            let dir = out.unwrap_or(download_dir);
            let task = service.download(&remote, DownloadTarget::Directory(dir), hint);
            log_progress("下载进度", &task);
            let output = task.await?;
            if let Some(path) = output.path() {
                println!("{}", path.display());
            }
        }
        Command::Upload { files, folder } => {
            if files.len() == 1 {
                let source = UploadSource::Path(files[0].clone());
                let task = service.upload(source, UploadOptions::in_folder(folder), hint);
                log_progress("上传进度", &task);
                let file = task.await?;
                println!("{}", file.id);
            } else {
                let task = service.upload_many(files, folder, hint);
                log_progress("批量上传进度", &task);
                let result = task.await?;
                for file in &result.succeeded {
                    println!("{}\t{}", file.remote_id, file.name);
                }
                for failed in &result.failed {
                    error!("上传失败: {} ({})", failed.name, failed.error);
                }
                if !result.is_complete() {
                    anyhow::bail!("{} 个文件上传失败", result.failed.len());
                }
            }
        }
        Command::Token { account_type } => {
            let token = service.get_access_token(hint, account_type).await?;
            println!("{}", token);
        }
        Command::Variants { remote } => {
            let info = service.get_stream_variants(&remote).await?;
            println!("{}", serde_json::to_string_pretty(&info.variants)?);
        }
        Command::Video { remote, out } => {
            let request = VariantDownload {
                remote_ref: remote,
                location: out,
                resolved: None,
            };
            let task = service.download_variant(request, hint);
            log_progress("视频下载进度", &task);
            let path = task.await?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
