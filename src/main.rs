use anyhow::{bail, Context, Result};
use livesync_lib::core::{JsonFileStore, Persistence, RefreshTarget};
use livesync_lib::logging::{get_app_dir, init_logging};
use livesync_lib::{ConfigProvider, ConnectionRegistry, RusshConnector, SyncEngine, SyncSettings, WorkspaceConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

const USAGE: &str = "用法: livesync <工作区配置.json> [compare \
                     | upload|force-upload|download|delete-remote|delete-local <根目录名> <相对路径> \
                     | rename <根目录名> <原路径> <新路径>]";

enum Action {
    Compare,
    Upload(String, String),
    ForceUpload(String, String),
    Rename(String, String, String),
    Download(String, String),
    DeleteRemote(String, String),
    DeleteLocal(String, String),
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<(PathBuf, Action)> {
    let Some(workspace) = args.next() else {
        bail!(USAGE);
    };
    let command = args.next().unwrap_or_else(|| "compare".to_string());
    if command == "compare" {
        return Ok((PathBuf::from(workspace), Action::Compare));
    }
    let (Some(root), Some(path)) = (args.next(), args.next()) else {
        bail!(USAGE);
    };
    let action = match command.as_str() {
        "upload" => Action::Upload(root, path),
        "force-upload" => Action::ForceUpload(root, path),
        "rename" => match args.next() {
            Some(to) => Action::Rename(root, path, to),
            None => bail!(USAGE),
        },
        "download" => Action::Download(root, path),
        "delete-remote" => Action::DeleteRemote(root, path),
        "delete-local" => Action::DeleteLocal(root, path),
        other => bail!("未知命令: {}\n{}", other, USAGE),
    };
    Ok((PathBuf::from(workspace), action))
}

async fn run(engine: &SyncEngine, action: Action) -> Result<()> {
    let target: RefreshTarget = match action {
        Action::Compare => {
            let summary = engine.compare_all().await?;
            println!(
                "新增 {}  删除 {}  修改 {}  未变 {}",
                summary.added, summary.removed, summary.modified, summary.unchanged
            );
            return Ok(());
        }
        Action::Upload(root, path) => engine.upload_checked(&root, &path).await?,
        Action::ForceUpload(root, path) => engine.upload(&root, &path).await?,
        Action::Rename(root, from, to) => engine.rename(&root, &from, &to).await?,
        Action::Download(root, path) => engine.download(&root, &path).await?,
        Action::DeleteRemote(root, path) => engine.delete_remote(&root, &path).await?,
        Action::DeleteLocal(root, path) => engine.delete_local(&root, &path).await?,
    };
    if let Some(node) = engine.find(&target.root, &target.relative_path).await {
        println!("{}/{}: {:?}", target.root, target.relative_path, node.status());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let app_dir = get_app_dir();
    init_logging(&app_dir);

    let (workspace_path, action) = parse_args(std::env::args().skip(1))?;
    let workspace_path = workspace_path
        .canonicalize()
        .with_context(|| format!("找不到工作区配置 {:?}", workspace_path))?;
    let workspace = WorkspaceConfig::load(&workspace_path)?;
    let settings = SyncSettings::load(&app_dir);

    let connection = workspace.resolved_connection()?;
    let registry = ConnectionRegistry::new(Arc::new(RusshConnector::new()), settings.clone());
    let connections = registry
        .get(&connection)
        .await
        .with_context(|| format!("无法连接 {}", connection.address()))?;

    let store = JsonFileStore::new(&app_dir.join("workspaces"), &workspace_path.to_string_lossy());
    info!("状态目录: {:?}", store.dir());
    let engine = SyncEngine::new(
        Arc::new(workspace),
        connections,
        settings,
        Persistence::new(Arc::new(store)),
    );
    engine.load_state().await?;

    let result = run(&engine, action).await;
    if let Err(e) = &result {
        error!("执行失败: {:#}", e);
    }
    engine.shutdown().await;
    registry.shutdown().await;
    result
}
