use std::path::Path;

use thumb_media::check_tool;
use thumb_worker::WorkerConfig;

const REQUIRED_TOOLS: &[&str] = &["ffmpeg", "ffprobe"];
const OPTIONAL_TOOLS: &[&str] = &["pdftoppm", "pdfinfo"];
const REQUIRED_ENV: &[&str] = &["REDIS_URL", "CONTENT_API_URL"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env()?;

    println!(
        "worker-selfcheck: starting with work_dir={}",
        config.work_dir.display()
    );
    ensure_workdir(&config.work_dir).await?;
    ensure_tools()?;
    ensure_env_present(REQUIRED_ENV)?;

    println!("worker-selfcheck: ok");
    Ok(())
}

/// The work dir must exist and accept writes.
async fn ensure_workdir<P: AsRef<Path>>(path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    tokio::fs::create_dir_all(path).await?;
    let probe = path.join(".selfcheck");
    tokio::fs::write(&probe, b"ok")
        .await
        .map_err(|e| anyhow::anyhow!("work dir {} not writable: {}", path.display(), e))?;
    tokio::fs::remove_file(&probe).await?;
    Ok(())
}

fn ensure_tools() -> anyhow::Result<()> {
    for tool in REQUIRED_TOOLS {
        let path = check_tool(tool).map_err(|e| anyhow::anyhow!("{}", e))?;
        println!("worker-selfcheck: {} at {}", tool, path.display());
    }
    for tool in OPTIONAL_TOOLS {
        match check_tool(tool) {
            Ok(path) => println!("worker-selfcheck: {} at {}", tool, path.display()),
            Err(_) => println!("worker-selfcheck: warning: {} not found, PDF thumbnails disabled", tool),
        }
    }
    Ok(())
}

fn ensure_env_present(vars: &[&str]) -> anyhow::Result<()> {
    for var in vars {
        if std::env::var(var).is_err() {
            return Err(anyhow::anyhow!("missing required env var {}", var));
        }
    }
    Ok(())
}
