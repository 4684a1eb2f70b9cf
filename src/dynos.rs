//! Local worker supervisor for `--dynos N`.
//!
//! Starts N copies of this binary as `olo queue <name> --run`, each with its
//! own connection pool and worker tag, and waits for them. Ctrl-C stops the
//! supervisor and kills the children.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tokio::process::{Child, Command};

use crate::queue::QueueKind;
use crate::runner::Operation;

/// What each child process runs.
#[derive(Debug, Clone)]
pub struct DynoSpec {
    pub config_path: PathBuf,
    pub queue: QueueKind,
    pub op: Option<Operation>,
    pub chunk: Option<usize>,
    pub rescrape: bool,
}

impl DynoSpec {
    pub fn child_args(&self) -> Vec<String> {
        let mut args = vec![
            "--config".to_string(),
            self.config_path.display().to_string(),
            "queue".to_string(),
            self.queue.name().to_string(),
            "--run".to_string(),
        ];
        if let Some(op) = self.op {
            args.push("--op".to_string());
            args.push(op.to_string());
        }
        if let Some(chunk) = self.chunk {
            args.push("--chunk".to_string());
            args.push(chunk.to_string());
        }
        if self.rescrape {
            args.push("--rescrape".to_string());
        }
        args
    }
}

fn spawn_child(spec: &DynoSpec, index: usize) -> Result<Child> {
    let exe = std::env::current_exe().context("Failed to locate the olo executable")?;
    let child = Command::new(exe)
        .args(spec.child_args())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start worker {}", index))?;
    tracing::info!(worker = index, pid = child.id(), queue = %spec.queue, "worker started");
    Ok(child)
}

async fn wait_all(children: Vec<Child>) -> Result<()> {
    let mut failed = 0;
    for (index, mut child) in children.into_iter().enumerate() {
        let status = child.wait().await?;
        if status.success() {
            tracing::info!(worker = index, "worker exited");
        } else {
            tracing::warn!(worker = index, status = %status, "worker exited with failure");
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{} worker(s) exited with failure", failed);
    }
    Ok(())
}

/// Run `n` workers until they all exit or Ctrl-C.
pub async fn run_dynos(spec: &DynoSpec, n: usize) -> Result<()> {
    if n == 0 {
        bail!("--dynos must be at least 1");
    }
    let children = (0..n)
        .map(|i| spawn_child(spec, i))
        .collect::<Result<Vec<_>>>()?;
    println!("Started {} {} worker(s). Ctrl-C to stop.", n, spec.queue);

    tokio::select! {
        result = wait_all(children) => result,
        _ = tokio::signal::ctrl_c() => {
            println!("Stopping workers.");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_args_carry_queue_options() {
        let spec = DynoSpec {
            config_path: PathBuf::from("/etc/olo.toml"),
            queue: QueueKind::Pages,
            op: Some(Operation::Scrape),
            chunk: Some(25),
            rescrape: true,
        };
        assert_eq!(
            spec.child_args(),
            vec![
                "--config", "/etc/olo.toml", "queue", "pages", "--run", "--op", "scrape", "--chunk", "25",
                "--rescrape"
            ]
        );
    }
}
