//! Script-backed containers.
//!
//! Runs an inline shell script taken from the owning stack's script table.
//! The script is addressed by the host component of the engine string
//! (`shell://web` runs the script named `web`), and that name doubles as
//! the container id once started.

use super::logs::pump;
use super::{
    ContainerConfig, ContainerCore, ContainerError, LogOptions, Requirements, Result,
};
use crate::{env, process};
use futures::Stream;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Named inline scripts shared by a stack's script containers.
pub type Scripts = Arc<BTreeMap<String, String>>;

/// A workload that runs a shell script as a local process.
pub struct ScriptContainer {
    core: ContainerCore,
    script_id: String,
    scripts: Option<Scripts>,
    child: Mutex<Option<Child>>,
}

impl ScriptContainer {
    /// Create a script container.
    ///
    /// `script_id` names the script to run; when empty the container's own
    /// name is used. `scripts` is the owning stack's script table.
    pub fn new(
        config: ContainerConfig,
        script_id: impl Into<String>,
        scripts: Option<Scripts>,
        logs: LogOptions,
    ) -> Self {
        Self {
            core: ContainerCore::new(config, logs),
            script_id: script_id.into(),
            scripts,
            child: Mutex::new(None),
        }
    }

    pub(crate) fn core(&self) -> &ContainerCore {
        &self.core
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.core.validate(Requirements {
            image: false,
            command: false,
        })
    }

    fn script_id(&self) -> String {
        if self.script_id.is_empty() {
            self.core.name()
        } else {
            self.script_id.clone()
        }
    }

    fn resolve_script(&self, id: &str) -> Result<String> {
        let scripts = self.scripts.as_ref().ok_or_else(|| {
            ContainerError::ScriptError("cannot reference script by name without stack".to_string())
        })?;

        scripts
            .get(id)
            .map(|script| script.trim())
            .filter(|script| !script.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ContainerError::ScriptError(format!("unknown script {:?}", id)))
    }

    pub(crate) async fn start(&self) -> Result<()> {
        self.validate()?;

        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Err(ContainerError::Other(format!(
                    "script container {} is already running",
                    self.core.name()
                )));
            }
        }

        let id = self.script_id();
        let content = self.resolve_script(&id)?;
        let config = self.core.config();

        let shell = which::which(env::container::DEFAULT_SHELL)
            .map_err(|e| ContainerError::ScriptError(format!("cannot locate shell: {}", e)))?;

        // $0 is the container name, the configured command becomes $1...
        let mut command = Command::new(shell);
        command
            .arg("-c")
            .arg(&content)
            .arg(&config.name)
            .args(&config.cmd)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        if !config.working_dir.is_empty() {
            command.current_dir(&config.working_dir);
        }

        debug!(container = %config.name, script = %id, "spawning script container");
        let mut child = command.spawn()?;

        let (sender, producers) = self.core.logs().open();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(
                config.name.clone(),
                sender.clone(),
                producers.clone(),
                lines(stdout),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(config.name.clone(), sender, producers, lines(stderr)));
        }

        let pid = child.id();
        info!(container = %config.name, script = %id, pid = ?pid, "started script container");

        // One id per launch, so a restart is visible as an id change.
        self.core.set_id(match pid {
            Some(pid) => format!("{}-{}", id, pid),
            None => id,
        });
        *guard = Some(child);

        Ok(())
    }

    pub(crate) async fn stop(&self) -> Result<()> {
        self.core.logs().close();

        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return Ok(());
        };

        process::terminate(&mut child, env::timing::PROCESS_EXIT_MAX_WAIT).await?;
        self.core.set_id(String::new());
        info!(container = %self.core.name(), "stopped script container");

        Ok(())
    }

    pub(crate) async fn is_running(&self) -> bool {
        let lock = self.child.lock();
        let Ok(mut guard) =
            tokio::time::timeout(env::timing::CONTAINER_INSPECT_TIMEOUT, lock).await
        else {
            return false;
        };

        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub(crate) fn address(&self) -> String {
        self.core.config().target_addr
    }
}

/// Lines of a child's output stream.
fn lines<R>(reader: R) -> impl Stream<Item = String> + Send + 'static
where
    R: AsyncRead + Unpin + Send + 'static,
{
    futures::stream::unfold(BufReader::new(reader).lines(), |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((line, lines)),
            _ => None,
        }
    })
}
