//! Installation steps and the context direct steps work on.

use super::{DispatchError, Direction};
use crate::boss::InstallManager;
use crate::kickstart::{KickstartManager, KickstartReport};
use crate::tasks::{ErrorHandler, Task, TaskQueue};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

/// What a direct step runs. The returned direction replaces the current
/// one unless it is [`Direction::Default`].
pub type StepAction<C> = Arc<dyn Fn(&mut C) -> Result<Direction, DispatchError> + Send + Sync>;

pub struct Step<C> {
    name: String,
    action: Option<StepAction<C>>,
}

impl<C> Clone for Step<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            action: self.action.clone(),
        }
    }
}

impl<C> std::fmt::Debug for Step<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("direct", &self.is_direct())
            .finish()
    }
}

impl<C> Step<C> {
    /// A step shown by the presentation layer.
    pub fn indirect(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: None,
        }
    }

    /// A step the dispatcher runs itself.
    pub fn direct(
        name: impl Into<String>,
        action: impl Fn(&mut C) -> Result<Direction, DispatchError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            action: Some(Arc::new(action)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_direct(&self) -> bool {
        self.action.is_some()
    }

    pub(crate) fn action(&self) -> Option<StepAction<C>> {
        self.action.clone()
    }
}

/// State shared by the direct steps of an installation.
#[derive(Default)]
pub struct InstallContext {
    /// Kickstart to read in the `kickstart` step.
    pub kickstart_path: Option<PathBuf>,
    pub kickstart: Option<Arc<KickstartManager>>,
    /// Report of the last kickstart read.
    pub report: Option<KickstartReport>,
    /// Queue run by the `install` step.
    pub install_queue: Option<Arc<TaskQueue>>,
    /// Collects the install queue from the modules when none was given.
    pub installer: Option<Arc<InstallManager>>,
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
    /// Where the `writeksconfig` step writes the regenerated kickstart.
    pub kickstart_output: Option<PathBuf>,
    pub interactive: bool,
}

impl std::fmt::Debug for InstallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallContext")
            .field("kickstart_path", &self.kickstart_path)
            .field("report", &self.report)
            .field("kickstart_output", &self.kickstart_output)
            .field("interactive", &self.interactive)
            .finish()
    }
}

fn read_kickstart(context: &mut InstallContext) -> Result<Direction, DispatchError> {
    let (Some(path), Some(manager)) = (&context.kickstart_path, &context.kickstart) else {
        info!("No kickstart to read");
        return Ok(Direction::Default);
    };

    let report = manager.read_kickstart_file(path);
    let errors = report.error_messages.len();
    for warning in &report.warning_messages {
        warn!("{}", warning);
    }
    context.report = Some(report);

    if errors > 0 {
        return Err(DispatchError::InvalidKickstart(errors));
    }
    Ok(Direction::Default)
}

fn install(context: &mut InstallContext) -> Result<Direction, DispatchError> {
    if context.install_queue.is_none() {
        if let Some(installer) = &context.installer {
            context.install_queue = Some(Arc::new(installer.install_system_with_task()?));
        }
    }
    let Some(queue) = &context.install_queue else {
        info!("Nothing to install");
        return Ok(Direction::Default);
    };

    if let Some(handler) = &context.error_handler {
        queue.set_error_handler(Arc::clone(handler));
    }
    info!("{}", queue.summary());
    queue.start()?;
    Ok(Direction::Default)
}

fn write_kickstart(context: &mut InstallContext) -> Result<Direction, DispatchError> {
    let (Some(path), Some(manager)) = (&context.kickstart_output, &context.kickstart) else {
        return Ok(Direction::Default);
    };

    let mut text = manager.generate_kickstart()?;
    text.push('\n');
    std::fs::write(path, text).map_err(|source| DispatchError::Io {
        path: path.clone(),
        source,
    })?;
    info!("Wrote the kickstart to {}", path.display());
    Ok(Direction::Default)
}

/// The installer's step list.
pub fn default_steps() -> Vec<Step<InstallContext>> {
    vec![
        Step::direct("kickstart", read_kickstart),
        Step::indirect("language"),
        Step::indirect("keyboard"),
        Step::indirect("network"),
        Step::indirect("storage"),
        Step::indirect("software"),
        Step::indirect("timezone"),
        Step::indirect("users"),
        Step::indirect("summary"),
        Step::direct("install", install),
        Step::direct("writeksconfig", write_kickstart),
        Step::indirect("complete"),
    ]
}
