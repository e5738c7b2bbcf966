//! # Container Lifecycle Manager
//!
//! Starts committed images through a [`ContainerRuntime`], enforces the
//! optional run timeout and reports how each run ended.
//!
//! ## Attribute Rules
//!
//! | Attribute      | Accepted values       | Otherwise                         |
//! |----------------|-----------------------|-----------------------------------|
//! | `jag.disabled` | present (any value)   | absent: normal run                |
//! | `jag.timeout`  | integer seconds, > 0  | logged at `error`, treated absent |
//!
//! A timeout only takes effect in disabled mode. Without it the timeout is
//! logged as ineffective and the container runs unbounded.
//!
//! ## Outcomes
//!
//! [`RunOutcome`] is terminal: a non-zero exit code or a timeout is logged,
//! never returned to the caller as an error.

use crate::constants::{ATTR_DISABLED, ATTR_TIMEOUT};
use crate::error::{Error, Result};
use crate::registry::{Attributes, ContainerRegistry, RegistryEntry};
use crate::runtime::{ContainerRuntime, ProcessId};
use crate::storage::{ImageId, ImagePin};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

// =============================================================================
// Run Settings
// =============================================================================

/// Run options decoded from container attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSettings {
    /// The container needs the network to itself.
    pub disabled: bool,
    /// Effective timeout. Only ever set in disabled mode.
    pub timeout: Option<Duration>,
}

impl RunSettings {
    /// Decodes attributes, logging rejected or ineffective values.
    pub fn from_attributes(attributes: &Attributes, label: &str) -> Self {
        let disabled = attributes.contains_key(ATTR_DISABLED);

        let timeout = attributes.get(ATTR_TIMEOUT).and_then(|value| {
            match value.as_i64() {
                Some(secs) if secs > 0 => Some(Duration::from_secs(secs as u64)),
                _ => {
                    error!(container = %label, value = %value, "invalid container timeout ignored");
                    None
                }
            }
        });

        let timeout = match timeout {
            Some(t) if !disabled => {
                warn!(
                    container = %label,
                    timeout_secs = t.as_secs(),
                    "container timeout is ineffective without disabled mode"
                );
                None
            }
            other => other,
        };

        Self { disabled, timeout }
    }
}

/// Reports whether the attributes request disabled mode.
pub fn is_disabled(attributes: &Attributes) -> bool {
    attributes.contains_key(ATTR_DISABLED)
}

// =============================================================================
// Instances
// =============================================================================

/// A started container.
///
/// Holds a pin on its image until dropped, so neither replacement nor
/// uninstall can remove the executable from under it.
#[derive(Debug)]
pub struct Instance {
    process: ProcessId,
    image: ImagePin,
    label: String,
    settings: RunSettings,
    started_at: Instant,
    started_wall: chrono::DateTime<chrono::Utc>,
}

impl Instance {
    pub fn image(&self) -> &ImageId {
        self.image.id()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.settings.timeout
    }

    pub fn is_disabled(&self) -> bool {
        self.settings.disabled
    }

    /// Wall-clock start time.
    pub fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.started_wall
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The container exited on its own.
    Exited(i32),
    /// The timeout fired and the container was stopped.
    TimedOut { elapsed: Duration },
    /// The runtime lost track of the container.
    Failed(String),
}

// =============================================================================
// Lifecycle Manager
// =============================================================================

/// Starts and supervises container instances.
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<ContainerRegistry>,
}

impl LifecycleManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, registry: Arc<ContainerRegistry>) -> Self {
        Self { runtime, registry }
    }

    /// Starts `image` under `label`.
    pub async fn run(&self, image: &ImageId, attributes: &Attributes, label: &str) -> Result<Instance> {
        let settings = RunSettings::from_attributes(attributes, label);
        let images = self.registry.images();
        let pin = images.pin(image);
        if !images.has_image(image) {
            return Err(Error::ImageNotFound(image.to_string()));
        }
        let path = images.image_path(image);

        let process = self.runtime.start(&path, label).await?;
        info!(
            container = %label,
            image = %image.short(),
            runtime = %self.runtime.name(),
            disabled = settings.disabled,
            "container started"
        );

        Ok(Instance {
            process,
            image: pin,
            label: label.to_string(),
            settings,
            started_at: Instant::now(),
            started_wall: chrono::Utc::now(),
        })
    }

    /// Waits for `instance` to finish, stopping it once `timeout` elapses.
    pub async fn run_to_completion(&self, instance: Instance, timeout: Option<Duration>) -> RunOutcome {
        let waited = match timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.runtime.wait(instance.process)).await {
                    Ok(result) => Some(result),
                    Err(_) => None,
                }
            }
            None => Some(self.runtime.wait(instance.process).await),
        };

        let outcome = match waited {
            Some(Ok(code)) => RunOutcome::Exited(code),
            Some(Err(e)) => RunOutcome::Failed(e.to_string()),
            None => {
                if let Err(e) = self.runtime.stop(instance.process).await {
                    debug!(container = %instance.label, error = %e, "stop after timeout failed");
                }
                if let Err(e) = self.runtime.wait(instance.process).await {
                    debug!(container = %instance.label, error = %e, "reap after timeout failed");
                }
                RunOutcome::TimedOut {
                    elapsed: instance.elapsed(),
                }
            }
        };

        debug!(
            container = %instance.label,
            image = %instance.image().short(),
            started_at = %instance.started_at().to_rfc3339(),
            "run finished"
        );
        match &outcome {
            RunOutcome::Exited(0) => {
                info!(container = %instance.label, "container exited with code 0")
            }
            RunOutcome::Exited(code) => {
                error!(container = %instance.label, code = *code, "container exited with non-zero code")
            }
            RunOutcome::TimedOut { elapsed } => warn!(
                container = %instance.label,
                elapsed_ms = elapsed.as_millis() as u64,
                "container timed out"
            ),
            RunOutcome::Failed(reason) => {
                error!(container = %instance.label, reason = %reason, "container lost")
            }
        }

        drop(instance);
        self.registry.sweep().await;
        outcome
    }

    /// Runs `instance` to completion on a background task.
    pub fn spawn_to_completion(self: &Arc<Self>, instance: Instance) {
        let manager = Arc::clone(self);
        let timeout = instance.timeout();
        tokio::spawn(async move {
            manager.run_to_completion(instance, timeout).await;
        });
    }

    /// Starts every installed container.
    ///
    /// Disabled-mode containers are joined before this returns, so none of
    /// them overlaps with the first serve cycle. The others keep running in
    /// the background.
    pub async fn replay(self: &Arc<Self>, entries: Vec<RegistryEntry>) {
        let mut barrier = JoinSet::new();

        for entry in entries {
            let instance = match self.run(&entry.image, &entry.attributes, &entry.name).await {
                Ok(instance) => instance,
                Err(e) => {
                    error!(container = %entry.name, error = %e, "failed to start installed container");
                    continue;
                }
            };

            if instance.is_disabled() {
                let manager = Arc::clone(self);
                let timeout = instance.timeout();
                barrier.spawn(async move { manager.run_to_completion(instance, timeout).await });
            } else {
                self.spawn_to_completion(instance);
            }
        }

        if !barrier.is_empty() {
            info!(count = barrier.len(), "waiting for disabled-mode containers before serving");
        }
        while let Some(joined) = barrier.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "disabled-mode container task failed");
            }
        }
    }
}
