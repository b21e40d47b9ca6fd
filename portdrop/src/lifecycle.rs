//! Lifecycle manager: drives startup through the [`Backend`], waits for a
//! control event and drains.
//!
//! Kernel resources are held as a stack, collection first and attachment on
//! top. Every exit path (failed startup, drain, drop) unwinds that stack from
//! the top and only releases what was actually acquired.

use std::fmt;

use portdrop_common::PortValue;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    ebpf::{
        Backend,
        artifact::ArtifactSource,
        attach::AttachRequest,
        collection::CollectionNames,
    },
    error::{PortDropError, Result},
    runtime::conf::Conf,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything startup needs, resolved from configuration up front.
#[derive(Debug, Clone)]
pub struct StartupPlan {
    pub source: ArtifactSource,
    pub names: CollectionNames,
    pub attach: AttachRequest,
    pub port: PortValue,
}

impl StartupPlan {
    pub fn from_conf(conf: &Conf) -> Self {
        Self {
            source: ArtifactSource::resolve(conf.object.as_deref()),
            names: CollectionNames {
                program: conf.program.clone(),
                table: conf.table.clone(),
            },
            attach: AttachRequest {
                interface: conf.interface.clone(),
                mode: conf.xdp_mode,
                marker_dir: conf.state_dir.clone(),
                pin_dir: conf.pin_path.clone(),
            },
            port: conf.port,
        }
    }
}

/// Requests delivered to a running lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Stop filtering and release everything. Carries the trigger, e.g. `SIGTERM`.
    Shutdown(String),
    /// Write a new port into the shared table.
    Republish(PortValue),
}

/// Outcome of unwinding the resource stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub detached: bool,
    pub released: bool,
    /// Failures logged and skipped while releasing.
    pub errors: Vec<String>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct Lifecycle<B: Backend> {
    backend: B,
    state: LifecycleState,
    collection: Option<B::Collection>,
    attachment: Option<B::Attachment>,
    port: Option<PortValue>,
    drained: Option<DrainReport>,
}

impl<B: Backend> Lifecycle<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: LifecycleState::Starting,
            collection: None,
            attachment: None,
            port: None,
            drained: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Last port successfully written to the table.
    pub fn port(&self) -> Option<PortValue> {
        self.port
    }

    /// Runs load, memlock, materialize, clear stale, attach and publish in
    /// that order. On failure everything already acquired is released and the
    /// lifecycle ends in [`LifecycleState::Stopped`].
    pub fn start(&mut self, plan: &StartupPlan) -> Result<()> {
        if self.state != LifecycleState::Starting {
            warn!(
                event.name = "lifecycle.start_refused",
                lifecycle.state = %self.state,
                "start called outside of the starting state"
            );
            return Err(PortDropError::NotStartable(self.state.as_str()));
        }

        info!(
            event.name = "lifecycle.starting",
            ebpf.artifact.origin = %plan.source,
            network.interface.name = %plan.attach.interface,
            network.port = plan.port,
            "starting packet filter"
        );

        match self.acquire(plan) {
            Ok(()) => {
                self.state = LifecycleState::Running;
                info!(
                    event.name = "lifecycle.running",
                    network.interface.name = %plan.attach.interface,
                    network.port = plan.port,
                    "dropping tcp traffic to port {} on {}",
                    plan.port,
                    plan.attach.interface
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    event.name = "lifecycle.startup_failed",
                    lifecycle.stage = e.stage(),
                    error.message = %e,
                    "startup failed, releasing acquired resources"
                );
                let report = self.unwind();
                self.state = LifecycleState::Stopped;
                self.drained = Some(report);
                Err(e)
            }
        }
    }

    fn acquire(&mut self, plan: &StartupPlan) -> Result<()> {
        let spec = self.backend.load_artifact(&plan.source)?;
        self.backend.relax_memlock()?;

        let collection = self
            .collection
            .insert(self.backend.materialize(&spec, &plan.names)?);

        if self.backend.clear_stale(&plan.attach)? {
            info!(
                event.name = "lifecycle.stale_attachment_cleared",
                network.interface.name = %plan.attach.interface,
                "previous run did not drain cleanly"
            );
        }

        self.attachment = Some(self.backend.attach(collection, &plan.attach)?);

        self.backend.write_port(collection, plan.port)?;
        self.port = Some(plan.port);
        Ok(())
    }

    /// Writes a new port while running. Outside `Running` the request is ignored.
    pub fn publish(&mut self, port: PortValue) -> Result<()> {
        let (LifecycleState::Running, Some(collection)) = (self.state, self.collection.as_mut())
        else {
            debug!(
                event.name = "lifecycle.publish_ignored",
                lifecycle.state = %self.state,
                network.port = port,
                "not running, ignoring port update"
            );
            return Ok(());
        };

        self.backend.write_port(collection, port)?;
        self.port = Some(port);
        Ok(())
    }

    /// Reads the port currently stored in the table, if a collection is held.
    pub fn read_port(&mut self) -> Result<Option<PortValue>> {
        match self.collection.as_mut() {
            Some(collection) => self.backend.read_port(collection).map(Some),
            None => Ok(None),
        }
    }

    /// Blocks until a shutdown arrives, applying port updates in between,
    /// then drains. A closed channel is treated as a shutdown.
    pub async fn run_until(&mut self, events: &mut mpsc::Receiver<ControlEvent>) -> DrainReport {
        while self.state == LifecycleState::Running {
            match events.recv().await {
                Some(ControlEvent::Shutdown(reason)) => return self.drain(&reason),
                Some(ControlEvent::Republish(port)) => {
                    // The previous value stays in effect when the write fails.
                    if let Err(e) = self.publish(port) {
                        error!(
                            event.name = "lifecycle.republish_failed",
                            network.port = port,
                            error.message = %e,
                            "failed to update blocked port"
                        );
                    }
                }
                None => return self.drain("control channel closed"),
            }
        }
        self.drain("not running")
    }

    /// Detaches, then releases the collection. Only the first call does any
    /// work; later calls return the first report.
    pub fn drain(&mut self, reason: &str) -> DrainReport {
        if let Some(report) = &self.drained {
            debug!(
                event.name = "lifecycle.drain_skipped",
                reason = %reason,
                "already drained"
            );
            return report.clone();
        }

        self.state = LifecycleState::Draining;
        info!(
            event.name = "lifecycle.drain_started",
            reason = %reason,
            "draining packet filter"
        );

        let report = self.unwind();
        self.state = LifecycleState::Stopped;

        info!(
            event.name = "lifecycle.stopped",
            lifecycle.detached = report.detached,
            lifecycle.released = report.released,
            lifecycle.errors = report.errors.len(),
            "packet filter stopped"
        );
        self.drained = Some(report.clone());
        report
    }

    fn unwind(&mut self) -> DrainReport {
        let mut report = DrainReport::default();

        if let (Some(attachment), Some(collection)) =
            (self.attachment.take(), self.collection.as_mut())
        {
            match self.backend.detach(collection, attachment) {
                Ok(()) => report.detached = true,
                Err(e) => {
                    warn!(
                        event.name = "lifecycle.detach_failed",
                        error.message = %e,
                        "failed to detach, continuing"
                    );
                    report.errors.push(e.to_string());
                }
            }
        }

        if let Some(collection) = self.collection.take() {
            self.backend.release(collection);
            report.released = true;
        }

        report
    }
}

impl<B: Backend> Drop for Lifecycle<B> {
    fn drop(&mut self) {
        if self.collection.is_some() || self.attachment.is_some() {
            warn!(
                event.name = "lifecycle.dropped_while_holding",
                lifecycle.state = %self.state,
                "lifecycle dropped without draining, releasing kernel resources"
            );
            self.unwind();
            self.state = LifecycleState::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::ebpf::attach::XdpMode;

    #[test]
    fn plan_follows_configuration() {
        let conf = Conf {
            port: 8080,
            interface: "veth1".to_string(),
            object: Some(PathBuf::from("/opt/filter.o")),
            xdp_mode: XdpMode::Driver,
            pin_path: Some(PathBuf::from("/sys/fs/bpf/pd")),
            state_dir: None,
            ..Conf::default()
        };

        let plan = StartupPlan::from_conf(&conf);

        assert_eq!(plan.port, 8080);
        assert_eq!(plan.names.program, "drop_tcp_port");
        assert_eq!(plan.names.table, "port_map");
        assert_eq!(plan.attach.interface, "veth1");
        assert_eq!(plan.attach.mode, XdpMode::Driver);
        assert_eq!(
            plan.attach.pin_path(),
            Some(PathBuf::from("/sys/fs/bpf/pd/veth1_xdp"))
        );
        assert_eq!(plan.attach.marker_path(), None);
        assert!(
            matches!(&plan.source, ArtifactSource::File(p) if p == &PathBuf::from("/opt/filter.o"))
        );
    }

    #[test]
    fn default_plan_arms_marker_without_pinning() {
        let plan = StartupPlan::from_conf(&Conf::default());
        assert_eq!(plan.port, 4040);
        assert_eq!(plan.attach.pin_path(), None);
        assert_eq!(
            plan.attach.marker_path(),
            Some(PathBuf::from("/run/portdrop/eth0.armed"))
        );
    }

    #[test]
    fn state_labels() {
        assert_eq!(LifecycleState::Draining.to_string(), "draining");
        assert!(DrainReport::default().is_clean());
    }
}
