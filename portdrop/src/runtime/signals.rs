//! Turns OS signals into [`ControlEvent`]s.
//!
//! - SIGINT / SIGTERM: shutdown
//! - SIGHUP: reload the config file and republish the port
//!
//! Handlers are installed before startup and stay installed until the process
//! exits, so a repeated SIGINT during the drain is swallowed instead of
//! killing the process halfway.

use tokio::{
    signal::unix::{Signal, SignalKind, signal},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{PortDropError, Result},
    lifecycle::ControlEvent,
    runtime::conf::Conf,
};

struct Handlers {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
}

impl Handlers {
    fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).map_err(PortDropError::Signal)?,
            terminate: signal(SignalKind::terminate()).map_err(PortDropError::Signal)?,
            hangup: signal(SignalKind::hangup()).map_err(PortDropError::Signal)?,
        })
    }
}

/// Installs the handlers and spawns the task forwarding them to `tx`.
///
/// `conf` is the running configuration; SIGHUP reloads on top of it.
pub fn forward_signals(conf: Conf, tx: mpsc::Sender<ControlEvent>) -> Result<JoinHandle<()>> {
    let mut handlers = Handlers::install()?;
    let mut conf = conf;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = handlers.interrupt.recv() => deliver_shutdown(&tx, "SIGINT").await,
                Some(()) = handlers.terminate.recv() => deliver_shutdown(&tx, "SIGTERM").await,
                Some(()) = handlers.hangup.recv() => {
                    if let Some(port) = reload(&mut conf) {
                        deliver_republish(&tx, port);
                    }
                }
                else => break,
            }
        }
    }))
}

/// Waits for channel capacity: a shutdown must reach the lifecycle even when
/// republish events are queued ahead of it.
async fn deliver_shutdown(tx: &mpsc::Sender<ControlEvent>, signal: &str) {
    info!(
        event.name = "signals.shutdown_requested",
        signal = signal,
        "received {signal}, shutting down"
    );
    if tx.send(ControlEvent::Shutdown(signal.to_string())).await.is_err() {
        debug!(
            event.name = "signals.event_dropped",
            signal = signal,
            "shutdown not delivered, lifecycle is no longer listening"
        );
    }
}

/// A newer SIGHUP supersedes a republish that does not fit in the queue.
fn deliver_republish(tx: &mpsc::Sender<ControlEvent>, port: u16) {
    if let Err(e) = tx.try_send(ControlEvent::Republish(port)) {
        debug!(
            event.name = "signals.event_dropped",
            network.port = port,
            error.message = %e,
            "republish not delivered"
        );
    }
}

/// Reloads the config file into `conf` and returns the port to publish.
///
/// Only the port is applied live; other changes are reported and take effect
/// after a restart.
pub(crate) fn reload(conf: &mut Conf) -> Option<u16> {
    info!(
        event.name = "signals.reload_requested",
        "received SIGHUP, reloading configuration"
    );

    let reloaded = match conf.reload() {
        Ok(reloaded) => reloaded,
        Err(e) => {
            error!(
                event.name = "signals.reload_failed",
                error.message = %e,
                "failed to reload configuration, keeping current values"
            );
            return None;
        }
    };

    for key in restart_only_changes(conf, &reloaded) {
        warn!(
            event.name = "signals.reload_ignored_key",
            config.key = key,
            "configuration change requires a restart, ignoring"
        );
    }

    let port = reloaded.port;
    conf.port = port;
    Some(port)
}

fn restart_only_changes(current: &Conf, reloaded: &Conf) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if current.interface != reloaded.interface {
        changed.push("interface");
    }
    if current.object != reloaded.object {
        changed.push("object");
    }
    if current.program != reloaded.program {
        changed.push("program");
    }
    if current.table != reloaded.table {
        changed.push("table");
    }
    if current.xdp_mode != reloaded.xdp_mode {
        changed.push("xdp_mode");
    }
    if current.pin_path != reloaded.pin_path {
        changed.push("pin_path");
    }
    if current.state_dir != reloaded.state_dir {
        changed.push("state_dir");
    }
    if current.log_level != reloaded.log_level {
        changed.push("log_level");
    }
    changed
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use figment::Jail;
    use tokio::time::{Duration, timeout};

    use super::*;
    use crate::ebpf::attach::XdpMode;

    #[test]
    fn reload_applies_port_only() {
        Jail::expect_with(|jail| {
            jail.create_file("portdrop.yaml", "port: 4040\n")?;
            let mut conf = Conf {
                config_path: Some(PathBuf::from("portdrop.yaml")),
                ..Conf::default()
            };

            jail.create_file(
                "portdrop.yaml",
                "port: 9090\ninterface: wlan0\nxdp_mode: driver\n",
            )?;
            assert_eq!(reload(&mut conf), Some(9090));
            assert_eq!(conf.port, 9090);
            assert_eq!(conf.interface, "eth0");
            assert_eq!(conf.xdp_mode, XdpMode::Skb);

            Ok(())
        });
    }

    #[test]
    fn reload_without_file_keeps_port() {
        let mut conf = Conf {
            port: 1234,
            ..Conf::default()
        };
        assert_eq!(reload(&mut conf), None);
        assert_eq!(conf.port, 1234);
    }

    #[test]
    fn reload_with_invalid_file_keeps_port() {
        Jail::expect_with(|jail| {
            jail.create_file("portdrop.yaml", "port: 70000\n")?;
            let mut conf = Conf {
                config_path: Some(PathBuf::from("portdrop.yaml")),
                ..Conf::default()
            };
            assert_eq!(reload(&mut conf), None);
            assert_eq!(conf.port, 4040);
            Ok(())
        });
    }

    #[test]
    fn restart_only_keys_are_reported() {
        let current = Conf::default();
        let reloaded = Conf {
            port: 1,
            interface: "lo".to_string(),
            pin_path: Some(PathBuf::from("/sys/fs/bpf/pd")),
            state_dir: None,
            ..Conf::default()
        };
        assert_eq!(
            restart_only_changes(&current, &reloaded),
            vec!["interface", "pin_path", "state_dir"]
        );
    }

    #[tokio::test]
    async fn sigterm_becomes_shutdown() {
        let (tx, mut rx) = mpsc::channel(1);
        // Fill the queue so delivery has to wait for the receiver.
        tx.send(ControlEvent::Republish(80)).await.expect("queue open");
        let task = forward_signals(Conf::default(), tx).expect("handlers install");

        // SAFETY: the handler for SIGTERM is installed above.
        assert_eq!(unsafe { libc::raise(libc::SIGTERM) }, 0);

        let first = timeout(Duration::from_secs(5), rx.recv()).await;
        assert_eq!(first.expect("queued event"), Some(ControlEvent::Republish(80)));
        let second = timeout(Duration::from_secs(5), rx.recv()).await;
        assert_eq!(
            second.expect("shutdown within timeout"),
            Some(ControlEvent::Shutdown("SIGTERM".to_string()))
        );

        task.abort();
    }
}
