use std::process::ExitCode;

use portdrop::{
    ebpf::AyaBackend,
    error::PortDropError,
    lifecycle::{Lifecycle, StartupPlan},
    runtime::{Runtime, capabilities, logging, signals},
};
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(PortDropError::from(e).exit_code());
        }
    };
    let Runtime { conf, .. } = runtime;

    logging::init(conf.log_level);
    info!(
        event.name = "portdrop.config_loaded",
        config.path = ?conf.config_path,
        network.interface.name = %conf.interface,
        network.port = conf.port,
        "configuration loaded"
    );

    capabilities::preflight();

    let plan = StartupPlan::from_conf(&conf);

    let (tx, mut rx) = mpsc::channel(8);
    let _signals = match signals::forward_signals(conf, tx) {
        Ok(handle) => handle,
        Err(e) => return fail(&e),
    };

    let mut lifecycle = Lifecycle::new(AyaBackend);
    if let Err(e) = lifecycle.start(&plan) {
        return fail(&e);
    }

    let report = lifecycle.run_until(&mut rx).await;
    if !report.is_clean() {
        error!(
            event.name = "portdrop.drain_incomplete",
            errors = ?report.errors,
            "drain finished with errors"
        );
    }

    ExitCode::SUCCESS
}

fn fail(e: &PortDropError) -> ExitCode {
    error!(
        event.name = "portdrop.startup_failed",
        lifecycle.stage = e.stage(),
        error.message = %e,
        "portdrop failed to start"
    );
    ExitCode::from(e.exit_code())
}
