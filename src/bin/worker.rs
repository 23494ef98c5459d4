//! Worker process entry point. Launched by a manager with fds 3 and 4
//! already wired up per [`cellnode::config::child_fd`]; fds 0/1/2 are left
//! as plain process stdio (the manager reads them directly, per §4.7).
//!
//! No real language backend exists yet (out of scope, §1), so this binary
//! drives the supervisor with the echo executor — it is enough to exercise
//! the framing, routing, and shutdown/interrupt machinery end to end.

use cellnode::config::child_fd;
use cellnode::exec_env::EchoExecutor;
use cellnode::worker::Supervisor;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        tracing::error!(error = %e, "worker exited with error");
        std::process::exit(1);
    }
}

fn run() -> cellnode::Result<()> {
    let supervisor = Supervisor::from_raw_fds(child_fd::MSG_IN, child_fd::MSG_OUT, EchoExecutor)?;
    supervisor.run_forever();
    Ok(())
}
