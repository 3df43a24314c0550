//! Process-level shutdown plumbing for front-ends embedding the
//! supervisor.

/// Exit code surfaced to the CLI layer on a clean run.
pub const EXIT_OK: i32 = 0;
/// Exit code for user-visible failures (invalid config, start failure
/// with nothing left running).
pub const EXIT_FAILURE: i32 = 1;
/// Exit code after an interrupt-driven shutdown.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Completes when the process receives a termination signal.
///
/// On Unix this covers SIGINT and SIGTERM, with `ctrl_c` as a
/// fallback; elsewhere only `ctrl_c` is awaited. The caller is expected
/// to run [`Supervisor::shutdown`](crate::Supervisor::shutdown) to
/// completion before exiting.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
