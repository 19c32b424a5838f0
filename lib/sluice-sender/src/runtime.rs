//! Dedicated background runtime.
use std::{
    future::Future,
    sync::mpsc,
    thread::{self, JoinHandle},
};

use sluice_error::{generic_error, GenericError};
use tracing::{info_span, Instrument as _};

/// Runs `fut` to completion on a current-thread runtime owned by a new OS thread named `<name>-sup-rt`.
///
/// Returns once the runtime has been built, so a failure to build it is reported to the caller rather than lost on the
/// background thread.
///
/// # Errors
///
/// If the thread cannot be spawned, or the runtime cannot be built, an error is returned.
pub(crate) fn spawn_dedicated<F>(name: &str, fut: F) -> Result<JoinHandle<()>, GenericError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (init_tx, init_rx) = mpsc::sync_channel(1);

    let thread_name = format!("{}-sup-rt", name);
    let span = info_span!("sender", name);
    let handle = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = init_tx.send(Err(generic_error!("Failed to build sender runtime: {}", e)));
                    return;
                }
            };

            if init_tx.send(Ok(())).is_err() {
                return;
            }

            runtime.block_on(fut.instrument(span));
        })
        .map_err(|e| generic_error!("Failed to spawn sender thread '{}': {}", thread_name, e))?;

    match init_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => {
            let _ = handle.join();
            Err(generic_error!(
                "no initialization result received; runtime creation likely panicked"
            ))
        }
    }
}
