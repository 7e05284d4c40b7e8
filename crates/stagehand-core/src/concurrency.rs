use stagehand_toolkit::CancelFn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C asks the current operation to stop at its next checkpoint,
/// a second one exits immediately.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, stopping after the current step...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Cancellation callback for copy operations that honours Ctrl-C.
///
/// Only hand this to the beginner. A commit that stops half way leaves the
/// active directory mixed, which is worse than letting it finish.
pub fn shutdown_cancel() -> CancelFn {
    Arc::new(shutdown_requested)
}
