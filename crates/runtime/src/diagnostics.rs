//! Production diagnostics: a SIGQUIT (`kill -3`) handler that dumps runtime
//! statistics to stderr, grounded on the teacher's `diagnostics.rs`. Reads
//! the same `lumen_core::stats` atomics the embedding API exposes
//! programmatically, so the dump and `lumen_core::stats::snapshot()` never
//! disagree.

use std::sync::Once;

static SIGNAL_HANDLER_INIT: Once = Once::new();

/// Install the SIGQUIT handler. Idempotent; safe to call more than once.
/// No-op on non-Unix targets, where `dump_diagnostics` can still be called
/// directly.
pub fn install_signal_handler() {
    SIGNAL_HANDLER_INIT.call_once(|| {
        #[cfg(all(unix, feature = "diagnostics"))]
        {
            unsafe {
                let _ = signal_hook::low_level::register(signal_hook::consts::SIGQUIT, dump_diagnostics);
            }
        }
    });
}

pub fn dump_diagnostics() {
    use std::io::Write;

    let snap = lumen_core::stats::snapshot();
    let mut out = std::io::stderr().lock();
    let _ = writeln!(out, "\n=== Lumen Runtime Diagnostics ===");
    let _ = writeln!(out, "\n[Fibers]");
    let _ = writeln!(out, "  Live: {}", snap.live_fibers);
    let _ = writeln!(out, "  Total spawned: {}", snap.total_fibers_spawned);
    let _ = writeln!(out, "\n[Channels]");
    let _ = writeln!(out, "  Open: {}", snap.open_channels);
    let _ = writeln!(out, "\n[Heap]");
    let _ = writeln!(out, "  Live objects: {}", snap.heap_live_objects);
    let _ = writeln!(out, "  Collections run: {}", snap.heap_collections);
    let _ = writeln!(out, "\n=== End Diagnostics ===\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_diagnostics_does_not_panic() {
        dump_diagnostics();
    }
}
