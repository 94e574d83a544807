//! `LD_PRELOAD` shim around [`mapguard::Interceptor`].
//!
//! ```text
//! MG_USE_MAPPING_CACHE=1 MG_ENABLE_GUARD_PAGES=1 MG_DISALLOW_RWX=1 \
//!     LD_PRELOAD=target/release/libmapguard_preload.so ./program
//! ```
//!
//! The configuration is read once from the environment when the library is loaded.
//! Every exported primitive reports failures the libc way: a failure sentinel with
//! `errno` set. A denial raised under `MG_PANIC_ON_VIOLATION` aborts the process.

use std::cell::Cell;

use jemallocator::Jemalloc;
use mapguard::{Interceptor, MapGuardError, PolicyConfig, Syscalls};
use once_cell::sync::OnceCell;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

mod hooks;

/// The host's malloc may call `mmap` with its own lock held, so the shim never
/// allocates from it.
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Filter used when telemetry is on and `MAPGUARD_LOG` is unset.
const DEFAULT_FILTER: &str = "mapguard=warn";
const LOG_ENV: &str = "MAPGUARD_LOG";

static INTERCEPTOR: OnceCell<Interceptor<Syscalls>> = OnceCell::new();

thread_local! {
    /// Set while this thread is inside a hook.
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Clears the thread's hook flag when the outermost hook returns.
struct Entered;

impl Entered {
    fn try_enter() -> Option<Entered> {
        match ACTIVE.try_with(|active| active.replace(true)) {
            Ok(false) => Some(Entered),
            _ => None,
        }
    }
}

impl Drop for Entered {
    fn drop(&mut self) {
        let _ = ACTIVE.try_with(|active| active.set(false));
    }
}

/// Runs `hooked` against the interceptor.
///
/// Calls made before the library finished loading, and calls made while this
/// thread is already inside a hook (allocator refills, telemetry), go to `direct`
/// instead. They never see the policy and never take the store lock.
fn dispatch<T>(
    hooked: impl FnOnce(&Interceptor<Syscalls>) -> Result<T, MapGuardError>,
    direct: impl FnOnce(&Syscalls) -> Result<T, MapGuardError>,
) -> Result<T, MapGuardError> {
    let Some(interceptor) = INTERCEPTOR.get() else {
        return direct(&Syscalls::new());
    };
    match Entered::try_enter() {
        Some(_entered) => hooked(interceptor),
        None => direct(interceptor.primitives()),
    }
}

/// Sets `errno` for `err`, aborting first if the error demands it.
fn report(err: &MapGuardError) {
    if err.is_fatal() {
        warn!(target: "mapguard", error = %err, "aborting on policy violation");
        std::process::abort();
    }
    unsafe { *libc::__errno_location() = err.errno() };
}

fn install_subscriber() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

extern "C" fn load() {
    let Some(_entered) = Entered::try_enter() else {
        return;
    };

    let config = PolicyConfig::from_env();
    if config.enable_telemetry {
        install_subscriber();
    }
    for warning in config.warnings() {
        warn!(target: "mapguard", "{warning}");
    }
    if INTERCEPTOR.set(Interceptor::new(config, Syscalls::new())).is_ok() {
        debug!(target: "mapguard", ?config, "mapguard loaded");
    }
}

extern "C" fn unload() {
    let Some(_entered) = Entered::try_enter() else {
        return;
    };
    if let Some(interceptor) = INTERCEPTOR.get() {
        interceptor.teardown();
    }
}

#[used]
#[link_section = ".init_array"]
static LOAD: extern "C" fn() = load;

#[used]
#[link_section = ".fini_array"]
static UNLOAD: extern "C" fn() = unload;
