//! Fastmem fault recovery
//!
//! When fastmem is configured, loads and stores compile to direct host
//! accesses through the guest-memory base. An access outside the mapped
//! region faults; the SIGSEGV handler looks the faulting RIP up in the
//! site registry, rewrites the fixed-size access region to its callback
//! form, records the demotion, and returns. Re-execution resumes at the
//! region start and takes the callback path, so each site is demoted at
//! most once; the next recompilation of the block skips fastmem at that
//! site entirely via the `DoNotFastmem` set.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::backend::FASTMEM_REGION;
use crate::loc::LocationDescriptor;

/// Sites a block must not compile with fastmem again.
pub type DoNotFastmem = Arc<Mutex<FxHashSet<(LocationDescriptor, u32)>>>;

/// A registered fastmem access site.
#[derive(Clone)]
struct Site {
    /// Demoted byte image, exactly `FASTMEM_REGION` long.
    slow_bytes: Vec<u8>,
    location: LocationDescriptor,
    inst: u32,
    demoted: DoNotFastmem,
}

/// Registry of live sites keyed by region start address. Shared with the
/// signal handler, which only ever uses `try_lock`: a contended lookup
/// simply re-faults and retries.
static SITES: Lazy<Mutex<BTreeMap<u64, Site>>> = Lazy::new(|| Mutex::new(BTreeMap::new()));

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

pub fn register_site(
    addr: u64,
    slow_bytes: Vec<u8>,
    location: LocationDescriptor,
    inst: u32,
    demoted: DoNotFastmem,
) {
    debug_assert_eq!(slow_bytes.len(), FASTMEM_REGION);
    SITES.lock().insert(
        addr,
        Site {
            slow_bytes,
            location,
            inst,
            demoted,
        },
    );
}

/// Remove every site inside [start, end) (block invalidation).
pub fn unregister_range(start: u64, end: u64) {
    let mut sites = SITES.lock();
    let keys: Vec<u64> = sites.range(start..end).map(|(&k, _)| k).collect();
    for k in keys {
        sites.remove(&k);
    }
}

/// Install the SIGSEGV handler once per process.
#[cfg(unix)]
pub fn ensure_handler_installed() {
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    // Safety: standard sigaction installation; the previous handler is
    // saved and chained for faults that are not ours.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = fault_handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(
            libc::SIGSEGV,
            &action,
            (*std::ptr::addr_of_mut!(PREVIOUS_ACTION)).as_mut_ptr(),
        );
    }
}

#[cfg(not(unix))]
pub fn ensure_handler_installed() {}

#[cfg(unix)]
static mut PREVIOUS_ACTION: std::mem::MaybeUninit<libc::sigaction> =
    std::mem::MaybeUninit::zeroed();

/// True if the handler patched the site containing `rip`.
fn demote_site_at(rip: u64) -> bool {
    // try_lock only: taking a blocking lock inside a signal handler could
    // deadlock against the thread we interrupted
    let Some(sites) = SITES.try_lock() else {
        // Contended: report handled so the access retries and re-faults
        return true;
    };
    let Some((&start, site)) = sites.range(..=rip).next_back() else {
        return false;
    };
    if rip >= start + FASTMEM_REGION as u64 {
        return false;
    }
    // Rewrite the region to its callback form. The arena mapping is RWX
    // when fastmem is enabled.
    // Safety: `start` is inside emitted code owned by a live arena; the
    // region length is fixed.
    unsafe {
        std::ptr::copy_nonoverlapping(
            site.slow_bytes.as_ptr(),
            start as *mut u8,
            FASTMEM_REGION,
        );
    }
    if let Some(mut set) = site.demoted.try_lock() {
        set.insert((site.location, site.inst));
    }
    true
}

#[cfg(unix)]
extern "C" fn fault_handler(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    // Safety: ucontext layout per linux x86_64 ABI
    let rip = unsafe {
        let uc = context as *mut libc::ucontext_t;
        (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] as u64
    };

    if demote_site_at(rip) {
        return;
    }

    // Not a fastmem fault: chain to the previous handler or die
    // Safety: reading the saved action installed in ensure_handler_installed
    unsafe {
        let prev = (*std::ptr::addr_of!(PREVIOUS_ACTION)).assume_init_read();
        if prev.sa_flags & libc::SA_SIGINFO != 0 && prev.sa_sigaction != 0 {
            let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                std::mem::transmute(prev.sa_sigaction);
            f(signum, info, context);
        } else if prev.sa_sigaction == libc::SIG_DFL {
            libc::signal(libc::SIGSEGV, libc::SIG_DFL);
            libc::raise(libc::SIGSEGV);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The site registry is process-global; serialize these tests.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn demoted_set() -> DoNotFastmem {
        Arc::new(Mutex::new(FxHashSet::default()))
    }

    #[test]
    fn test_demote_rewrites_region_and_records() {
        let _guard = TEST_LOCK.lock();
        let mut region = vec![0x90u8; FASTMEM_REGION];
        let addr = region.as_mut_ptr() as u64;
        let slow = vec![0xccu8; FASTMEM_REGION];
        let demoted = demoted_set();
        register_site(addr, slow.clone(), LocationDescriptor(0x1000), 7, demoted.clone());

        // Fault in the middle of the region
        assert!(demote_site_at(addr + 10));
        assert_eq!(region, slow);
        assert!(demoted.lock().contains(&(LocationDescriptor(0x1000), 7)));

        unregister_range(addr, addr + FASTMEM_REGION as u64);
    }

    #[test]
    fn test_unrelated_rip_not_handled() {
        let _guard = TEST_LOCK.lock();
        let mut region = vec![0x90u8; FASTMEM_REGION];
        let addr = region.as_mut_ptr() as u64;
        register_site(
            addr,
            vec![0xcc; FASTMEM_REGION],
            LocationDescriptor(0x2000),
            0,
            demoted_set(),
        );

        assert!(!demote_site_at(addr + FASTMEM_REGION as u64 + 100));
        assert_eq!(region[0], 0x90);

        unregister_range(addr, addr + FASTMEM_REGION as u64);
    }

    #[test]
    fn test_unregister_range() {
        let _guard = TEST_LOCK.lock();
        let mut region = vec![0x90u8; FASTMEM_REGION];
        let addr = region.as_mut_ptr() as u64;
        register_site(
            addr,
            vec![0xcc; FASTMEM_REGION],
            LocationDescriptor(0x3000),
            0,
            demoted_set(),
        );
        unregister_range(addr, addr + 1);
        assert!(!demote_site_at(addr));
        let _ = &mut region;
    }
}
