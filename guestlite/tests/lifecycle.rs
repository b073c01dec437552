//! Integration tests for handle lifecycle (create, launch, shutdown, close).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use guestlite::runtime::constants::defaults;
use guestlite::runtime::registry;
use guestlite::{
    CreateFlags, DriveOptions, ErrorHandler, EventKind, GuestError, Handle, HandleState,
};
use guestlite_test_utils::FakeAppliance;
use parking_lot::Mutex;
use tempfile::TempDir;

// ============================================================================
// TEST FIXTURES
// ============================================================================

/// Handle that ignores the process environment and keeps its working
/// directory inside a private temp dir.
struct TestContext {
    handle: Handle,
    tmp: TempDir,
}

impl TestContext {
    fn new() -> Self {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let handle = Handle::create_flags(CreateFlags::NO_ENVIRONMENT)
            .expect("Failed to create handle");
        handle
            .set_tmpdir(Some(tmp.path().to_str().unwrap()))
            .unwrap();
        Self { handle, tmp }
    }

    /// Attach to `appliance` and launch.
    fn launch(appliance: &FakeAppliance) -> Self {
        let ctx = Self::new();
        ctx.handle.set_backend(&appliance.backend()).unwrap();
        ctx.handle.launch().expect("Failed to launch");
        ctx
    }
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(&guestlite::Event) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&count);
    (count, move |_: &guestlite::Event| {
        hits.fetch_add(1, Ordering::SeqCst);
    })
}

fn recording_handler() -> (Arc<Mutex<Vec<String>>>, ErrorHandler) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: ErrorHandler = Arc::new(move |e: &GuestError| sink.lock().push(e.to_string()));
    (seen, handler)
}

// ============================================================================
// CREATION AND DEFAULTS
// ============================================================================

#[test]
fn new_handle_has_defaults() {
    let ctx = TestContext::new();
    let h = &ctx.handle;
    assert_eq!(h.state(), HandleState::Config);
    assert_eq!(h.get_path().unwrap(), defaults::PATH);
    assert_eq!(h.get_qemu().unwrap(), defaults::QEMU);
    assert_eq!(h.get_smp().unwrap(), 1);
    assert!(h.get_autosync().unwrap());
    assert!(h.get_recovery_proc().unwrap());
    assert!(!h.get_verbose().unwrap());
    assert_eq!(h.get_backend().unwrap(), "direct");
    assert_eq!(h.get_attach_method().unwrap(), "appliance");
    assert_eq!(h.get_append().unwrap(), None);
}

#[test]
fn path_and_qemu_reset_to_default() {
    let ctx = TestContext::new();
    let h = &ctx.handle;
    h.set_path(Some("/opt/appliance")).unwrap();
    h.set_qemu(Some("/usr/bin/qemu-kvm")).unwrap();
    assert_eq!(h.get_path().unwrap(), "/opt/appliance");
    assert_eq!(h.get_qemu().unwrap(), "/usr/bin/qemu-kvm");

    h.set_path(None).unwrap();
    h.set_qemu(Some("")).unwrap();
    assert_eq!(h.get_path().unwrap(), defaults::PATH);
    assert_eq!(h.get_qemu().unwrap(), defaults::QEMU);
}

#[test]
fn smp_limits() {
    let ctx = TestContext::new();
    let h = &ctx.handle;
    let _guard = h.push_error_handler(None).unwrap();

    assert!(matches!(h.set_smp(256), Err(GuestError::InvalidArgument(_))));
    assert!(matches!(h.set_smp(0), Err(GuestError::InvalidArgument(_))));
    h.set_smp(255).unwrap();
    assert_eq!(h.get_smp().unwrap(), 255);
    h.set_smp(1).unwrap();
    assert_eq!(h.get_smp().unwrap(), 1);
}

#[test]
fn bogus_backend_leaves_previous_and_reports() {
    let ctx = TestContext::new();
    let h = &ctx.handle;
    let (seen, handler) = recording_handler();
    h.set_error_handler(Some(handler)).unwrap();

    h.set_backend("libvirt:qemu:///session").unwrap();
    assert!(matches!(
        h.set_backend("bogus"),
        Err(GuestError::InvalidBackend(_))
    ));
    assert_eq!(h.get_backend().unwrap(), "libvirt:qemu:///session");
    assert_eq!(seen.lock().len(), 1);
    assert!(h.last_error().unwrap().unwrap().contains("bogus"));
}

#[test]
fn attach_method_alias() {
    let ctx = TestContext::new();
    let h = &ctx.handle;
    h.set_attach_method("appliance").unwrap();
    assert_eq!(h.get_backend().unwrap(), "direct");
    assert_eq!(h.get_attach_method().unwrap(), "appliance");
    h.set_attach_method("unix:/run/g.sock").unwrap();
    assert_eq!(h.get_attach_method().unwrap(), "unix:/run/g.sock");
}

#[test]
fn config_params_validated_and_ordered() {
    let ctx = TestContext::new();
    let h = &ctx.handle;
    let _guard = h.push_error_handler(None).unwrap();

    assert!(h.config("cpu", Some("host")).is_err());
    assert!(h.config("-kernel", Some("/boot/vmlinuz")).is_err());
    h.config("-cpu", Some("host")).unwrap();
    h.config("-no-hpet", None).unwrap();
    assert_eq!(
        h.qemu_params().unwrap(),
        vec![
            ("-cpu".to_string(), Some("host".to_string())),
            ("-no-hpet".to_string(), None)
        ]
    );
}

#[test]
fn version_matches_crate() {
    let ctx = TestContext::new();
    let version = ctx.handle.version().unwrap();
    assert!(version.to_string().starts_with(env!("CARGO_PKG_VERSION")));
}

#[test]
fn snapshot_is_json() {
    let ctx = TestContext::new();
    ctx.handle.set_memsize(640).unwrap();
    let snapshot = ctx.handle.config_snapshot().unwrap();
    assert!(snapshot.contains("\"memsize\":640"));
    assert!(snapshot.contains("\"backend\":\"direct\""));
}

// ============================================================================
// CLOSE
// ============================================================================

#[test]
fn second_close_is_harmless() {
    let ctx = TestContext::new();
    let (closes, on_close) = counter();
    ctx.handle
        .set_event_callback(EventKind::Close, on_close)
        .unwrap();

    ctx.handle.close();
    ctx.handle.close();

    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.handle.state(), HandleState::NoHandle);
}

#[test]
fn closed_handle_rejects_operations_without_handler() {
    let ctx = TestContext::new();
    let (seen, handler) = recording_handler();
    ctx.handle.set_error_handler(Some(handler)).unwrap();
    ctx.handle.close();

    assert!(matches!(ctx.handle.set_smp(2), Err(GuestError::Closed)));
    assert!(matches!(ctx.handle.launch(), Err(GuestError::Closed)));
    assert!(matches!(ctx.handle.get_path(), Err(GuestError::Closed)));
    assert!(seen.lock().is_empty());
}

#[test]
fn drop_closes_handle() {
    let (closes, on_close) = counter();
    {
        let ctx = TestContext::new();
        ctx.handle
            .set_event_callback(EventKind::Close, on_close)
            .unwrap();
    }
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn close_emits_trace_event() {
    let ctx = TestContext::new();
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&messages);
    ctx.handle.set_trace(true).unwrap();
    ctx.handle
        .set_event_callback(EventKind::Trace, move |e: &guestlite::Event| {
            sink.lock().push(e.message.clone())
        })
        .unwrap();

    ctx.handle.close();
    assert_eq!(*messages.lock(), vec!["close".to_string()]);
}

#[test]
fn deleted_callback_is_not_called() {
    let ctx = TestContext::new();
    let (closes, on_close) = counter();
    let id = ctx
        .handle
        .set_event_callback(EventKind::Close, on_close)
        .unwrap();
    ctx.handle.delete_event_callback(id).unwrap();
    ctx.handle.close();
    assert_eq!(closes.load(Ordering::SeqCst), 0);
}

#[test]
fn close_callbacks_run_before_appliance_shutdown() {
    let appliance = Arc::new(FakeAppliance::start());
    let ctx = TestContext::launch(&appliance);
    let syncs_seen = Arc::new(Mutex::new(None));
    let (sink, watched) = (Arc::clone(&syncs_seen), Arc::clone(&appliance));
    ctx.handle
        .set_event_callback(EventKind::Close, move |_: &guestlite::Event| {
            *sink.lock() = Some(watched.sync_requests());
        })
        .unwrap();

    ctx.handle.close();
    // The appliance was still attached while the callback ran
    assert_eq!(*syncs_seen.lock(), Some(0));
    assert_eq!(appliance.sync_requests(), 1);
}

#[test]
fn concurrent_close_waits_for_the_running_one() {
    let ctx = TestContext::new();
    let entered = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (e, f) = (Arc::clone(&entered), Arc::clone(&finished));
    let (closes, on_close) = counter();
    ctx.handle
        .set_event_callback(EventKind::Close, move |event: &guestlite::Event| {
            e.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(200));
            f.store(true, Ordering::SeqCst);
            on_close(event);
        })
        .unwrap();

    thread::scope(|s| {
        s.spawn(|| ctx.handle.close());
        while !entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        ctx.handle.close();
        // Returns only once the first close has finished tearing down
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(ctx.handle.state(), HandleState::NoHandle);
    });
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

// ============================================================================
// REGISTRY MEMBERSHIP
// ============================================================================

#[test]
fn opted_out_handles_are_never_registered() {
    let h = Handle::create_flags(CreateFlags::NO_ENVIRONMENT | CreateFlags::NO_CLOSE_ON_EXIT)
        .unwrap();
    assert!(!registry::contains(h.id()));
    h.close();
    assert!(!registry::contains(h.id()));
}

#[test]
fn registered_until_close() {
    let ctx = TestContext::new();
    let id = ctx.handle.id();
    assert!(registry::contains(id));
    ctx.handle.close();
    assert!(!registry::contains(id));
}

// ============================================================================
// SHUTDOWN
// ============================================================================

#[test]
fn shutdown_in_config_twice() {
    let ctx = TestContext::new();
    ctx.handle.shutdown().unwrap();
    ctx.handle.shutdown().unwrap();
    assert_eq!(ctx.handle.state(), HandleState::Config);
}

#[test]
fn launch_unix_reaches_ready_and_syncs_once_on_shutdown() {
    let appliance = FakeAppliance::start();
    let ctx = TestContext::launch(&appliance);
    assert_eq!(ctx.handle.state(), HandleState::Ready);
    assert_eq!(appliance.connections(), 1);

    ctx.handle.shutdown().unwrap();
    assert_eq!(appliance.sync_requests(), 1);
    assert_eq!(ctx.handle.state(), HandleState::Config);

    // Nothing attached any more
    ctx.handle.shutdown().unwrap();
    assert_eq!(appliance.sync_requests(), 1);
}

#[test]
fn shutdown_without_autosync_sends_nothing() {
    let appliance = FakeAppliance::start();
    let ctx = TestContext::new();
    ctx.handle.set_backend(&appliance.backend()).unwrap();
    ctx.handle.set_autosync(false).unwrap();
    ctx.handle.launch().unwrap();

    ctx.handle.shutdown().unwrap();
    assert_eq!(appliance.sync_requests(), 0);
}

#[test]
fn sync_failure_reported_but_state_restored() {
    let appliance = FakeAppliance::failing();
    let ctx = TestContext::launch(&appliance);
    let (seen, handler) = recording_handler();
    ctx.handle.set_error_handler(Some(handler)).unwrap();

    let err = ctx.handle.shutdown().unwrap_err();
    assert!(matches!(err, GuestError::Shutdown { .. }));
    assert_eq!(ctx.handle.state(), HandleState::Config);
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn explicit_sync_round_trip() {
    let appliance = FakeAppliance::start();
    let ctx = TestContext::launch(&appliance);
    ctx.handle.sync().unwrap();
    assert_eq!(appliance.sync_requests(), 1);
    assert_eq!(ctx.handle.state(), HandleState::Ready);
}

#[test]
fn close_of_launched_handle_syncs_and_tears_down() {
    let appliance = FakeAppliance::start();
    let ctx = TestContext::launch(&appliance);
    let (quits, on_quit) = counter();
    ctx.handle
        .set_event_callback(EventKind::SubprocessQuit, on_quit)
        .unwrap();

    ctx.handle.close();
    assert_eq!(appliance.sync_requests(), 1);
    assert_eq!(ctx.handle.state(), HandleState::NoHandle);
    // Close does not go through the public shutdown path
    assert_eq!(quits.load(Ordering::SeqCst), 0);
}

#[test]
fn shutdown_fires_subprocess_quit() {
    let appliance = FakeAppliance::start();
    let ctx = TestContext::launch(&appliance);
    let (quits, on_quit) = counter();
    ctx.handle
        .set_event_callback(EventKind::SubprocessQuit, on_quit)
        .unwrap();
    ctx.handle.shutdown().unwrap();
    assert_eq!(quits.load(Ordering::SeqCst), 1);
}

// ============================================================================
// LAUNCH
// ============================================================================

#[test]
fn launch_missing_socket_fails_and_stays_in_config() {
    let ctx = TestContext::new();
    let _guard = ctx.handle.push_error_handler(None).unwrap();
    let missing = ctx.tmp.path().join("absent.sock");
    ctx.handle
        .set_backend(&format!("unix:{}", missing.display()))
        .unwrap();

    assert!(matches!(ctx.handle.launch(), Err(GuestError::Launch(_))));
    assert_eq!(ctx.handle.state(), HandleState::Config);
}

#[test]
fn launch_done_event_fires() {
    let appliance = FakeAppliance::start();
    let ctx = TestContext::new();
    let (launches, on_launch) = counter();
    ctx.handle
        .set_event_callback(EventKind::LaunchDone, on_launch)
        .unwrap();
    ctx.handle.set_backend(&appliance.backend()).unwrap();
    ctx.handle.launch().unwrap();
    assert_eq!(launches.load(Ordering::SeqCst), 1);
}

#[test]
fn second_launch_is_rejected() {
    let appliance = FakeAppliance::start();
    let ctx = TestContext::launch(&appliance);
    let _guard = ctx.handle.push_error_handler(None).unwrap();
    assert!(matches!(
        ctx.handle.launch(),
        Err(GuestError::InvalidState(_))
    ));
    assert_eq!(ctx.handle.state(), HandleState::Ready);
}

#[test]
fn drives_only_before_launch_and_released_on_shutdown() {
    let appliance = FakeAppliance::start();
    let ctx = TestContext::new();
    ctx.handle
        .add_drive("/images/disk.img", DriveOptions::default())
        .unwrap();
    ctx.handle.set_backend(&appliance.backend()).unwrap();
    ctx.handle.launch().unwrap();

    let _guard = ctx.handle.push_error_handler(None).unwrap();
    assert!(matches!(
        ctx.handle.add_drive("/images/other.img", DriveOptions::default()),
        Err(GuestError::InvalidState(_))
    ));
    assert!(ctx.handle.config("-cpu", Some("host")).is_err());

    ctx.handle.shutdown().unwrap();
    assert!(ctx.handle.drives().unwrap().is_empty());
}

#[test]
fn working_directory_removed_on_close() {
    let appliance = FakeAppliance::start();
    let ctx = TestContext::launch(&appliance);
    let entries = || std::fs::read_dir(ctx.tmp.path()).unwrap().count();
    assert_eq!(entries(), 1);

    ctx.handle.close();
    assert_eq!(entries(), 0);
}

// ============================================================================
// ERROR HANDLERS
// ============================================================================

#[test]
fn pushed_handler_is_restored_on_drop() {
    let ctx = TestContext::new();
    let (outer, outer_handler) = recording_handler();
    let (inner, inner_handler) = recording_handler();
    ctx.handle.set_error_handler(Some(outer_handler)).unwrap();

    {
        let _guard = ctx.handle.push_error_handler(Some(inner_handler)).unwrap();
        let _ = ctx.handle.set_smp(0);
    }
    let _ = ctx.handle.set_smp(0);

    assert_eq!(inner.lock().len(), 1);
    assert_eq!(outer.lock().len(), 1);
}

// ============================================================================
// BACKENDS NEEDING A HYPERVISOR
// ============================================================================

#[test]
#[ignore = "requires qemu and an appliance in the default search path"]
fn direct_backend_launch_and_shutdown() {
    let ctx = TestContext::new();
    ctx.handle.set_backend("direct").unwrap();
    ctx.handle.launch().unwrap();
    assert_eq!(ctx.handle.state(), HandleState::Ready);
    ctx.handle.shutdown().unwrap();
    assert_eq!(ctx.handle.state(), HandleState::Config);
}

#[test]
#[ignore = "requires libvirtd, virsh and an appliance in the default search path"]
fn libvirt_backend_launch_and_shutdown() {
    let ctx = TestContext::new();
    ctx.handle.set_backend("libvirt").unwrap();
    ctx.handle.launch().unwrap();
    assert_eq!(ctx.handle.state(), HandleState::Ready);
    ctx.handle.shutdown().unwrap();
}
