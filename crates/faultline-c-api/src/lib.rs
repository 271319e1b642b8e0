// C entry points for binding layers that expose lazy objects to a host
// language: opaque handles, integer status codes, and a C population
// callback that receives the configuration's `void*` user data.
//
// Tracing: span 'compat_api' with field api_func.
// Log level: INFO for lifecycle calls, WARN for failed calls.

#![allow(
    unsafe_code,
    unsafe_op_in_unsafe_fn,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation
)]

use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use faultline_core::{Instance, LazyObject, ObjectConfig, PopulateError};
use faultline_error::{ErrorCode, FaultError};

// ── Status codes ────────────────────────────────────────────────────

pub const FAULTLINE_OK: c_int = ErrorCode::Ok as c_int;
pub const FAULTLINE_CONFIG: c_int = ErrorCode::Config as c_int;
pub const FAULTLINE_RESOURCE: c_int = ErrorCode::Resource as c_int;
pub const FAULTLINE_BUDGET: c_int = ErrorCode::Budget as c_int;
pub const FAULTLINE_SHUTTING_DOWN: c_int = ErrorCode::ShuttingDown as c_int;
pub const FAULTLINE_UNKNOWN_OBJECT: c_int = ErrorCode::UnknownObject as c_int;
pub const FAULTLINE_INVARIANT: c_int = ErrorCode::Invariant as c_int;
pub const FAULTLINE_POPULATE: c_int = ErrorCode::Populate as c_int;
pub const FAULTLINE_MISUSE: c_int = ErrorCode::Misuse as c_int;

// ── Metrics ─────────────────────────────────────────────────────────

static COMPAT_INIT: AtomicU64 = AtomicU64::new(0);
static COMPAT_CREATE: AtomicU64 = AtomicU64::new(0);
static COMPAT_DESTROY: AtomicU64 = AtomicU64::new(0);
static COMPAT_SHUTDOWN: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct CompatMetricsSnapshot {
    pub init: u64,
    pub create: u64,
    pub destroy: u64,
    pub shutdown: u64,
}

pub fn compat_metrics_snapshot() -> CompatMetricsSnapshot {
    CompatMetricsSnapshot {
        init: COMPAT_INIT.load(Ordering::Relaxed),
        create: COMPAT_CREATE.load(Ordering::Relaxed),
        destroy: COMPAT_DESTROY.load(Ordering::Relaxed),
        shutdown: COMPAT_SHUTDOWN.load(Ordering::Relaxed),
    }
}

// ── Opaque handle types ─────────────────────────────────────────────

/// Opaque engine instance.
pub struct FaultlineInstance {
    inner: Instance,
}

/// Opaque object configuration. Configurations are copied into each object
/// created from them and may be freed afterwards.
pub struct FaultlineObjectConfig {
    inner: ObjectConfig,
}

/// Opaque lazy object.
pub struct FaultlineObject {
    inner: LazyObject,
}

/// Population callback: fill `(end - start) * stride` bytes at `out` and
/// return 0, or return a nonzero status to fail the fault.
pub type FaultlinePopulateFn =
    unsafe extern "C" fn(user_data: *mut c_void, start: u64, end: u64, out: *mut u8) -> c_int;

/// The caller's user-data pointer, handed back verbatim on the handler
/// thread.
struct CUserData(*mut c_void);

// SAFETY: the pointer is never dereferenced here; the caller promises it is
// usable from the handler thread.
unsafe impl Send for CUserData {}
// SAFETY: as above.
unsafe impl Sync for CUserData {}

fn status(res: Result<(), FaultError>, api: &'static str) -> c_int {
    match res {
        Ok(()) => FAULTLINE_OK,
        Err(e) => {
            tracing::warn!(target: "faultline.compat", api, error = %e, "call failed");
            e.status_code()
        }
    }
}

// ── Instance ────────────────────────────────────────────────────────

/// Allocate an un-started instance with default limits.
#[unsafe(no_mangle)]
pub extern "C" fn faultline_make_instance() -> *mut FaultlineInstance {
    Box::into_raw(Box::new(FaultlineInstance {
        inner: Instance::new(),
    }))
}

/// Shut down (waiting for the handler) and free an instance.
///
/// # Safety
/// `instance` must come from `faultline_make_instance` and must not be used
/// afterwards. Objects created from it must not be touched afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn faultline_free_instance(instance: *mut FaultlineInstance) {
    if !instance.is_null() {
        drop(Box::from_raw(instance));
    }
}

/// Set the high and low watermarks in bytes. Only valid before init.
///
/// # Safety
/// `instance` must be a live handle from `faultline_make_instance`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn faultline_set_memory_limits(
    instance: *mut FaultlineInstance,
    high_watermark: usize,
    low_watermark: usize,
) -> c_int {
    let Some(handle) = instance.as_ref() else {
        return FAULTLINE_MISUSE;
    };
    status(
        handle.inner.set_memory_limits(high_watermark, low_watermark),
        "set_memory_limits",
    )
}

/// Start the fault handler.
///
/// # Safety
/// `instance` must be a live handle from `faultline_make_instance`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn faultline_init(instance: *mut FaultlineInstance) -> c_int {
    COMPAT_INIT.fetch_add(1, Ordering::Relaxed);
    let _span = tracing::info_span!("compat_api", api_func = "init").entered();
    let Some(handle) = instance.as_ref() else {
        return FAULTLINE_MISUSE;
    };
    tracing::info!(target: "faultline.compat", "faultline_init");
    status(handle.inner.init(), "init")
}

/// Ask the handler to stop; with `wait`, block until it has.
///
/// # Safety
/// `instance` must be a live handle from `faultline_make_instance`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn faultline_shutdown(instance: *mut FaultlineInstance, wait: bool) -> c_int {
    COMPAT_SHUTDOWN.fetch_add(1, Ordering::Relaxed);
    let _span = tracing::info_span!("compat_api", api_func = "shutdown").entered();
    let Some(handle) = instance.as_ref() else {
        return FAULTLINE_MISUSE;
    };
    tracing::info!(target: "faultline.compat", wait, "faultline_shutdown");
    status(handle.inner.shutdown(wait), "shutdown")
}

/// Wait for the handler to stop and report how it ended.
///
/// # Safety
/// `instance` must be a live handle from `faultline_make_instance`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn faultline_await_shutdown(instance: *mut FaultlineInstance) -> c_int {
    let Some(handle) = instance.as_ref() else {
        return FAULTLINE_MISUSE;
    };
    status(handle.inner.await_shutdown(), "await_shutdown")
}

// ── Object configuration ────────────────────────────────────────────

/// Create an object configuration, or null if the shape is invalid.
#[unsafe(no_mangle)]
pub extern "C" fn faultline_make_object_config(
    header_size: u64,
    element_count: u64,
    stride: u32,
    min_load_count: u64,
) -> *mut FaultlineObjectConfig {
    match ObjectConfig::new(header_size, element_count, stride, min_load_count) {
        Ok(inner) => Box::into_raw(Box::new(FaultlineObjectConfig { inner })),
        Err(e) => {
            tracing::warn!(target: "faultline.compat", error = %e, "faultline_make_object_config failed");
            ptr::null_mut()
        }
    }
}

/// # Safety
/// `config` must come from `faultline_make_object_config` and must not be
/// used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn faultline_free_object_config(config: *mut FaultlineObjectConfig) {
    if !config.is_null() {
        drop(Box::from_raw(config));
    }
}

/// Install the population callback.
///
/// # Safety
/// `config` must be a live handle. `populate` is called on the handler
/// thread and must not touch objects of the same instance.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn faultline_set_populate_function(
    config: *mut FaultlineObjectConfig,
    populate: Option<FaultlinePopulateFn>,
) -> c_int {
    let (Some(handle), Some(populate)) = (config.as_mut(), populate) else {
        return FAULTLINE_MISUSE;
    };
    handle.inner.set_populate_function(move |req, out| {
        let data = req.user_data::<CUserData>().map_or(ptr::null_mut(), |d| d.0);
        // SAFETY: `out` holds exactly the requested elements; the callback
        // contract is the caller's.
        match unsafe { populate(data, req.start, req.end, out.as_mut_ptr()) } {
            0 => Ok(()),
            code => Err(PopulateError::new(code)),
        }
    });
    FAULTLINE_OK
}

/// Attach the pointer passed to every population call.
///
/// # Safety
/// `config` must be a live handle; `data` must stay valid while objects
/// created from the configuration live.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn faultline_set_user_data(
    config: *mut FaultlineObjectConfig,
    data: *mut c_void,
) -> c_int {
    let Some(handle) = config.as_mut() else {
        return FAULTLINE_MISUSE;
    };
    handle.inner.set_user_data(Arc::new(CUserData(data)));
    FAULTLINE_OK
}

/// Never persist modifications of objects created from `config`.
///
/// # Safety
/// `config` must be a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn faultline_set_read_only(config: *mut FaultlineObjectConfig) -> c_int {
    let Some(handle) = config.as_mut() else {
        return FAULTLINE_MISUSE;
    };
    handle.inner.set_read_only();
    FAULTLINE_OK
}

// ── Objects ─────────────────────────────────────────────────────────

/// Create an object; on success `*out` receives the handle.
///
/// # Safety
/// `instance` and `config` must be live handles; `out` must be writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn faultline_create_object(
    instance: *mut FaultlineInstance,
    config: *const FaultlineObjectConfig,
    out: *mut *mut FaultlineObject,
) -> c_int {
    COMPAT_CREATE.fetch_add(1, Ordering::Relaxed);
    let _span = tracing::info_span!("compat_api", api_func = "create_object").entered();
    if out.is_null() {
        return FAULTLINE_MISUSE;
    }
    *out = ptr::null_mut();
    let (Some(inst), Some(cfg)) = (instance.as_ref(), config.as_ref()) else {
        return FAULTLINE_MISUSE;
    };
    match inst.inner.create_object(&cfg.inner) {
        Ok(inner) => {
            tracing::info!(target: "faultline.compat", id = %inner.id(), "faultline_create_object");
            *out = Box::into_raw(Box::new(FaultlineObject { inner }));
            FAULTLINE_OK
        }
        Err(e) => status(Err(e), "create_object"),
    }
}

/// Address of the first header byte; null for a null handle.
///
/// # Safety
/// `object` must be a live handle or null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn faultline_get_header_pointer(object: *const FaultlineObject) -> *mut c_void {
    object
        .as_ref()
        .map_or(ptr::null_mut(), |o| o.inner.header_ptr().cast())
}

/// Address of the first body byte; null for a null handle.
///
/// # Safety
/// `object` must be a live handle or null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn faultline_get_body_pointer(object: *const FaultlineObject) -> *mut c_void {
    object
        .as_ref()
        .map_or(ptr::null_mut(), |o| o.inner.body_ptr().cast())
}

/// Drop an object's populated chunks and saved modifications.
///
/// # Safety
/// `object` must be a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn faultline_reset_object(object: *mut FaultlineObject) -> c_int {
    let Some(handle) = object.as_ref() else {
        return FAULTLINE_MISUSE;
    };
    status(handle.inner.reset(), "reset_object")
}

/// Unmap an object and free its handle.
///
/// # Safety
/// `object` must be a live handle; neither it nor its memory may be used
/// afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn faultline_destroy_object(object: *mut FaultlineObject) -> c_int {
    COMPAT_DESTROY.fetch_add(1, Ordering::Relaxed);
    let _span = tracing::info_span!("compat_api", api_func = "destroy_object").entered();
    if object.is_null() {
        return FAULTLINE_OK;
    }
    let handle = Box::from_raw(object);
    status(handle.inner.destroy(), "destroy_object")
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn fill_with_index(
        user_data: *mut c_void,
        start: u64,
        end: u64,
        out: *mut u8,
    ) -> c_int {
        let bias = *user_data.cast::<u64>();
        let words = std::slice::from_raw_parts_mut(out.cast::<u64>(), (end - start) as usize);
        for (k, w) in words.iter_mut().enumerate() {
            *w = start + k as u64 + bias;
        }
        0
    }

    fn page() -> usize {
        faultline_core::page::page_size()
    }

    #[test]
    fn null_handles_are_misuse() {
        unsafe {
            assert_eq!(faultline_init(ptr::null_mut()), FAULTLINE_MISUSE);
            assert_eq!(faultline_set_memory_limits(ptr::null_mut(), 2, 1), FAULTLINE_MISUSE);
            assert_eq!(faultline_set_read_only(ptr::null_mut()), FAULTLINE_MISUSE);
            assert_eq!(
                faultline_set_populate_function(ptr::null_mut(), Some(fill_with_index)),
                FAULTLINE_MISUSE
            );
            assert_eq!(
                faultline_create_object(ptr::null_mut(), ptr::null(), ptr::null_mut()),
                FAULTLINE_MISUSE
            );
            assert!(faultline_get_body_pointer(ptr::null()).is_null());
            assert!(faultline_get_header_pointer(ptr::null()).is_null());
            assert_eq!(faultline_destroy_object(ptr::null_mut()), FAULTLINE_OK);
            faultline_free_instance(ptr::null_mut());
            faultline_free_object_config(ptr::null_mut());
        }
    }

    #[test]
    fn zero_stride_config_is_null() {
        assert!(faultline_make_object_config(0, 10, 0, 1).is_null());
    }

    #[test]
    fn overflowing_config_is_null() {
        assert!(faultline_make_object_config(0, u64::MAX / 4, 8, 1).is_null());
        assert!(faultline_make_object_config(0, 1, 8, u64::MAX).is_null());
    }

    #[test]
    fn configuration_status_codes() {
        unsafe {
            let inst = faultline_make_instance();
            assert_eq!(faultline_set_memory_limits(inst, 10, 10), FAULTLINE_CONFIG);
            assert_eq!(faultline_await_shutdown(inst), FAULTLINE_MISUSE);
            assert_eq!(faultline_shutdown(inst, true), FAULTLINE_OK);

            let cfg = faultline_make_object_config(0, 10, 8, 1);
            assert!(!cfg.is_null());
            let mut obj: *mut FaultlineObject = ptr::null_mut();
            assert_eq!(faultline_create_object(inst, cfg, &mut obj), FAULTLINE_CONFIG);
            assert!(obj.is_null());
            assert_eq!(faultline_set_populate_function(cfg, None), FAULTLINE_MISUSE);

            faultline_free_object_config(cfg);
            faultline_free_instance(inst);
        }
    }

    #[test]
    fn create_before_init_is_misuse() {
        unsafe {
            let inst = faultline_make_instance();
            let cfg = faultline_make_object_config(0, 10, 8, 1);
            assert_eq!(faultline_set_populate_function(cfg, Some(fill_with_index)), FAULTLINE_OK);
            let mut obj: *mut FaultlineObject = ptr::null_mut();
            assert_eq!(faultline_create_object(inst, cfg, &mut obj), FAULTLINE_MISUSE);
            faultline_free_object_config(cfg);
            faultline_free_instance(inst);
        }
    }

    #[test]
    fn populate_through_c_callback() {
        unsafe {
            let inst = faultline_make_instance();
            assert_eq!(faultline_set_memory_limits(inst, 4 * page(), 2 * page()), FAULTLINE_OK);
            match faultline_init(inst) {
                FAULTLINE_OK => {}
                FAULTLINE_RESOURCE => {
                    eprintln!("skipping: userfaultfd unavailable");
                    faultline_free_instance(inst);
                    return;
                }
                rc => panic!("init failed with {rc}"),
            }
            assert_eq!(faultline_set_memory_limits(inst, 8, 4), FAULTLINE_MISUSE);

            let mut bias = 1000_u64;
            let elements = (3 * page() / 8) as u64;
            let cfg = faultline_make_object_config(16, elements, 8, 1);
            assert_eq!(faultline_set_populate_function(cfg, Some(fill_with_index)), FAULTLINE_OK);
            assert_eq!(
                faultline_set_user_data(cfg, (&raw mut bias).cast()),
                FAULTLINE_OK
            );
            let mut obj: *mut FaultlineObject = ptr::null_mut();
            assert_eq!(faultline_create_object(inst, cfg, &mut obj), FAULTLINE_OK);
            faultline_free_object_config(cfg);

            let header = faultline_get_header_pointer(obj).cast::<u8>();
            let body = faultline_get_body_pointer(obj).cast::<u64>();
            assert_eq!(body as usize - header as usize, 16);
            for i in [0_u64, 1, elements / 2, elements - 1] {
                assert_eq!(body.add(i as usize).read_volatile(), i + 1000);
            }
            assert_eq!(faultline_reset_object(obj), FAULTLINE_OK);
            assert_eq!(body.read_volatile(), 1000);

            assert_eq!(faultline_destroy_object(obj), FAULTLINE_OK);
            assert_eq!(faultline_shutdown(inst, true), FAULTLINE_OK);
            faultline_free_instance(inst);
        }
    }
}
