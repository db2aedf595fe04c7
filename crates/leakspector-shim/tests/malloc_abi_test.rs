//! Integration tests over the exported `extern "C"` surface, calling the
//! real OS-backed engine (mmap-based pages, no fakes) rather than the
//! in-memory doubles `leakspector-core`'s own unit tests use.

use std::ffi::{c_char, c_void};

use leakspector_shim::malloc_abi::{calloc, free, malloc, posix_memalign, realloc};
use leakspector_shim::mem_abi::{memcmp, memcpy, memset};
use leakspector_shim::new_delete_abi::{operator_delete, operator_delete_array, operator_new, operator_new_array};
use leakspector_shim::string_dup_abi::strdup;

#[test]
fn malloc_then_free_round_trips() {
    unsafe {
        let ptr = malloc(64);
        assert!(!ptr.is_null());
        std::ptr::write_bytes(ptr as *mut u8, 0xAB, 64);
        free(ptr);
    }
}

#[test]
fn calloc_zero_fills() {
    unsafe {
        let ptr = calloc(16, 4) as *mut u8;
        assert!(!ptr.is_null());
        let slice = std::slice::from_raw_parts(ptr, 64);
        assert!(slice.iter().all(|&b| b == 0));
        free(ptr as *mut c_void);
    }
}

#[test]
fn calloc_overflow_returns_null() {
    unsafe {
        let ptr = calloc(usize::MAX, 2);
        assert!(ptr.is_null());
    }
}

#[test]
fn realloc_preserves_prefix() {
    unsafe {
        let ptr = malloc(32) as *mut u8;
        assert!(!ptr.is_null());
        std::ptr::write_bytes(ptr, 0x42, 32);

        let bigger = realloc(ptr as *mut c_void, 128) as *mut u8;
        assert!(!bigger.is_null());
        let prefix = std::slice::from_raw_parts(bigger, 32);
        assert!(prefix.iter().all(|&b| b == 0x42));
        free(bigger as *mut c_void);
    }
}

#[test]
fn realloc_to_zero_frees_and_returns_null() {
    unsafe {
        let ptr = malloc(16);
        assert!(!ptr.is_null());
        let result = realloc(ptr, 0);
        assert!(result.is_null());
    }
}

#[test]
fn posix_memalign_honors_alignment() {
    unsafe {
        let mut out: *mut c_void = std::ptr::null_mut();
        let rc = posix_memalign(&mut out, 64, 256);
        assert_eq!(rc, 0);
        assert!(!out.is_null());
        assert_eq!(out as usize % 64, 0);
        free(out);
    }
}

#[test]
fn memset_memcpy_memcmp_round_trip() {
    unsafe {
        let a = malloc(32) as *mut u8;
        let b = malloc(32) as *mut u8;
        memset(a as *mut c_void, 0x11, 32);
        memcpy(b as *mut c_void, a as *const c_void, 32);
        assert_eq!(memcmp(a as *const c_void, b as *const c_void, 32), 0);
        free(a as *mut c_void);
        free(b as *mut c_void);
    }
}

#[test]
fn strdup_copies_nul_terminated_string() {
    unsafe {
        let src = malloc(6) as *mut u8;
        let bytes = b"hello\0";
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), src, bytes.len());

        let dup = strdup(src as *const c_char);
        assert!(!dup.is_null());
        let dup_bytes = std::slice::from_raw_parts(dup as *const u8, 6);
        assert_eq!(dup_bytes, bytes);
        free(src as *mut c_void);
        free(dup as *mut c_void);
    }
}

#[test]
fn operator_new_and_delete_round_trip() {
    let scalar = operator_new(48);
    assert!(!scalar.is_null());
    operator_delete(scalar);

    let array = operator_new_array(96);
    assert!(!array.is_null());
    operator_delete_array(array);
}
