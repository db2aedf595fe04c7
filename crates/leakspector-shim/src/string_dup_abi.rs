//! `strdup`/`strndup`: routed through [`leakspector_core::Engine::string_dup`]
//! so the copy's source scan shares the same overrun detection as the bulk
//! memory ops (spec.md §9 supplement).

use std::ffi::c_char;

use crate::call_context::capture;
use crate::engine_state::{enter, try_global};

unsafe extern "C" {
    #[link_name = "strdup"]
    fn native_strdup(s: *const c_char) -> *mut c_char;
    #[link_name = "strndup"]
    fn native_strndup(s: *const c_char, n: usize) -> *mut c_char;
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strdup(s: *const c_char) -> *mut c_char {
    let Some(guard) = enter() else {
        return unsafe { native_strdup(s) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { native_strdup(s) };
    };

    let mut engine = engine.lock();
    match engine.string_dup(s as usize, None, capture()) {
        Ok(ptr) => ptr as *mut c_char,
        Err(_) => std::ptr::null_mut(),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strndup(s: *const c_char, n: usize) -> *mut c_char {
    let Some(guard) = enter() else {
        return unsafe { native_strndup(s, n) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { native_strndup(s, n) };
    };

    let mut engine = engine.lock();
    match engine.string_dup(s as usize, Some(n), capture()) {
        Ok(ptr) => ptr as *mut c_char,
        Err(_) => std::ptr::null_mut(),
    }
}
