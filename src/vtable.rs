//! Virtual method table lookups on foreign objects.
//!
//! Every read of a foreign vtable in this crate goes through
//! [`resolve_slot`], so a wrong layout assumption shows up as one
//! [`HookError::LayoutMismatch`] instead of a stray dereference somewhere else.

use core::ffi::c_void;

use crate::HookError;

/// Returns the function pointer stored in slot `slot` of `object`'s vtable.
///
/// Fails on a null object, a null vtable pointer or an empty slot. Anything
/// else that is wrong with the layout can't be detected from here.
///
/// # Safety
///
/// `object` must be null or point to a live object whose first field is a
/// vtable pointer with at least `slot + 1` entries.
pub unsafe fn resolve_slot(object: *const c_void, slot: usize) -> Result<usize, HookError> {
    if object.is_null() {
        return Err(HookError::LayoutMismatch {
            slot,
            reason: "null object",
        });
    }
    let vtable = unsafe { *(object as *const *const usize) };
    if vtable.is_null() {
        return Err(HookError::LayoutMismatch {
            slot,
            reason: "null vtable",
        });
    }
    let entry = unsafe { *vtable.add(slot) };
    if entry == 0 {
        return Err(HookError::LayoutMismatch {
            slot,
            reason: "empty slot",
        });
    }
    Ok(entry)
}

/// [`resolve_slot`] transmuted to the method's function pointer type.
///
/// # Safety
///
/// As [`resolve_slot`]; additionally `F` must be a function pointer type
/// matching the method in that slot.
pub unsafe fn method<F: Copy>(object: *const c_void, slot: usize) -> Result<F, HookError> {
    debug_assert_eq!(size_of::<F>(), size_of::<usize>());
    let entry = unsafe { resolve_slot(object, slot) }?;
    Ok(unsafe { std::mem::transmute_copy::<usize, F>(&entry) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Object {
        vtbl: *const usize,
    }

    #[test]
    fn reads_the_requested_slot() {
        let vtbl = [0x1000usize, 0x2000, 0x3000];
        let obj = Object {
            vtbl: vtbl.as_ptr(),
        };
        let ptr = &obj as *const Object as *const c_void;
        assert_eq!(unsafe { resolve_slot(ptr, 0) }.unwrap(), 0x1000);
        assert_eq!(unsafe { resolve_slot(ptr, 2) }.unwrap(), 0x3000);
    }

    #[test]
    fn fails_closed_on_detectable_mismatch() {
        assert!(matches!(
            unsafe { resolve_slot(std::ptr::null(), 3) },
            Err(HookError::LayoutMismatch { slot: 3, .. })
        ));

        let obj = Object {
            vtbl: std::ptr::null(),
        };
        let ptr = &obj as *const Object as *const c_void;
        assert!(matches!(
            unsafe { resolve_slot(ptr, 0) },
            Err(HookError::LayoutMismatch {
                reason: "null vtable",
                ..
            })
        ));

        let vtbl = [0x1000usize, 0];
        let obj = Object {
            vtbl: vtbl.as_ptr(),
        };
        let ptr = &obj as *const Object as *const c_void;
        assert!(matches!(
            unsafe { resolve_slot(ptr, 1) },
            Err(HookError::LayoutMismatch {
                reason: "empty slot",
                ..
            })
        ));
    }
}
