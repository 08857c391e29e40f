use crate::{BindError, BindResult};
use std::ffi::CString;
use std::fmt;

/// Kernel index of a network interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InterfaceIndex(u32);

impl InterfaceIndex {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for InterfaceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Maps an interface name such as `eth1` to its kernel index.
pub fn resolve_interface(name: &str) -> BindResult<InterfaceIndex> {
    let not_found = || BindError::InterfaceNotFound {
        name: name.to_owned(),
    };
    let c_name = CString::new(name).map_err(|_| not_found())?;
    // SAFETY: `c_name` is a valid NUL-terminated string for the duration of the call.
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(not_found());
    }
    Ok(InterfaceIndex(index))
}
