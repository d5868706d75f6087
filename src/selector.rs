use std::sync::Arc;

use thiserror::Error;

use crate::{
    registry::{Vm, VmRegistry},
    request::Request,
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SelectError {
    #[error("no vm owned by pid {pid}")]
    NoSuchVm { pid: u64 },
    #[error("no vms registered")]
    NoVms,
}

/// Pick the VM a request targets: the one owned by the requested pid, or the first
/// registered VM if the request names none.
pub fn select_vm(registry: &dyn VmRegistry, req: &Request) -> Result<Arc<dyn Vm>, SelectError> {
    match req.vm_pid {
        Some(pid) => registry
            .find_by_owner_id(pid)
            .ok_or(SelectError::NoSuchVm { pid }),
        None => registry.first().ok_or(SelectError::NoVms),
    }
}
