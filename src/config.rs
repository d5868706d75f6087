use std::{fs, sync::Arc};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::registry::{GuestVm, MemSlot, MemoryRegistry, VmRegistry};

fn default_socket_path() -> String {
    "/run/gfn_to_pfn.sock".to_string()
}

fn default_socket_mode() -> u32 {
    0o640
}

#[derive(Deserialize, Debug)]
pub struct VmConfig {
    /// pid of the process owning the VM
    pub pid: u64,
    /// guest physical memory layout of the VM
    #[serde(default, rename = "memslot")]
    pub memslots: Vec<MemSlot>,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// path of the unix socket serving the endpoint
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    /// file mode of the socket. This is the only access control
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,
    /// optional ip:port on which the endpoint is additionally served over tcp
    pub tcp_address: Option<String>,
    /// VMs in registration order. The first one is used for requests without a pid
    #[serde(default, rename = "vm")]
    pub vms: Vec<VmConfig>,
}

impl Config {
    /// Build the registry described by this config
    pub fn registry(&self) -> Result<Arc<MemoryRegistry>> {
        let registry = MemoryRegistry::new();
        for vm in &self.vms {
            if registry.find_by_owner_id(vm.pid).is_some() {
                bail!("vm with pid {} is configured twice", vm.pid);
            }
            for slot in &vm.memslots {
                if slot.npages == 0 {
                    bail!(
                        "memslot at gfn 0x{:x} of vm {} has no pages",
                        slot.base_gfn,
                        vm.pid
                    );
                }
            }
            registry.register(Arc::new(GuestVm::new(vm.pid, vm.memslots.clone())));
        }
        Ok(Arc::new(registry))
    }
}

pub fn parse_config(config_file_path: &str) -> Result<Config> {
    let config = fs::read_to_string(config_file_path)
        .context(format!("failed to read config from {}", config_file_path))?;

    toml::from_str(&config).context("failed to parse config file")
}
