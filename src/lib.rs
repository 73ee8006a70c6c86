//! pve-cri
//!
//! A CRI-style container runtime orchestrator for Proxmox VE hosts. One
//! lifecycle API (create, start, stop, remove, exec, update) is served by
//! four interchangeable backends:
//!
//! - **Native LXC** through the `lxc-*` tools
//! - **Proxmox LXC** and **Proxmox VMs** through the Proxmox REST API
//! - **crun** for plain OCI bundles
//!
//! A [`Router`] picks the backend per container from priority-ordered rules,
//! and an [`IdentityMapper`] gives every container a stable numeric VMID in
//! `[100, 999999]` that survives restarts.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use pve_cri::{ContainerConfig, Orchestrator, RuntimeConfig};
//!
//! let config = RuntimeConfig::load("/etc/pve-cri/config.toml")?;
//! let orchestrator = Orchestrator::with_config(config)?;
//!
//! let container = ContainerConfig::builder()
//!     .name("web")
//!     .image("debian:bookworm:amd64")
//!     .memory_bytes(512 * 1024 * 1024)
//!     .build();
//!
//! let id = orchestrator.create_container("pod-1", container)?;
//! orchestrator.start_container(&id)?;
//!
//! let out = orchestrator.exec_sync(&id, &["hostname".to_string()], Duration::from_secs(10))?;
//! println!("{}", out.stdout);
//!
//! orchestrator.stop_container(&id, Some(Duration::from_secs(10)))?;
//! orchestrator.remove_container(&id)?;
//! # Ok::<(), pve_cri::Error>(())
//! ```

pub mod backend;
pub mod config;
pub mod container;
pub mod convert;
pub mod error;
pub mod identity;
pub mod orchestrator;
pub mod record;
pub mod retry;
pub mod router;
pub mod service;

pub use backend::{BackendConfig, BackendDriver, BackendKind, BackendState, ContainerInfo, DriverRegistry, ExecResult, Vmid};
pub use config::RuntimeConfig;
pub use container::{ContainerConfig, Mount, NetworkConfig, Resources};
pub use error::{BackendError, Error, ErrorKind, Result};
pub use identity::{ContainerIdentity, IdentityMapper, MappingContext};
pub use orchestrator::Orchestrator;
pub use record::{ContainerFilter, ContainerRecord, ContainerState, ContainerStatus};
pub use router::{Router, RoutingRule};
pub use service::RuntimeService;
