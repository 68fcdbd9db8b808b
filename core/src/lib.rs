// Mods

pub mod clock;
pub mod config;
pub mod err;
pub mod kube;
pub mod orchestrator;
pub mod process;
pub mod provider;
pub mod registry;
pub mod status;
pub mod tracer;

// Consts

pub const ANNOT_CHECKSUM: &str = "llmdeck.dev/checksum";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_PROVIDER: &str = "llmdeck.dev/provider";
pub const RESOURCE_GPU: &str = "nvidia.com/gpu";

// Tests
