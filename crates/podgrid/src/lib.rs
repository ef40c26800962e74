pub mod cmd;
pub mod config;
pub mod platform;

// Re-export main modules
pub use platform::k8s;
pub use platform::kube_client;
