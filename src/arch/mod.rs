//! # Architecture Abstraction Layer
//!
//! Hardware boundary of the kernel. The scheduler core above it is plain
//! Rust and builds on any host; only the port below touches registers.
//! Currently implements the ARMv8-M Mainline (Cortex-M33) port.

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m33;
