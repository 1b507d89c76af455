//! # Architecture Port Layer
//!
//! Everything that touches the core's registers. The scheduler above it
//! only sees stack pointers and call numbers. Currently implements the
//! ARMv7-M (Cortex-M3) port.

pub mod cortex_m3;
