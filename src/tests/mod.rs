//! Cross-module tests. Blocking scenarios run on host-backed CPUs.

pub mod helpers;
