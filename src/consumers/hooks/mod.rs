//! Ready-made [`TopologyHook`](super::TopologyHook)s.
pub mod topology;
