//! Small shared utilities that don't belong to any one component.

pub mod slotmap;
