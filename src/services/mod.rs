//! Storage backends, the transform subprocess and the resize handler.

pub mod guard;
pub mod naming;
pub mod object_store;
pub mod resize_service;
pub mod storage_service;
pub mod transform;

#[cfg(test)]
pub mod test_support;
