// lib.rs
pub mod alignment;
pub mod bed;
pub mod genome;
pub mod liftover;
pub mod mmap_store;
pub mod segment;
