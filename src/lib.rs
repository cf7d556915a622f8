// millstream: streams G-code programs to a GRBL-class motion controller with
// flow control, status tracking and geometric reverse/resume.

pub mod communication;
pub mod config;
pub mod file_manager;
pub mod streaming;

pub use millstream_shared as shared;
