// Core modules: engine boundary, session ownership, attribute views and marshalling.
pub mod attribute;
pub mod cook;
pub mod engine;
pub mod error;
pub mod marshal;
pub mod parm;
pub mod session;
