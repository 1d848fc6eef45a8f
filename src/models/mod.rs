pub mod enums;

pub use enums::{DiagnosticClass, InvalidEnum};
