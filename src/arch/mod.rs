//! Architecture-specific register types and constants.

pub mod x86_64;
