mod alias;
mod cpuid;
mod detect;
mod microarchitecture;
mod schema;
mod version;

pub use detect::host;
pub use microarchitecture::{
    Microarchitecture, MicroarchitectureSnapshot, UnsupportedMicroarchitecture,
};
pub use schema::CatalogError;
