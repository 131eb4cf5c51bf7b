pub mod asset_store;
pub mod codegen;
pub mod dsl;
