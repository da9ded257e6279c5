pub mod import;
pub mod spectrum;
pub mod transients;
