mod defaults;
mod load;
#[cfg(test)]
mod tests;
mod types;
mod validate;

pub use load::load_config;
pub use types::*;
pub use validate::validate_config;
