pub mod builder;
pub mod errors;
pub mod logging;
pub mod manager;
pub mod paths;
pub mod phase;
pub mod protocol;
pub mod store;

#[cfg(test)]
mod test_support;
