pub mod engine;
pub mod server;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;
