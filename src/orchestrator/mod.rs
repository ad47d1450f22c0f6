pub mod backend;
pub mod completion;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod openai;
pub mod pool;
pub mod secrets;
pub mod time;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;
