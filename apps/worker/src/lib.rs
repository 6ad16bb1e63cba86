pub mod contracts;
pub mod handlers;
pub mod messaging;
pub mod metrics;
pub mod secrets;
pub mod storage;
pub mod worker;

#[cfg(test)]
mod testing;
