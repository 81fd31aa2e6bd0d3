pub mod handler;
pub mod middleware;
pub mod server;
pub mod ws;

#[cfg(test)]
pub(crate) mod testutil;
