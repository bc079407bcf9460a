pub mod asset_cache;
pub mod command;
pub mod config;
pub mod console_http;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod port_alloc;
pub mod process_table;
pub mod reconciler;
pub mod registry;
pub mod security;
pub mod session_store;
pub mod signature;
pub mod state;
pub mod supervisor;
pub mod ws_proxy;
pub mod zones;

#[cfg(test)]
mod testing;
