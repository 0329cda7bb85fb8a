pub mod config_parser; // quota sync config file
pub mod error; // error handling
pub mod feed; // change-feed subscriptions and payloads
pub mod identity; // identity inputs and resolution
pub mod observability; // logs and the sync observer hook
pub mod quota; // quota tracking and live sync
pub mod redis_client; // redis client
pub mod store; // counter tables and the counter store trait
mod testing;
