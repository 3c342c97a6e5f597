// Ledger and content-network plumbing: the resilient ledger gateway, the
// content store client, and in-process stand-ins for both.

pub mod breaker;
pub mod content;
pub mod devnet;
pub mod gateway;
pub mod ledger;
pub mod memory;

pub use breaker::CircuitBreaker;
pub use content::{ContentError, ContentStore, HttpContentStore};
pub use devnet::Devnet;
pub use gateway::{GatewayConfig, GatewayError, LedgerGateway, RetryReason};
pub use ledger::{LedgerClient, LedgerError};
pub use memory::MemoryContentStore;
