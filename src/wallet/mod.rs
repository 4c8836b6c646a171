//! Wallet domain layer: transfer orchestration and the error taxonomy
//! for backend rejection codes.

pub mod error;
pub mod service;

pub use error::WalletError;
pub use service::WalletService;
