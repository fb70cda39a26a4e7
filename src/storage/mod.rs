mod repository;

pub use repository::*;

/// SQL migration for vehicles, balances and the transaction log
pub const MIGRATION_001_INITIAL: &str = include_str!("migrations/001_initial.sql");

/// SQL migration for QR redemption tokens
pub const MIGRATION_002_QR_TOKENS: &str = include_str!("migrations/002_qr_tokens.sql");
