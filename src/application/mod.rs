// Application layer: the ledger engine and the QR flow built on it.
// Every transport (CLI, HTTP, batch job) goes through these types.

mod engine;
pub mod error;
mod locks;
mod redemption;

pub use engine::*;
pub use error::*;
pub use locks::{VehicleGuard, VehicleLocks};
pub use redemption::*;
