mod actor;
mod catalog;
mod ledger;
mod time;
mod token;
mod transaction;
mod vehicle;

pub use actor::*;
pub use catalog::*;
pub use ledger::*;
pub use time::*;
pub use token::*;
pub use transaction::*;
pub use vehicle::*;
