pub mod error;
pub mod script;
pub mod spell;
pub mod tx;
pub mod utils;

pub use charms_client::SPELL_VK;
pub use error::ProveError;
