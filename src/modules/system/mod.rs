pub mod errors;
pub mod events;
