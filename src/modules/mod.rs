pub mod crafty;
pub mod interaction;
pub mod system;
