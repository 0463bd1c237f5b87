pub mod events;
pub mod launch;
pub mod settings;
pub mod status;
