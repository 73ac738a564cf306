pub mod gateway;
pub mod message;
pub mod presence;
pub mod user;
pub mod voice;
