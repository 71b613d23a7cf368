pub mod chat;
pub mod health;
pub mod repositories;
pub mod search;
