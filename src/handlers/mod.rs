pub mod access;
pub mod actions;
pub mod callbacks;
pub mod commands;
pub mod flows;
pub mod media;
pub mod messages;
pub mod responses;
