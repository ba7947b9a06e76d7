#![allow(clippy::type_complexity, clippy::too_many_arguments, clippy::new_without_default)]

pub mod app;
pub mod common;
pub mod config;
pub mod dns;
pub mod proxy;
pub mod router;
