//! Store backends, logging and the services built on them

pub mod cache;
pub mod logging;
pub mod services;
