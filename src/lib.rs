pub mod record;
pub mod context;
pub mod traceback;
pub mod formatter;
pub mod sink;
pub mod layer;
pub mod timer;
pub mod config;

pub mod env;
pub mod init;
pub mod noop_sink;
