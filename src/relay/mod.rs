pub mod archive;
pub mod audit;
pub mod config;
pub mod content;
pub mod dispatcher;
pub mod legacy;
pub mod metadata;
pub mod pairing;
pub mod paths;
pub mod queue;
pub mod retry;
pub mod routing;
pub mod run_lock;
pub mod scanner;
pub mod sweep;
pub mod util;
