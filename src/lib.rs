pub mod clock;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod payments;
pub mod store;
pub mod sweeper;
pub mod window;
