pub mod api;
pub mod server;

pub use api::{Daemon, router};
pub use server::serve;
