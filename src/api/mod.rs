mod server;
mod ws;

pub use server::{start_server, AppState};
