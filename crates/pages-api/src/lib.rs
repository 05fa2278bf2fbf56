//! Status callback server and service clients for the Pages build pipeline.

pub mod error;
pub mod routes;
pub mod services;
pub mod state;

pub use state::AppState;
