//! Repository traits and implementations.

pub mod build;
pub mod site;

pub use build::{BuildRepo, PgBuildRepo};
pub use site::{PgSiteRepo, SiteRepo};
