pub mod models;

pub use models::{Integration, IntegrationStatus, IntegrationType};
