//! CRM API client.

mod http;

pub use http::{CrmClientConfig, HttpCrmClient};
