pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;

/// `<product>/<version> (+<contact URL>)`, the User-Agent every outbound
/// fetch identifies itself with.
pub fn user_agent(contact_url: &str) -> String {
    format!("driftfeed/{} (+{})", env!("CARGO_PKG_VERSION"), contact_url)
}
