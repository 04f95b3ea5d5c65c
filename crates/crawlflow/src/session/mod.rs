//! Browser-derived request signing for sources without an offline API key.

pub mod browser;
pub mod harvester;
pub mod signed;
pub mod token;

pub use browser::{
    with_browser_session, BrowserConnector, BrowserLease, ChromiumConnector, PageDriver,
    PageResponse,
};
pub use harvester::TokenHarvester;
pub use signed::SignedFetch;
pub use token::SessionToken;
