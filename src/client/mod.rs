//! The client process: one persistent control connection plus the proxy
//! and visitor managers it drives (spec §4.4, §4.6, §4.7).

pub mod control;
pub mod proxy;
pub mod visitor;

pub use control::Control;
pub use proxy::ProxyManager;
pub use visitor::VisitorManager;
