//! Jinx - a single binary that runs one of four network service roles:
//! a static HTTP/HTTPS origin, a path-routed reverse proxy, an open forward
//! proxy with a hostname blacklist, or a layer-4 TCP load balancer.

pub mod config;
pub mod engine;
pub mod lb;
pub mod logging;
pub mod origin;
pub mod proxy;
pub mod setup;
pub mod tls;
pub mod util;

pub use config::JinxConfig;
pub use engine::{Engine, JinxServer};
