// パスごとにクライアントへトラフィックを振り分けるリバーストンネルブローカー

mod client;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod frontend;
pub mod port_allocator;
pub mod protocol;
pub mod registry;
pub mod router;
mod server;
mod tunnel;

// パブリックAPI
pub use client::{Assignment, TunnelClient};
pub use config::{BrokerConfig, ClientConfig, Config, IdPolicy};
pub use error::BrokerError;
pub use registry::{ClientKind, ClientRecord, ClientStatus, Registration};
pub use server::{run_server, Broker};
pub use tunnel::{start_tunnel, Tunnel};
