//! Development relay server for logos-link clients.

use std::time::Duration;

use clap::Parser;
use futures_util::future::BoxFuture;
use logos_link::{CrdtType, Permission, ServerConfig, ServerHooks, SimpleServer};

/// CLI configuration for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "link-server", about = "Reference relay server for logos-link rooms")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind: String,

    /// Seconds between flushes of changed documents
    #[arg(long, default_value_t = 60)]
    save_interval_secs: u64,

    /// Updates larger than this many bytes are fragmented
    #[arg(long)]
    fragment_threshold: Option<usize>,

    /// Frames queued per peer before a slow peer starts missing updates
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,
}

/// The token `readonly` grants read access, anything else write access.
struct TokenHooks;

impl ServerHooks for TokenHooks {
    fn authenticate(&self, _: &str, _: CrdtType, auth: &[u8]) -> BoxFuture<'static, Option<Permission>> {
        let permission = if auth == b"readonly" {
            Permission::Read
        } else {
            Permission::Write
        };
        Box::pin(async move { Some(permission) })
    }

    fn load_document(&self, _: &str, _: CrdtType) -> BoxFuture<'static, Option<Vec<u8>>> {
        Box::pin(async { None })
    }

    fn save_document(&self, room_id: &str, crdt: CrdtType, data: Vec<u8>) -> BoxFuture<'static, ()> {
        log::info!("Room {} ({}) changed, {} bytes", room_id, crdt, data.len());
        Box::pin(async {})
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = ServerConfig {
        bind_addr: args.bind,
        save_interval: Duration::from_secs(args.save_interval_secs),
        broadcast_capacity: args.broadcast_capacity,
        ..ServerConfig::default()
    };
    if let Some(threshold) = args.fragment_threshold {
        config.fragment_threshold = threshold;
    }

    SimpleServer::bind(config, TokenHooks).await?.run().await
}
