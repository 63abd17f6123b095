use clap::Parser;
use log::info;
use ring_proto::hash_key;
use ring_proto::ring::ring_server::RingServer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tonic::transport::Server;

use ring_node::constants::{DEFAULT_PORT, LOCALHOST, STABILIZATION_INTERVAL_MS};
use ring_node::Node;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address of a ring member to join through
    #[arg(short, long)]
    join: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let addr_str = format!("{}:{}", LOCALHOST, args.port);
    let addr: SocketAddr = addr_str.parse()?;
    let id = hash_key(&addr_str);

    info!("node starting at {} with id {}", addr_str, id);
    let node = Arc::new(Node::new(id, addr_str));

    if let Some(join_addr) = args.join {
        info!("joining ring via {}", join_addr);
        node.join(join_addr).await?;
        info!("joined");
    }

    let maintenance = node.clone();
    tokio::spawn(async move {
        loop {
            sleep(Duration::from_millis(STABILIZATION_INTERVAL_MS)).await;
            maintenance.stabilize().await;
            maintenance.fix_fingers().await;
            maintenance.check_predecessor().await;
            maintenance.reconcile_replicas().await;
            maintenance.retry_shortfalls().await;
        }
    });

    info!("listening on {}", addr);
    Server::builder()
        .add_service(RingServer::new((*node).clone()))
        .serve(addr)
        .await?;

    Ok(())
}
