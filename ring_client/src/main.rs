use clap::{Parser, Subcommand};
use ring_proto::ring::ring_client::RingClient;
use ring_proto::ring::{DeleteRequest, Empty, GetRequest, InsertRequest};
use tonic::Request;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address of the peer to connect to, host:port
    peer: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump the peer's ring state as JSON
    State,
    /// Store a value under a key
    Put { key: String, value: String },
    /// Fetch the value stored under a key
    Get { key: String },
    /// Remove a key
    Delete { key: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut client = RingClient::connect(format!("http://{}", cli.peer)).await?;

    match cli.command {
        Commands::State => {
            let state = client.state(Request::new(Empty {})).await?.into_inner();
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Put { key, value } => {
            let request = Request::new(InsertRequest {
                key,
                value: value.into_bytes(),
            });
            let response = client.insert(request).await?;
            if response.into_inner().success {
                println!("stored");
            } else {
                println!("insert failed");
            }
        }
        Commands::Get { key } => {
            let response = client.get(Request::new(GetRequest { key })).await?;
            let response = response.into_inner();
            if response.found {
                println!("{}", String::from_utf8_lossy(&response.value));
            } else {
                println!("key not found");
            }
        }
        Commands::Delete { key } => {
            let response = client.delete(Request::new(DeleteRequest { key })).await?;
            if response.into_inner().success {
                println!("deleted");
            } else {
                println!("key not found");
            }
        }
    }

    Ok(())
}
