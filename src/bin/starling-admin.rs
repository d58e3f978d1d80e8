use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::{json, Value};
use std::net::SocketAddr;

use starling::api::paths;
use starling::settings::PubSubMode;

#[derive(Parser)]
#[command(name = "starling-admin")]
#[command(about = "Starling message bus administration tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one or more messages through a node
    Publish {
        /// Node HTTP address (e.g., "127.0.0.1:8001")
        #[arg(long)]
        node: SocketAddr,
        #[arg(long, default_value = "chat")]
        topic: String,
        #[arg(long)]
        message: String,
        /// Publish this many copies, numbered
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Subscribe nodes to a topic
    Subscribe {
        /// Nodes (e.g., "127.0.0.1:8001,127.0.0.1:8002")
        #[arg(long)]
        nodes: String,
        #[arg(long)]
        topic: String,
    },
    /// Unsubscribe nodes from a topic
    Unsubscribe {
        #[arg(long)]
        nodes: String,
        #[arg(long)]
        topic: String,
    },
    /// Show status of nodes
    Status {
        #[arg(long)]
        nodes: String,
    },
    /// Switch nodes between gossip and leader mode
    SwitchMode {
        #[arg(long)]
        nodes: String,
        #[arg(long)]
        mode: PubSubMode,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();

    match cli.command {
        Commands::Publish {
            node,
            topic,
            message,
            count,
        } => {
            publish(&client, node, &topic, &message, count).await?;
        }
        Commands::Subscribe { nodes, topic } => {
            let body = json!({ "topic": topic });
            post_all(&client, &nodes, paths::pubsub::SUBSCRIBE, &body).await?;
        }
        Commands::Unsubscribe { nodes, topic } => {
            let body = json!({ "topic": topic });
            post_all(&client, &nodes, paths::pubsub::UNSUBSCRIBE, &body).await?;
        }
        Commands::Status { nodes } => {
            show_status(&client, &nodes).await?;
        }
        Commands::SwitchMode { nodes, mode } => {
            let body = json!({ "mode": mode });
            post_all(&client, &nodes, paths::pubsub::SWITCH_MODE, &body).await?;
        }
    }

    Ok(())
}

fn url(node: &SocketAddr, path: &str) -> String {
    format!("http://{}/{}", node, paths::drop_leading_slash(path))
}

async fn publish(
    client: &Client,
    node: SocketAddr,
    topic: &str,
    message: &str,
    count: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let publish_url = url(&node, paths::pubsub::PUBLISH);
    for n in 1..=count {
        let message = if count > 1 {
            format!("{} #{}", message, n)
        } else {
            message.to_string()
        };
        let response = client
            .post(&publish_url)
            .json(&json!({ "topic": topic, "message": message }))
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_success() {
            println!(
                "✅ {} published '{}' (lamport {}, id {})",
                node, message, body["lamport"], body["msg_id"]
            );
        } else {
            println!("❌ {} rejected publish: HTTP {} {}", node, status, body);
        }
    }
    Ok(())
}

async fn post_all(
    client: &Client,
    nodes: &str,
    path: &str,
    body: &Value,
) -> Result<(), Box<dyn std::error::Error>> {
    for node in parse_nodes(nodes)? {
        match client.post(url(&node, path)).json(body).send().await {
            Ok(response) if response.status().is_success() => {
                let reply: Value = response.json().await.unwrap_or(Value::Null);
                println!("✅ Node {}: {}", node, reply);
            }
            Ok(response) => {
                println!("❌ Node {}: HTTP {}", node, response.status());
            }
            Err(e) => {
                println!("❌ Node {}: unreachable ({})", node, e);
            }
        }
    }
    Ok(())
}

async fn show_status(client: &Client, nodes: &str) -> Result<(), Box<dyn std::error::Error>> {
    for node in parse_nodes(nodes)? {
        match client.get(url(&node, paths::pubsub::STATUS)).send().await {
            Ok(response) if response.status().is_success() => {
                let status: Value = response.json().await?;
                println!(
                    "📡 {} ({}): leader={} mode={} lamport={} seen={} topics={}",
                    status["node_id"],
                    node,
                    status["leader_id"],
                    status["mode"],
                    status["lamport"],
                    status["seen_count"],
                    status["subscriptions"]
                );
                if let Some(peers) = status["peers"].as_array() {
                    for peer in peers {
                        println!("     {} @ {}: {}", peer["node_id"], peer["address"], peer["state"]);
                    }
                }
            }
            Ok(response) => {
                println!("❌ Node {}: HTTP {}", node, response.status());
            }
            Err(e) => {
                println!("❌ Node {}: unreachable ({})", node, e);
            }
        }
    }
    Ok(())
}

fn parse_nodes(nodes: &str) -> Result<Vec<SocketAddr>, Box<dyn std::error::Error>> {
    nodes
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<SocketAddr>()
                .map_err(|e| format!("Invalid address '{}': {}", s, e).into())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nodes() {
        let parsed = parse_nodes("127.0.0.1:8001, 127.0.0.1:8002,").unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parse_nodes("node_a:8000").is_err());
    }

    #[test]
    fn test_url() {
        let node: SocketAddr = "127.0.0.1:8001".parse().unwrap();
        assert_eq!(
            url(&node, paths::pubsub::SWITCH_MODE),
            "http://127.0.0.1:8001/switch_mode"
        );
    }
}
