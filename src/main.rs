use std::collections::VecDeque;
use std::io::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use rosbus::{
    Master, MasterClient, Node, NodeConfig, ReceivedMessage, DEFAULT_BIND_ADDR,
    DEFAULT_MASTER_ADDR,
};

#[derive(Parser, Debug)]
#[command(name = "rosbus")]
#[command(author, version, about = "Lightweight pub/sub middleware", long_about = None)]
struct Args {
    /// Coordinator RPC address.
    #[arg(long, global = true, default_value = DEFAULT_MASTER_ADDR)]
    master: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordinator.
    Master {
        #[arg(short, long, default_value = DEFAULT_BIND_ADDR)]
        bind: String,
    },
    /// Inspect registered nodes.
    Node {
        #[command(subcommand)]
        command: NodeCommand,
    },
    /// Inspect and observe topics.
    Topic {
        #[command(subcommand)]
        command: TopicCommand,
    },
}

#[derive(Subcommand, Debug)]
enum NodeCommand {
    /// List all active nodes.
    List {
        /// Substring filter over node names.
        #[arg(default_value = "")]
        filter: String,
    },
    /// Print information about a node.
    Info { name: String },
}

#[derive(Subcommand, Debug)]
enum TopicCommand {
    /// List all active topics.
    List {
        /// Substring filter over topic names.
        #[arg(default_value = "")]
        filter: String,
    },
    /// Print information about a topic.
    Info { topic: String },
    /// Print messages published to a topic.
    Echo { topic: String },
    /// Print the message publishing rate.
    Hz {
        topic: String,
        /// Number of samples in the sliding window.
        #[arg(long, default_value_t = 100)]
        window: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Master { bind } => run_master(&bind).await,
        Command::Node { command } => run_node_command(&args.master, command).await,
        Command::Topic { command } => run_topic_command(&args.master, command).await,
    }
}

async fn run_master(bind: &str) -> Result<()> {
    let master = Master::bind(bind).await?;
    info!(addr = %master.local_addr(), "coordinator running, Ctrl+C to stop");
    tokio::select! {
        result = master.serve() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, exiting");
            Ok(())
        }
    }
}

async fn run_node_command(master_addr: &str, command: NodeCommand) -> Result<()> {
    let client = MasterClient::new(master_addr);
    match command {
        NodeCommand::List { filter } => {
            let nodes = client.get_nodes(&filter).await?;
            println!("Active nodes:");
            for node in &nodes {
                println!(" * {} ({}:{})", node.name, node.ip, node.port);
            }
            println!("Total nodes: {}", nodes.len());
        }
        NodeCommand::Info { name } => {
            let (node, publishes, subscribes) = client.get_node_info(&name).await?;
            println!("Node: {}", node.name);
            println!(" - IP: {}", node.ip);
            println!(" - Port: {}", node.port);
            println!("Published topics:");
            if publishes.is_empty() {
                println!("  None");
            }
            for t in &publishes {
                println!("  * {} ({})", t.topic_name, t.msg_type);
            }
            println!("Subscribed topics:");
            if subscribes.is_empty() {
                println!("  None");
            }
            for t in &subscribes {
                println!("  * {} ({})", t.topic_name, t.msg_type);
            }
        }
    }
    Ok(())
}

async fn run_topic_command(master_addr: &str, command: TopicCommand) -> Result<()> {
    let client = MasterClient::new(master_addr);
    match command {
        TopicCommand::List { filter } => {
            let topics = client.get_topics(&filter).await?;
            println!("Active topics:");
            for t in &topics {
                println!(" * {} ({})", t.topic_name, t.msg_type);
            }
            println!("Total topics: {}", topics.len());
        }
        TopicCommand::Info { topic } => {
            let (msg_type, publishers, subscribers) = client.get_topic_info(&topic).await?;
            println!("Topic: {topic}");
            println!(" - Type: {msg_type}");
            println!("Publishers:");
            if publishers.is_empty() {
                println!("  None");
            }
            for p in &publishers {
                println!("  * {} ({}:{})", p.name, p.ip, p.port);
            }
            println!("Subscribers:");
            if subscribers.is_empty() {
                println!("  None");
            }
            for s in &subscribers {
                println!("  * {} ({}:{})", s.name, s.ip, s.port);
            }
        }
        TopicCommand::Echo { topic } => {
            echo_topic(master_addr, &topic, &client).await?;
        }
        TopicCommand::Hz { topic, window } => {
            hz_topic(master_addr, &topic, &client, window.max(2)).await?;
        }
    }
    Ok(())
}

/// Subscribe dynamically and pretty-print every message.
async fn echo_topic(master_addr: &str, topic: &str, client: &MasterClient) -> Result<()> {
    let (msg_type, _, _) = client.get_topic_info(topic).await?;
    println!("Subscribing to topic: {topic} with message type: {msg_type}");
    println!("Press Ctrl+C to stop...");

    let node = Node::init(tool_config(master_addr, "echo")).await?;
    let _subscriber = node
        .subscribe_with_type(topic, 10, &msg_type, |msg: &ReceivedMessage| {
            let pretty = serde_json::to_string_pretty(msg.decoded.value())
                .unwrap_or_else(|_| msg.decoded.value().to_string());
            println!("[{}]\n{}", msg.msg_type, pretty);
        })
        .await?;

    tokio::signal::ctrl_c().await?;
    node.shutdown();
    Ok(())
}

/// Subscribe dynamically and report the arrival rate over a sliding
/// window of timestamps once per second.
async fn hz_topic(
    master_addr: &str,
    topic: &str,
    client: &MasterClient,
    window: usize,
) -> Result<()> {
    let (msg_type, _, _) = client.get_topic_info(topic).await?;
    println!("Measuring publishing rate for topic: {topic} with message type: {msg_type}");
    println!("Press Ctrl+C to stop...");

    let node = Node::init(tool_config(master_addr, "hz")).await?;
    let timestamps: Arc<Mutex<VecDeque<Instant>>> = Arc::new(Mutex::new(VecDeque::new()));
    let stamps = timestamps.clone();
    let _subscriber = node
        .subscribe_with_type(topic, window, &msg_type, move |_msg: &ReceivedMessage| {
            let mut stamps = stamps.lock().unwrap();
            stamps.push_back(Instant::now());
            while stamps.len() > window {
                stamps.pop_front();
            }
        })
        .await?;

    let mut interval = time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = interval.tick() => {
                let stamps = timestamps.lock().unwrap();
                if stamps.len() > 1 {
                    let span = stamps
                        .back()
                        .unwrap()
                        .duration_since(*stamps.front().unwrap())
                        .as_secs_f64();
                    if span > 0.0 {
                        let rate = (stamps.len() - 1) as f64 / span;
                        print!("\rAverage rate ({} samples): {rate:.3} Hz   ", stamps.len());
                        let _ = std::io::stdout().flush();
                    }
                }
            }
        }
    }
    println!();
    node.shutdown();
    Ok(())
}

fn tool_config(master_addr: &str, tool: &str) -> NodeConfig {
    let mut config = NodeConfig::new(format!("rosbus_{tool}_{}", std::process::id()));
    config.master_addr = master_addr.to_owned();
    config
}
