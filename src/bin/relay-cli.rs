use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Parser)]
#[command(name = "relay-cli")]
#[command(about = "Management CLI for the configuration relay", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080", env = "CONFIG_RELAY_URL")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read one key
    Get {
        namespace: String,
        environment: String,
        key: String,
    },
    /// List every key of a scope
    List { namespace: String, environment: String },
    /// Write a key; VALUE is parsed as JSON, falling back to a plain string
    Put {
        namespace: String,
        environment: String,
        key: String,
        value: String,
        #[arg(long, env = "USER", default_value = "relay-cli")]
        created_by: String,
        #[arg(long)]
        expected_version: Option<u64>,
        #[arg(long)]
        create_only: bool,
    },
    /// Delete a key
    Delete {
        namespace: String,
        environment: String,
        key: String,
    },
    /// Show endpoint health and leader
    Cluster,
    /// Stream changes of a scope until interrupted
    Watch { namespace: String, environment: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    match cli.command {
        Commands::Get { namespace, environment, key } => {
            let res = client
                .get(format!("{base}/v1/config/{namespace}/{environment}/{key}"))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::List { namespace, environment } => {
            let res = client
                .get(format!("{base}/v1/config/{namespace}/{environment}"))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Put {
            namespace,
            environment,
            key,
            value,
            created_by,
            expected_version,
            create_only,
        } => {
            let value: Value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            let body = json!({
                "value": value,
                "metadata": { "created_by": created_by, "source": "cli" },
                "expected_version": expected_version,
                "create_only": create_only,
            });
            let res = client
                .put(format!("{base}/v1/config/{namespace}/{environment}/{key}"))
                .json(&body)
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Delete { namespace, environment, key } => {
            let res = client
                .delete(format!("{base}/v1/config/{namespace}/{environment}/{key}"))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Cluster => {
            let res = client.get(format!("{base}/v1/cluster")).send().await?;
            print_response(res).await?;
        }
        Commands::Watch { namespace, environment } => {
            watch(base, &namespace, &environment).await?;
        }
    }

    Ok(())
}

async fn watch(base: &str, namespace: &str, environment: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut url = url::Url::parse(base)?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme).map_err(|_| "cannot build websocket url")?;
    url.set_path(&format!("/ws/{namespace}/{environment}"));

    let (stream, _) = connect_async(url.as_str()).await?;
    let (mut sink, mut source) = stream.split();
    let mut ping = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            _ = ping.tick() => {
                sink.send(Message::Text(json!({"type": "ping"}).to_string().into())).await?;
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(text.as_str())?;
                    match value["type"].as_str() {
                        Some("pong") => {}
                        Some("disconnected") => {
                            eprintln!("Disconnected: {}", value["reason"]);
                            return Ok(());
                        }
                        _ => println!("{}", serde_json::to_string(&value)?),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            _ = tokio::signal::ctrl_c() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: relay returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
