//! relaymq – one binary that can start the broker *or* act as an
//! interactive client shell.
//
//  $ relaymq start --config relaymq.toml
//  $ relaymq connect 127.0.0.1:5672
//  > exchange logs topic durable
//  > queue errors durable
//  > bind logs errors app.*.error
//  > sub errors auto
//  > pub logs app.db.error disk full
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rustyline::history::DefaultHistory;
use rustyline::{DefaultEditor, Editor};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use relaymq::core::{Arguments, BasicProperties, DeliveryMode, ExchangeType, VirtualHost};
use relaymq::{Broker, Client, ClientChannel, Config, Server};

#[derive(Debug, Parser)]
#[command(name = "relaymq", version, about = "RelayMQ broker & CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the broker daemon.
    Start {
        /// Path to config TOML (env RELAYMQ_CONFIG is used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Connect to a running broker in interactive mode.
    Connect {
        /// Broker address (host:port)
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Start { config } => {
            let cfg = Config::load(config.as_deref())?;
            relaymq::logging::init_logging(&cfg.log.level);
            if let Err(e) = start(cfg).await {
                error!("Broker failed: {e:#}");
                return Err(e);
            }
        }
        Command::Connect { addr } => {
            tracing_subscriber::fmt::init();
            repl(addr).await?
        }
    }
    Ok(())
}

async fn start(cfg: Config) -> anyhow::Result<()> {
    let vhost = VirtualHost::open("/", &cfg.storage.data_dir).with_context(|| {
        format!(
            "failed to recover broker state from {}",
            cfg.storage.data_dir.display()
        )
    })?;
    let broker = Arc::new(Broker::new(vhost, &cfg.delivery)?);
    let server = Server::bind(&cfg.server.bind_addr, Arc::clone(&broker)).await?;
    info!("RelayMQ broker listening on {}", server.local_addr()?);

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {e}");
            }
        })
        .await?;

    broker.shutdown();
    info!("Broker stopped");
    Ok(())
}

// ───────────────────────────────────────────────────────────
// Interactive REPL shell
// ───────────────────────────────────────────────────────────
const HELP: &str = "\
exchange <name> <direct|fanout|topic> [durable] | delete-exchange <name>
queue <name> [durable] | delete-queue <name>
bind <exchange> <queue> <key> | unbind <exchange> <queue>
pub <exchange> <routing-key> <msg...> | ack <queue> <message-id>
sub <queue> [auto] | cancel | exit";

async fn repl(addr: SocketAddr) -> anyhow::Result<()> {
    let mut rl: Editor<(), DefaultHistory> = DefaultEditor::new()?;
    let client = Client::connect(addr).await?;
    let ch = client.open_channel().await?;
    let mut subscription: Option<Subscription> = None;

    println!("Connected to {addr}. Type `help` for commands.");

    loop {
        let Ok(line) = rl.readline("> ") else { break };
        let _ = rl.add_history_entry(line.as_str());

        let outcome = match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            [] => continue,
            ["help"] => {
                println!("{HELP}");
                continue;
            }
            ["exit" | "quit"] => break,

            ["exchange", name, kind, rest @ ..] => match kind.parse::<ExchangeType>() {
                Ok(kind) => {
                    ch.declare_exchange(name, kind, rest.contains(&"durable"), false, Arguments::new())
                        .await
                }
                Err(e) => {
                    println!("{e}");
                    continue;
                }
            },
            ["delete-exchange", name] => ch.delete_exchange(name).await,
            ["queue", name, rest @ ..] => {
                ch.declare_queue(name, rest.contains(&"durable"), false, false, Arguments::new())
                    .await
            }
            ["delete-queue", name] => ch.delete_queue(name).await,
            ["bind", exchange, queue, key] => ch.queue_bind(exchange, queue, key).await,
            ["unbind", exchange, queue] => ch.queue_unbind(exchange, queue).await,
            ["pub", exchange, key, rest @ ..] => {
                let props = BasicProperties::new(*key, DeliveryMode::Durable);
                ch.basic_publish(exchange, &props, rest.join(" ")).await
            }
            ["ack", queue, id] => ch.basic_ack(queue, id).await,
            ["sub", queue, rest @ ..] => {
                if subscription.is_some() {
                    println!("Already subscribed; `cancel` first.");
                    continue;
                }
                let auto_ack = rest.contains(&"auto");
                match subscribe(&client, queue, auto_ack).await {
                    Ok(sub) => {
                        subscription = Some(sub);
                        Ok(true)
                    }
                    Err(e) => Err(e),
                }
            }
            ["cancel"] => match subscription.take() {
                Some(sub) => {
                    sub.stop().await;
                    Ok(true)
                }
                None => Ok(true),
            },
            _ => {
                println!("Unknown cmd. Type `help`.");
                continue;
            }
        };

        match outcome {
            Ok(true) => println!("ok"),
            Ok(false) => println!("refused"),
            Err(e) => {
                println!("error: {e:#}");
                break;
            }
        }
    }

    if let Some(sub) = subscription {
        sub.stop().await;
    }
    client.close().await?;
    Ok(())
}

struct Subscription {
    stop: oneshot::Sender<()>,
    printer: JoinHandle<()>,
}

impl Subscription {
    async fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.printer.await;
    }
}

/// Consumes `queue` on a dedicated channel and prints each delivery until
/// stopped.
async fn subscribe(client: &Client, queue: &str, auto_ack: bool) -> anyhow::Result<Subscription> {
    let mut sub: ClientChannel = client.open_channel().await?;
    let tag = format!("cli-{}", sub.id());
    if !sub.basic_consume(&tag, queue, auto_ack).await? {
        anyhow::bail!("broker refused subscription to {queue}");
    }

    let queue = queue.to_string();
    let (stop, mut stopped) = oneshot::channel();
    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stopped => break,
                delivery = sub.recv() => match delivery {
                    Some(d) => println!(
                        "{} [{}] {}",
                        d.properties.id,
                        d.properties.routing_key,
                        String::from_utf8_lossy(&d.body)
                    ),
                    None => return,
                },
            }
        }
        let _ = sub.basic_cancel(&tag, &queue).await;
        let _ = sub.close().await;
    });
    Ok(Subscription { stop, printer })
}
