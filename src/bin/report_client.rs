// ===============================
// src/bin/report_client.rs
// ===============================
//
// CLI client untuk report_rpc.
//
//   report_client get-data 2024-03-04-09:30
//   report_client add TSLA
//   report_client call get_data '"2024-03-04 09:30"'
//   report_client                 # tanpa subcommand -> mode interaktif (REPL)
//
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use report_rpc::api::parse_time_spec;
use report_rpc::domain::{DataSnapshot, TickerChange};
use report_rpc::rpc_client::{ClientError, RpcClient};

#[derive(Debug, Parser)]
#[command(name = "report_client", version, about = "Client for the report_rpc server")]
struct Cli {
    #[arg(long, env = "RPC_ADDR", default_value = "127.0.0.1:8000")]
    addr: String,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Price and signal of every tracked ticker at (or just before) a time
    GetData { time_spec: String },
    /// Start tracking a ticker
    Add { ticker: String },
    /// Stop tracking a ticker and drop its rows
    Delete { ticker: String },
    /// Recompute the whole report from the price source
    Reconstruct,
    /// Tracked tickers
    List,
    Ping,
    /// Raw call: method name followed by JSON positional arguments
    Call { method: String, args: Vec<String> },
}

#[tokio::main]
async fn main() {
    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut client = RpcClient::new(cli.addr.clone());
    if let Err(e) = client.connect().await {
        eprintln!("cannot reach {}: {e}", cli.addr);
        std::process::exit(2);
    }

    let code = match cli.cmd {
        Some(cmd) => match run(&mut client, cmd).await {
            Ok(out) => {
                println!("{out}");
                0
            }
            Err(e) => {
                eprintln!("error: {e}");
                1
            }
        },
        None => repl(&mut client).await,
    };
    client.disconnect();
    std::process::exit(code);
}

async fn run(client: &mut RpcClient, cmd: Cmd) -> Result<String, ClientError> {
    match cmd {
        Cmd::GetData { time_spec } => {
            // validasi lokal dulu supaya pesan salah-format lebih jelas
            let at = parse_time_spec(&time_spec).map_err(|e| ClientError::Remote(e.to_string()))?;
            Ok(match client.get_data(at).await? {
                Some(snap) => render_snapshot(&snap),
                None => format!("no data available for {time_spec}"),
            })
        }
        Cmd::Add { ticker } => Ok(render_change("added", &client.add_ticker(&ticker).await?)),
        Cmd::Delete { ticker } => Ok(render_change("deleted", &client.delete_ticker(&ticker).await?)),
        Cmd::Reconstruct => {
            let s = client.reconstruct_reports().await?;
            Ok(format!("reconstructed {} row(s) for [{}]", s.rows, s.tickers.join(", ")))
        }
        Cmd::List => Ok(client.list_tickers().await?.join("\n")),
        Cmd::Ping => client.ping().await,
        Cmd::Call { method, args } => {
            let args = args
                .iter()
                .map(|a| serde_json::from_str(a).unwrap_or_else(|_| Value::String(a.clone())))
                .collect();
            let v = client.call(&method, args, Map::new()).await?;
            Ok(serde_json::to_string_pretty(&v)?)
        }
    }
}

fn render_snapshot(snap: &DataSnapshot) -> String {
    let mut out = format!("{}\n", snap.timestamp.to_rfc3339());
    for (ticker, q) in &snap.quotes {
        let signal = q.signal.map(|s| format!("{:+}", s.sign())).unwrap_or_else(|| "-".into());
        out.push_str(&format!("  {ticker:<8} price={:<12.4} signal={signal}\n", q.price));
    }
    out.trim_end().to_string()
}

fn render_change(verb: &str, c: &TickerChange) -> String {
    if c.changed {
        format!("{} {verb} ({} row(s))", c.ticker, c.rows)
    } else {
        format!("{} unchanged", c.ticker)
    }
}

async fn repl(client: &mut RpcClient) -> i32 {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    println!("connected to {} (help, quit)", client.addr());

    loop {
        let _ = stdout.write_all(b"> ").await;
        let _ = stdout.flush().await;
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => return 0,
            Err(e) => {
                eprintln!("stdin: {e}");
                return 1;
            }
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&head, rest)) = words.split_first() else { continue };

        let cmd = match (head, rest) {
            ("quit" | "exit", _) => return 0,
            ("help", _) => {
                println!("get <time_spec> | add <ticker> | del <ticker> | reconstruct | list | ping | call <method> [json..] | quit");
                continue;
            }
            ("get", [..]) if !rest.is_empty() => Cmd::GetData { time_spec: rest.join(" ") },
            ("add", [t]) => Cmd::Add { ticker: t.to_string() },
            ("del" | "delete", [t]) => Cmd::Delete { ticker: t.to_string() },
            ("reconstruct", []) => Cmd::Reconstruct,
            ("list", []) => Cmd::List,
            ("ping", []) => Cmd::Ping,
            ("call", [m, args @ ..]) => Cmd::Call { method: m.to_string(), args: args.iter().map(|a| a.to_string()).collect() },
            _ => {
                println!("unknown command, try `help`");
                continue;
            }
        };

        if !client.is_connected() {
            if let Err(e) = client.connect().await {
                eprintln!("reconnect failed: {e}");
                continue;
            }
        }
        match run(client, cmd).await {
            Ok(out) => println!("{out}"),
            Err(e) => eprintln!("error: {e}"),
        }
    }
}
