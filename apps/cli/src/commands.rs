//! CLI command implementations

use crate::output::{format_bytes, format_elapsed, print_output};
use crate::progress::TransferProgress;
use crate::OutputFormat;
use anyhow::{anyhow, bail, Context, Result};
use console::style;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use starfs_core::{Downloader, Progress};
use starfs_types::{LedgerSnapshot, NodeStatus, Reply, Request};
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Where a downloaded file goes
pub enum Target {
    File(PathBuf),
    Stdout,
}

// ============================================================================
// Download Command
// ============================================================================

#[derive(Debug, Serialize)]
struct TransferSummary {
    hash: String,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
    elapsed_ms: u64,
}

impl fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Downloaded {} ({}) in {}",
            style("✓").green().bold(),
            style(&self.hash).cyan(),
            format_bytes(self.size),
            format_elapsed(self.elapsed_ms)
        )?;
        if let Some(path) = &self.path {
            write!(f, "\n  Saved to: {}", path.display())?;
        }
        Ok(())
    }
}

pub async fn get_file(
    server: &Url,
    hash: &str,
    target: Target,
    step: u64,
    format: OutputFormat,
) -> Result<()> {
    let started = Instant::now();
    let (mut socket, _) = tokio_tungstenite::connect_async(server.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", server))?;

    let show_progress = matches!(format, OutputFormat::Human) && matches!(target, Target::File(_));
    let progress = TransferProgress::new(hash, show_progress);
    let mut downloader = Downloader::new(step);
    let mut outbound = Some(downloader.get_file(hash));

    let content = loop {
        if let Some(request) = outbound.take() {
            socket.send(Message::Text(encode(&request)?)).await?;
        }

        let reply = loop {
            let frame = socket
                .next()
                .await
                .ok_or_else(|| anyhow!("connection closed by {}", server))??;
            match frame {
                Message::Text(text) => break serde_json::from_str::<Reply>(&text)?,
                Message::Close(_) => bail!("connection closed by {}", server),
                _ => continue,
            }
        };

        match downloader.on_response(reply).await? {
            Progress::Started { size, request: next, .. } => {
                progress.start(size);
                outbound = Some(next);
            }
            Progress::Received {
                received,
                request: next,
                ..
            } => {
                progress.set_position(received);
                outbound = Some(next);
            }
            Progress::Complete { content, .. } => {
                progress.finish();
                break content;
            }
            Progress::Failed(error) => {
                progress.fail(&error);
                bail!("{} refused {}: {}", server, hash, error);
            }
            // the reply answered nothing in flight; keep waiting
            Progress::Discarded => {}
        }
    };
    let _ = socket.close(None).await;

    let path = match target {
        Target::File(path) => {
            tokio::fs::write(&path, &content)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            Some(path)
        }
        Target::Stdout => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(content.as_bytes())?;
            stdout.flush()?;
            return Ok(());
        }
    };

    print_output(
        &TransferSummary {
            hash: hash.to_string(),
            size: content.len() as u64,
            path,
            elapsed_ms: started.elapsed().as_millis() as u64,
        },
        format,
    )
}

fn encode(request: &Request) -> Result<String> {
    Ok(serde_json::to_string(request)?)
}

// ============================================================================
// Node Queries
// ============================================================================

/// HTTP endpoint on the same host as the WebSocket `server`
fn http_url(server: &Url, path: &str) -> Result<Url> {
    let mut url = server.clone();
    let scheme = match server.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => bail!("unsupported scheme: {}", other),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot derive an HTTP address from {}", server))?;
    url.set_path(path);
    Ok(url)
}

async fn fetch<T: serde::de::DeserializeOwned>(server: &Url, path: &str) -> Result<T> {
    let url = http_url(server, path)?;
    let response = reqwest::get(url.clone())
        .await
        .with_context(|| format!("failed to reach {}", url))?
        .error_for_status()?;
    Ok(response.json().await?)
}

pub async fn show_status(server: &Url, format: OutputFormat) -> Result<()> {
    let status: NodeStatus = fetch(server, "/status").await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            println!("{} {}", style("Node").bold(), style(&status.address).cyan());
            println!("  Difficulty: {} work/char", status.difficulty);
            println!("  Step:       {}", status.step);
            println!("  Files:      {}", status.files);
            println!("  Peers:      {}", status.peers);
            println!("  Balance:    {}", status.balance);
        }
    }

    Ok(())
}

pub async fn show_ledger(server: &Url, format: OutputFormat) -> Result<()> {
    let snapshot: LedgerSnapshot = fetch(server, "/ledger").await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct BalanceRow {
                address: String,
                balance: String,
            }

            let rows: Vec<BalanceRow> = snapshot
                .0
                .iter()
                .map(|(address, balance)| BalanceRow {
                    address: address.to_string(),
                    balance: balance.to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if snapshot.is_empty() {
                println!("{}", style("Ledger is empty").dim());
                return Ok(());
            }
            for (address, balance) in &snapshot.0 {
                println!("  {}  {}", style(address).cyan(), balance);
            }
            println!(
                "\n{} accounts, {} total",
                style(snapshot.len()).bold(),
                style(snapshot.total_supply()).bold()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_url_from_ws() {
        let server = Url::parse("ws://localhost:3000").unwrap();
        assert_eq!(
            http_url(&server, "/status").unwrap().as_str(),
            "http://localhost:3000/status"
        );

        let secure = Url::parse("wss://node.example/ws").unwrap();
        assert_eq!(
            http_url(&secure, "/ledger").unwrap().as_str(),
            "https://node.example/ledger"
        );
    }

    #[test]
    fn test_http_url_rejects_other_schemes() {
        let server = Url::parse("ftp://localhost").unwrap();
        assert!(http_url(&server, "/status").is_err());
    }

    #[test]
    fn test_summary_mentions_path() {
        let summary = TransferSummary {
            hash: "1234".to_string(),
            size: 40,
            path: Some(PathBuf::from("out.txt")),
            elapsed_ms: 12,
        };
        let text = console::strip_ansi_codes(&summary.to_string()).to_string();
        assert!(text.contains("1234"));
        assert!(text.contains("out.txt"));
    }
}
