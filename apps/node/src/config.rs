//! Command-line and environment configuration

use clap::Parser;
use starfs_types::{
    Address, NodeConfig, DEFAULT_DIFFICULTY, DEFAULT_PORT, DEFAULT_STEP, FRESHNESS_WINDOW_MS,
};
use std::net::IpAddr;
use std::path::PathBuf;
use url::Url;

/// StarFS node - serves files for proof-of-work and keeps the incentive ledger
#[derive(Parser, Debug)]
#[command(name = "starfs-node")]
#[command(author, version, about, long_about = None)]
pub struct NodeArgs {
    /// Ledger address credited for served chunks (random if unset)
    #[arg(long, env = "STARFS_ADDRESS")]
    pub address: Option<String>,

    /// Interface to listen on
    #[arg(long, env = "STARFS_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    #[arg(short, long, env = "STARFS_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Work required per character served
    #[arg(long, env = "STARFS_DIFFICULTY", default_value_t = DEFAULT_DIFFICULTY)]
    pub difficulty: u64,

    /// Chunk width advertised to clients
    #[arg(long, env = "STARFS_STEP", default_value_t = DEFAULT_STEP)]
    pub step: u64,

    /// Epoch length in milliseconds
    #[arg(long, env = "STARFS_EPOCH_MS", default_value_t = 60_000)]
    pub epoch_ms: u64,

    /// How old a work token may be when redeemed, in milliseconds
    #[arg(long, env = "STARFS_FRESHNESS_MS", default_value_t = FRESHNESS_WINDOW_MS)]
    pub freshness_ms: i64,

    /// How long to wait for peer ledger state after connecting, in milliseconds
    #[arg(long, env = "STARFS_CONVERGENCE_MS", default_value_t = 10_000)]
    pub convergence_ms: u64,

    /// Nominal annual yield paid to well-behaved peers
    #[arg(long, env = "STARFS_YIELD", default_value_t = 0.05)]
    pub nominal_yield: f64,

    /// Peer node to link with (ws://host:port/peer); repeatable
    #[arg(long = "peer", env = "STARFS_PEERS", value_delimiter = ',')]
    pub peers: Vec<Url>,

    /// Serve a file as HASH=PATH; repeatable
    #[arg(long = "file", value_parser = parse_file_arg)]
    pub files: Vec<(String, PathBuf)>,

    /// Do not serve the built-in demo file
    #[arg(long)]
    pub no_demo: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl NodeArgs {
    pub fn to_config(&self) -> NodeConfig {
        NodeConfig {
            address: self
                .address
                .clone()
                .map(Address::new)
                .unwrap_or_else(random_address),
            port: self.port,
            difficulty: self.difficulty.max(1),
            step: self.step.max(1),
            epoch_interval_ms: self.epoch_ms.max(1),
            freshness_ms: self.freshness_ms,
            convergence_timeout_ms: self.convergence_ms,
            nominal_yield: self.nominal_yield,
        }
    }
}

/// `0x` followed by 40 random hex digits
pub fn random_address() -> Address {
    let bytes: [u8; 20] = rand::random();
    Address::new(format!("0x{}", hex::encode(bytes)))
}

fn parse_file_arg(arg: &str) -> Result<(String, PathBuf), String> {
    let (hash, path) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected HASH=PATH, got '{}'", arg))?;
    if hash.is_empty() || path.is_empty() {
        return Err(format!("expected HASH=PATH, got '{}'", arg));
    }
    Ok((hash.to_string(), PathBuf::from(path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = tokio_test::assert_ok!(NodeArgs::try_parse_from([
            "starfs-node",
            "--address",
            "0xabc"
        ]));
        let config = args.to_config();
        assert_eq!(config.address, Address::from("0xabc"));
        assert_eq!(config.port, 3000);
        assert_eq!(config.difficulty, 1000);
        assert_eq!(config.step, 8);
        assert!(args.peers.is_empty());
    }

    #[test]
    fn test_file_and_peer_args() {
        let args = NodeArgs::try_parse_from([
            "starfs-node",
            "--file",
            "abcd=/tmp/a.txt",
            "--peer",
            "ws://127.0.0.1:3001/peer",
            "--step",
            "0",
        ])
        .unwrap();
        assert_eq!(
            args.files,
            vec![("abcd".to_string(), PathBuf::from("/tmp/a.txt"))]
        );
        assert_eq!(args.peers[0].port(), Some(3001));
        // zero step would never advance a transfer
        assert_eq!(args.to_config().step, 1);
    }

    #[test]
    fn test_bad_file_arg() {
        tokio_test::assert_err!(parse_file_arg("no-separator"));
        tokio_test::assert_err!(parse_file_arg("=path"));
    }

    #[test]
    fn test_random_address_shape() {
        let address = random_address();
        assert_eq!(address.as_str().len(), 42);
        assert!(address.as_str().starts_with("0x"));
        assert_ne!(address, random_address());
    }
}
