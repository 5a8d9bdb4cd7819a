use std::net::SocketAddr;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "socks5")]
#[command(about = "SOCKS5 proxy that tunnels through a Tavern portal")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Portal to tunnel through (required when no subcommand is given)
    #[arg(long, alias = "portal_id")]
    pub portal: Option<i64>,

    /// SOCKS5 listen address
    #[arg(long, alias = "listen_addr", default_value = "127.0.0.1:1080")]
    pub listen: SocketAddr,

    /// Upstream tavern gRPC address
    #[arg(long, alias = "upstream_addr", default_value = "127.0.0.1:8000")]
    pub upstream: String,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Time a TRACE mote's round trip through a portal
    Trace {
        #[arg(long)]
        portal: i64,

        /// Padding added to each trace mote (bytes)
        #[arg(long, default_value_t = 0)]
        size: usize,

        #[arg(long = "upstream_addr", alias = "upstream", default_value = "127.0.0.1:8000")]
        upstream_addr: String,

        /// Number of traces to send; more than one prints percentiles
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_defaults() {
        let cli = Cli::try_parse_from(["socks5", "--portal", "7"]).unwrap();
        assert_eq!(cli.portal, Some(7));
        assert_eq!(cli.listen, "127.0.0.1:1080".parse().unwrap());
        assert_eq!(cli.upstream, "127.0.0.1:8000");
        assert!(cli.command.is_none());
    }

    #[test]
    fn trace_subcommand() {
        let cli = Cli::try_parse_from([
            "socks5",
            "trace",
            "--portal",
            "3",
            "--size",
            "1024",
            "--upstream_addr",
            "tavern:443",
            "--count",
            "20",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Trace {
                portal,
                size,
                upstream_addr,
                count,
            }) => {
                assert_eq!((portal, size, count), (3, 1024, 20));
                assert_eq!(upstream_addr, "tavern:443");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
