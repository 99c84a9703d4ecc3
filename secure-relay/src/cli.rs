use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting encrypted chat connections.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
    /// Generate an RSA private key for `server --private-key`.
    Keygen(KeygenArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:6000")]
    pub listen: SocketAddr,

    /// Size of the RSA keypair generated at startup.
    #[arg(long, default_value_t = 2048)]
    pub rsa_bits: usize,

    /// File holding a base64 PKCS#8 RSA private key to use instead of generating one.
    #[arg(long)]
    pub private_key: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name announced to the other participants.
    #[arg(long)]
    pub nickname: String,

    /// Relay address as host:port.
    #[arg(long, default_value = "127.0.0.1:6000")]
    pub server: String,

    /// AES session key size: 128, 192 or 256.
    #[arg(long, default_value_t = 128, value_parser = parse_key_bits)]
    pub key_bits: usize,
}

#[derive(Args, Debug, Clone)]
pub struct KeygenArgs {
    /// Where to write the base64 PKCS#8 private key.
    #[arg(long)]
    pub output: PathBuf,

    /// RSA modulus size.
    #[arg(long, default_value_t = 2048)]
    pub rsa_bits: usize,
}

fn parse_key_bits(raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(bits @ (128 | 192 | 256)) => Ok(bits),
        _ => Err(format!("invalid key size '{raw}', expected 128, 192 or 256")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let cli = Cli::parse_from(["secure-relay", "server"]);
        match cli.command {
            Command::Server(args) => {
                assert_eq!(args.listen, "127.0.0.1:6000".parse().unwrap());
                assert_eq!(args.rsa_bits, 2048);
                assert!(args.private_key.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn client_arguments() {
        let cli = Cli::parse_from([
            "secure-relay",
            "client",
            "--nickname",
            "Alice",
            "--server",
            "relay.example:7000",
            "--key-bits",
            "256",
        ]);
        match cli.command {
            Command::Client(args) => {
                assert_eq!(args.nickname, "Alice");
                assert_eq!(args.server, "relay.example:7000");
                assert_eq!(args.key_bits, 256);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn keygen_arguments() {
        let cli = Cli::parse_from(["secure-relay", "keygen", "--output", "relay.key"]);
        match cli.command {
            Command::Keygen(args) => {
                assert_eq!(args.output, PathBuf::from("relay.key"));
                assert_eq!(args.rsa_bits, 2048);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn odd_key_sizes_are_rejected() {
        let result = Cli::try_parse_from([
            "secure-relay",
            "client",
            "--nickname",
            "Alice",
            "--key-bits",
            "100",
        ]);
        assert!(result.is_err());
    }
}
