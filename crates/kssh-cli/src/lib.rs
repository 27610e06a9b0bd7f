use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "kssh",
    version,
    about = "SSH agent and client backed by Google Cloud KMS keys"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// KMS key version resource name or path to a PKCS#8 PEM file.
    #[arg(short = 'i', long = "key", global = true)]
    pub key: Option<String>,

    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print the public key in authorized_keys format.
    #[arg(long)]
    pub authorized_key: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the key over an agent socket, optionally for one command.
    Agent {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Open an interactive shell on a remote host.
    Connect {
        /// `[user@]host[:port]`
        target: String,
        #[arg(short = 'l', long = "login")]
        login: Option<String>,
        #[arg(short = 'p', long = "port")]
        port: Option<u16>,
    },
    /// Write the default configuration file.
    Config {
        #[arg(long)]
        init: bool,
    },
}
