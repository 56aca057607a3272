//! Clap surface of the `meshfm` binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "meshfm - browse and transfer files on a MeshCentral agent through the relay"
)]
pub struct Args {
    /// MeshCentral server (https://host[:port][/path])
    #[arg(long)]
    pub relay: String,

    /// Target agent node id (node//...)
    #[arg(long)]
    pub node: String,

    /// Login token for the control session
    #[arg(long)]
    pub auth: Option<String>,

    /// Domain prefix on multi-domain servers
    #[arg(long, default_value = "")]
    pub domain_prefix: String,

    /// Config file (default: ~/.config/meshfm/meshfm.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write JSONL transfer journal entries to file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Create a directory under PATH
    Mkdir { path: String, name: String },
    /// Delete entries of PATH
    Rm {
        path: String,
        #[arg(required = true)]
        names: Vec<String>,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Rename an entry of PATH
    Rename { path: String, old: String, new: String },
    /// Copy entries from SRC into DST
    Cp {
        src: String,
        dst: String,
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Move entries from SRC into DST
    Mv {
        src: String,
        dst: String,
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Search under PATH
    Find { path: String, filter: String },
    /// Print a remote file
    Cat { path: String, file: String },
    /// Upload a local file into REMOTE_DIR
    Put {
        local: PathBuf,
        remote_dir: String,
        /// Skip the content-hash precheck
        #[arg(long)]
        no_hash: bool,
    },
    /// Download a remote file
    Get {
        remote_file: String,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
}

impl Command {
    pub fn is_transfer(&self) -> bool {
        matches!(self, Command::Put { .. } | Command::Get { .. })
    }
}
