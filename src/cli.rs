use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "podlift",
    version,
    about = "Rent a GPU instance, wire it into ~/.ssh/config, and sync files with rsync"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "podlift.toml", global = true)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only print errors and final results
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a starter podlift.toml
    Init {
        /// Write defaults without prompting
        #[arg(long)]
        defaults: bool,
    },

    /// List offers matching [instance], cheapest first
    Offers {
        /// Show at most this many offers
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Rent the cheapest matching offer, wait for SSH, write the host block
    Up {
        /// Leave the instance running if it never becomes reachable
        #[arg(long)]
        keep_on_failure: bool,
    },

    /// Wait for an existing instance and write its host block
    Wait {
        /// Instance id (defaults to the last one created)
        id: Option<String>,
    },

    /// Show the provider's view of an instance
    Status {
        /// Instance id (defaults to the last one created)
        id: Option<String>,
    },

    /// Print an instance's logs
    Logs {
        /// Instance id (defaults to the last one created)
        id: Option<String>,

        /// Print the logs saved from the last failed `up` instead
        #[arg(long, conflicts_with = "id")]
        saved: bool,
    },

    /// Destroy an instance
    Down {
        /// Instance id (defaults to the last one created)
        id: Option<String>,
    },

    /// Print the SSH host block for an instance without writing it
    SshConfig {
        /// Instance id (defaults to the last one created)
        id: Option<String>,
    },

    /// List host aliases found in the SSH config and its includes
    Hosts,

    /// Upload a file, or a folder's contents with -r
    Push {
        /// Local file or folder
        local: PathBuf,

        /// Remote path on the host
        remote: String,

        /// Copy folder contents
        #[arg(short, long)]
        recursive: bool,

        /// SSH host alias (prompted or inferred when omitted)
        #[arg(long)]
        host: Option<String>,
    },

    /// Download a file, or a folder's contents with -r
    Pull {
        /// Remote path on the host
        remote: String,

        /// Local file or folder
        local: PathBuf,

        /// Copy folder contents
        #[arg(short, long)]
        recursive: bool,

        /// SSH host alias (prompted or inferred when omitted)
        #[arg(long)]
        host: Option<String>,
    },
}
