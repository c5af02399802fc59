use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "mirage")]
#[command(about = "Stream a remote virtual machine's display to thin clients")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the VM-side listener
    Serve {
        /// Listen address for the control connection
        #[arg(long, env = "MIRAGE_BIND")]
        bind: Option<String>,

        /// Shared token clients must present; generated when omitted
        #[arg(long, env = "MIRAGE_AUTH_TOKEN")]
        token: Option<String>,

        /// Address of the VM's display to forward to viewers
        #[arg(long, env = "MIRAGE_DISPLAY")]
        display: Option<String>,

        /// VM name reported to clients
        #[arg(long, env = "MIRAGE_VM_NAME")]
        name: Option<String>,

        /// Cache driver stat directory for startup progress
        #[arg(long, env = "MIRAGE_CHUNK_STATS")]
        chunk_stats: Option<PathBuf>,

        /// Image URL to preflight for range support before serving
        #[arg(long, env = "MIRAGE_IMAGE_URL")]
        image: Option<String>,
    },
    /// Connect to a server as a thin client
    Connect {
        /// Server address: vmnetx://host[:port]/<viewer-password>
        address: String,

        /// Ask the server to start the VM if it is stopped
        #[arg(long)]
        start: bool,

        /// Bridge the attached display to 127.0.0.1:<PORT>
        #[arg(long, value_name = "PORT")]
        viewer: Option<u16>,
    },
}
