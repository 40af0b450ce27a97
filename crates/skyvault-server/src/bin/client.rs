//! skyvault client binary
//!
//! Run with: cargo run --bin skyvault-client -- -u alice -P secret ls

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use skyvault_server::Client;
use skyvault_server::client::Reply;
use skyvault_server::protocol::{Response, ShareAction};
use std::path::PathBuf;
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server host
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "8000")]
    port: u16,

    /// Username
    #[arg(short, long)]
    username: String,

    /// Password
    #[arg(short = 'P', long, env = "SKYVAULT_PASSWORD")]
    password: String,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the account
    Register,
    /// List directory contents
    Ls {
        /// Remote directory path
        #[arg(default_value = "/")]
        path: String,
    },
    /// Upload a file
    Put {
        /// Local file path
        local: PathBuf,
        /// Remote directory
        #[arg(default_value = "/")]
        remote_dir: String,
    },
    /// Download a file
    Get {
        /// Remote file name
        filename: String,
        /// Local file path
        local: PathBuf,
        /// Remote directory
        #[arg(short, long, default_value = "/")]
        dir: String,
    },
    /// Remove a file or directory
    Rm {
        /// Remote file name
        filename: String,
        /// Remote directory
        #[arg(short, long, default_value = "/")]
        dir: String,
    },
    /// Offer a file to another user
    Share {
        /// Recipient username
        recipient: String,
        /// Remote file name
        filename: String,
        /// Remote directory
        #[arg(short, long, default_value = "/")]
        dir: String,
    },
    /// Accept a pending share
    Accept {
        /// Share id
        id: i64,
    },
    /// Reject a pending share
    Reject {
        /// Share id
        id: i64,
    },
    /// Show recent transfers
    History,
    /// Stay connected and print share requests as they arrive
    Watch,
}

fn main() {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(args) {
        error!("Operation failed: {e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut client = Client::connect((args.host.as_str(), args.port))
        .with_context(|| format!("Failed to connect to {}:{}", args.host, args.port))?;

    if let Commands::Register = args.command {
        let reply = client.register(&args.username, &args.password)?;
        report(&reply)?;
        return client.disconnect().map_err(Into::into);
    }

    let login = client.login(&args.username, &args.password)?;
    if !login.success {
        bail!("Login failed: {}", login.message);
    }
    debug!(username = %args.username, "Logged in");

    match args.command {
        Commands::Register => {}
        Commands::Ls { path } => {
            for entry in client.list(&path)? {
                if entry.is_directory {
                    println!("{}/", entry.name);
                } else {
                    println!("{:<40} {:>12}", entry.name, entry.size);
                }
            }
        }
        Commands::Put { local, remote_dir } => {
            let upload = client.upload_file(&local, &remote_dir)?;
            if let Some((received, total, percent)) = upload.progress.last() {
                println!("{received}/{total} bytes ({percent}%)");
            }
            report(&upload.result)?;
        }
        Commands::Get {
            filename,
            local,
            dir,
        } => {
            let download = client.download(&dir, &filename)?;
            report(&download.result)?;
            std::fs::write(&local, &download.data)
                .with_context(|| format!("Failed to write {}", local.display()))?;
            println!("{} bytes written to {}", download.size, local.display());
        }
        Commands::Rm { filename, dir } => report(&client.delete(&dir, &filename)?)?,
        Commands::Share {
            recipient,
            filename,
            dir,
        } => report(&client.share(&recipient, &dir, &filename)?)?,
        Commands::Accept { id } => report(&client.respond_share(id, ShareAction::Accept)?)?,
        Commands::Reject { id } => report(&client.respond_share(id, ShareAction::Reject)?)?,
        Commands::History => {
            for record in client.history()? {
                println!(
                    "{}  {:<8} {:<8} {}",
                    record.time, record.operation, record.status, record.filename
                );
            }
        }
        Commands::Watch => {
            client.set_timeout(None)?;
            loop {
                print_notification(&client.wait_notification()?);
            }
        }
    }

    for notification in client.take_notifications() {
        print_notification(&notification);
    }
    client.disconnect()?;
    Ok(())
}

fn report(reply: &Reply) -> anyhow::Result<()> {
    if reply.success {
        println!("{}", reply.message);
        Ok(())
    } else {
        bail!("{}", reply.message)
    }
}

fn print_notification(notification: &Response) {
    match notification {
        Response::ShareRequest {
            id,
            owner,
            filename,
        } => println!("[share #{id}] {owner} wants to share {filename}"),
        Response::PendingShares { shares } => {
            for share in shares {
                println!(
                    "[share #{}] {} wants to share {} (pending)",
                    share.id, share.owner, share.filename
                );
            }
        }
        other => debug!(message = ?other, "Unexpected notification"),
    }
}
