//! toolbox - items CRUD API and MCP server
//!
//! ## Subcommands
//! - `crud` - serve the items REST API on `PORT` (default 3000)
//! - `stdio` - serve the item store over MCP on stdin/stdout
//! - `sse` - serve the item store over MCP with server-sent events
//!
//! Logs go to stderr, filtered by `RUST_LOG`.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use toolbox_mcp::crud::{self, CrudConfig, ItemStore};
use toolbox_mcp::error::BoxError;
use toolbox_mcp::{ToolBox, ToolBoxEvent, ToolBoxOptions, TransportKind};

#[derive(Parser)]
#[command(name = "toolbox")]
#[command(about = "Items CRUD API and MCP toolbox server", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the items REST API
    Crud {
        #[arg(long, env = "PORT", default_value = "3000")]
        port: u16,

        /// Include error detail in 500 responses
        #[arg(long)]
        development: bool,
    },
    /// Serve MCP over stdin/stdout
    Stdio,
    /// Serve MCP over server-sent events
    Sse {
        #[arg(long, env = "PORT", default_value = "3000")]
        port: u16,

        #[arg(long, default_value = "/sse")]
        endpoint: String,
    },
}

fn toolbox() -> Result<ToolBox, BoxError> {
    let options = ToolBoxOptions::new("toolbox", env!("CARGO_PKG_VERSION")).instructions(
        "Item catalog server. Use list_items to browse or filter, get_item for details, \
         and create_item, update_item or delete_item to change the catalog. \
         Items are also readable as resources at items and items/{id}.",
    );
    let mut toolbox = ToolBox::new(options);
    crud::mcp::register(&mut toolbox, Arc::new(ItemStore::seeded()))?;
    Ok(toolbox)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("toolbox_mcp=info".parse()?)
                .add_directive("toolbox=info".parse()?),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Command::Crud { port, development } => {
            let mut config = CrudConfig::from_env();
            config.port = port;
            config.development |= development;
            crud::serve(config).await?;
        }
        Command::Stdio => {
            let mut toolbox = toolbox()?;
            let mut events = toolbox.subscribe();
            toolbox.activate(TransportKind::Stdio).await?;

            tokio::select! {
                _ = async {
                    while let Ok(event) = events.recv().await {
                        if matches!(event, ToolBoxEvent::Disconnect { .. }) {
                            break;
                        }
                    }
                } => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            toolbox.stop().await;
        }
        Command::Sse { port, endpoint } => {
            let mut toolbox = toolbox()?;
            toolbox
                .activate(TransportKind::Sse { endpoint, port })
                .await?;
            tokio::signal::ctrl_c().await?;
            toolbox.stop().await;
        }
    }

    Ok(())
}
