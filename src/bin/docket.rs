use clap::{Parser, Subcommand};
use docket::{
    DocumentStore, EventStore, LoadOptions, Store, StreamKind,
    schema::SchemaPlan,
};
use futures::TryStreamExt;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "docket", version, about = "Docket store administration")]
struct Cli {
    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Schema holding docket's tables.
    #[arg(long, default_value = docket::store::DEFAULT_SCHEMA)]
    schema: String,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the registry tables (or only show the plan)
    Migrate {
        #[arg(long)]
        dry_run: bool,
    },
    CreateStream {
        name: String,
        /// `write-model` or `unconstrained`
        #[arg(long, default_value = "unconstrained", value_parser = parse_kind)]
        kind: StreamKind,
    },
    DeleteStream {
        name: String,
    },
    /// List stream names
    Streams,
    /// Print a stream's events as JSON lines
    Load {
        stream: String,
        /// Start after this event uuid
        #[arg(long)]
        after: Option<Uuid>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        reverse: bool,
    },
    AddCollection {
        name: String,
    },
    DropCollection {
        name: String,
    },
    /// List collection names
    Collections,
}

fn parse_kind(value: &str) -> Result<StreamKind, String> {
    StreamKind::parse(value).ok_or_else(|| format!("unknown stream kind `{value}`"))
}

#[tokio::main]
async fn main() -> docket::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "docket=debug" } else { "docket=info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let store = Store::builder(&cli.database_url)
        .schema(cli.schema)
        .build()
        .await?;

    match cli.command {
        Commands::Migrate { dry_run } => {
            let manager = store.schema();
            if dry_run {
                print_plan(&manager.plan().await?);
            } else {
                let plan = manager.sync().await?;
                if plan.is_empty() {
                    println!("No changes needed.");
                } else {
                    println!("Applied changes:");
                    print_plan(&plan);
                }
            }
        }
        Commands::CreateStream { name, kind } => {
            store.events().create_stream(&name, kind).await?;
            println!("created {} stream `{name}`", kind.as_str());
        }
        Commands::DeleteStream { name } => {
            store.events().delete_stream(&name).await?;
            println!("deleted stream `{name}`");
        }
        Commands::Streams => {
            for name in store.events().stream_names().await? {
                println!("{name}");
            }
        }
        Commands::Load {
            stream,
            after,
            limit,
            reverse,
        } => {
            let mut options = LoadOptions::new();
            if let Some(after) = after {
                options = options.after(after);
            }
            if let Some(limit) = limit {
                options = options.limit(limit);
            }
            if reverse {
                options = options.reverse();
            }
            let mut events = store.events().load(&stream, options).await?;
            while let Some(event) = events.try_next().await? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Commands::AddCollection { name } => {
            store.documents().add_collection(&name).await?;
            println!("created collection `{name}`");
        }
        Commands::DropCollection { name } => {
            store.documents().drop_collection(&name).await?;
            println!("dropped collection `{name}`");
        }
        Commands::Collections => {
            for name in store.documents().collection_names().await? {
                println!("{name}");
            }
        }
    }

    Ok(())
}

fn print_plan(plan: &SchemaPlan) {
    if !plan.warnings().is_empty() {
        eprintln!("Warnings ({}):", plan.warnings().len());
        for w in plan.warnings() {
            eprintln!("  - {}", w);
        }
    }

    if plan.actions().is_empty() {
        println!("No pending DDL actions.");
        return;
    }

    println!("DDL actions ({}):", plan.actions().len());
    for (i, action) in plan.actions().iter().enumerate() {
        println!("{}. {}", i + 1, action.description());
        println!("{}\n", action.sql());
    }
}
