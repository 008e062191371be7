use clap::{Parser, Subcommand};
use std::io::Write;
use tracing::info;

use pkg_labels::applicator::{Applicator, StoreApplicator, Type, as_type};
use pkg_labels::selector::Selector;
use pkg_state::client::StateStore;

#[derive(Parser)]
#[command(
    name = "dsfarm-label",
    about = "Apply and inspect entity labels in the dsfarm coordination store"
)]
struct Cli {
    /// Path to the coordination store data directory
    #[arg(long, default_value = "./dsfarm-data")]
    data_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply label changes to all entities matching a selector
    Apply {
        /// The type of entity to label (NODE, POD)
        #[arg(short = 't', long = "labelType")]
        label_type: String,

        /// The selector on which to modify labels
        #[arg(short = 's', long)]
        selector: String,

        /// A KEY=VALUE label to set. Repeat to set several. It's safe to
        /// mix --add with --delete, though the result is not transactional
        #[arg(short = 'a', long = "add", value_name = "KEY=VALUE")]
        add: Vec<String>,

        /// A label key to remove. Deletes are idempotent. Repeat to
        /// remove several
        #[arg(short = 'd', long = "delete", value_name = "KEY")]
        delete: Vec<String>,

        /// Autoconfirm label applications. Use with caution!
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },
    /// Show labels that apply to a particular entity (type, ID)
    Show {
        /// The type of entity to inspect (NODE, POD)
        #[arg(short = 't', long = "labelType")]
        label_type: String,

        /// The ID of the entity to show labels for
        #[arg(short = 'i', long = "id")]
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    info!("Using coordination store at {}", cli.data_dir);
    let store = StateStore::open(&cli.data_dir).await?;
    let applicator = StoreApplicator::new(store);
    let mut exit_code = 0;

    match cli.command {
        Commands::Show { label_type, id } => {
            let label_type = match as_type(&label_type) {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("Error while parsing label type: {e}");
                    std::process::exit(1);
                }
            };
            match applicator.get_labels(label_type, &id).await {
                Ok(labeled) => {
                    println!("{}/{}: {}", label_type, id, labeled.labels_display());
                }
                Err(e) => {
                    eprintln!("Error while querying labels: {e}");
                    exit_code = 1;
                }
            }
        }
        Commands::Apply {
            label_type,
            selector,
            add,
            delete,
            yes,
        } => {
            let label_type = match as_type(&label_type) {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("Error while parsing label type: {e}");
                    std::process::exit(1);
                }
            };
            let selector: Selector = match selector.parse() {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("Error while parsing selector: {e}");
                    std::process::exit(1);
                }
            };
            let additive = match parse_additive_labels(&add) {
                Ok(pairs) => pairs,
                Err(e) => {
                    eprintln!("Error while parsing labels: {e}");
                    std::process::exit(1);
                }
            };

            let matches = match applicator.get_matches(&selector, label_type, false).await {
                Ok(matches) => matches,
                Err(e) => {
                    eprintln!("Error while finding label matches: {e}");
                    std::process::exit(1);
                }
            };

            if !additive.is_empty() {
                let rendered: Vec<String> =
                    additive.iter().map(|(k, v)| format!("{k}={v}")).collect();
                println!("labels to be added: {}", rendered.join(","));
            }
            if !delete.is_empty() {
                println!("labels to be removed: {}", delete.join(","));
            }

            for entity in matches {
                if let Err(e) =
                    apply_labels(&applicator, label_type, &entity.id, &additive, &delete, yes).await
                {
                    eprintln!("Error while applying labels to {}/{}: {e}", label_type, entity.id);
                    exit_code = 1;
                }
                match applicator.get_labels(label_type, &entity.id).await {
                    Ok(labeled) => {
                        println!("{}/{}: {}", label_type, entity.id, labeled.labels_display());
                    }
                    Err(e) => {
                        eprintln!("Error while querying labels: {e}");
                        exit_code = 1;
                    }
                }
            }
        }
    }

    std::process::exit(exit_code);
}

/// Set and remove the requested labels on one entity, after confirmation.
/// Destructive and additive changes are applied one by one; this is not
/// transactional and a partial application is possible on error.
async fn apply_labels(
    applicator: &StoreApplicator,
    label_type: Type,
    id: &str,
    additive: &[(String, String)],
    destructive: &[String],
    auto_confirm: bool,
) -> anyhow::Result<()> {
    if !confirm(
        &format!("mutate the labels for {}/{}", label_type, id),
        auto_confirm,
    ) {
        return Ok(());
    }
    for (key, value) in additive {
        applicator.set_label(label_type, id, key, value).await?;
    }
    for key in destructive {
        applicator.remove_label(label_type, id, key).await?;
    }
    Ok(())
}

fn parse_additive_labels(add: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    add.iter()
        .map(|raw| {
            raw.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow::anyhow!("expected KEY=VALUE, got {raw:?}"))
        })
        .collect()
}

fn confirm(message: &str, auto_confirm: bool) -> bool {
    if auto_confirm {
        return true;
    }
    println!("Confirm your intention to {message}");
    print!(r#"Type "y" to confirm [n]: "#);
    let _ = std::io::stdout().flush();
    let mut input = String::new();
    if std::io::stdin().read_line(&mut input).is_err() {
        return false;
    }
    let resp = input.trim().to_lowercase();
    resp == "y" || resp == "yes"
}
