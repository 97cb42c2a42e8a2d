//! projkit - research project workspaces
//!
//! Keeps a project's stored manifest, its directory tree and its start page in step

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use projkit::commands::{self, NewProject, OutputFormat};
use projkit::config::ProjkitPaths;
use projkit::telemetry;

#[derive(Parser)]
#[command(name = "projkit")]
#[command(author, version, about = "projkit - manifest, workspace and start page for research projects")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use another projkit home instead of ~/.projkit
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize projkit (first-time setup)
    Init,

    /// Create a project, deploy its template and save it
    New {
        /// Project address, e.g. "we1s/climate"
        project: String,

        /// Human-readable title (defaults to the name)
        #[arg(short, long)]
        title: Option<String>,

        /// Contributor name; repeat for several
        #[arg(short, long = "contributor")]
        contributors: Vec<String>,

        /// Template to deploy (defaults to the config's default_template)
        #[arg(long)]
        template: Option<String>,

        /// Start from a manifest JSON file
        #[arg(short, long)]
        manifest: Option<String>,

        /// Deploy only; do not write to the store
        #[arg(long)]
        no_save: bool,
    },

    /// Show a project
    Show {
        /// Project address
        project: String,

        /// Output the manifest as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a project's manifest
    Validate {
        /// Project address
        project: String,

        /// Strict mode (fail on warnings)
        #[arg(long)]
        strict: bool,
    },

    /// Save a project's manifest to the store
    Save {
        /// Project address
        project: String,
    },

    /// Copy a project under a new name
    SaveAs {
        /// Project address
        project: String,

        /// Name of the copy
        new_name: String,

        /// Namespace of the copy (defaults to the original's)
        #[arg(short, long)]
        namespace: Option<String>,
    },

    /// Delete a project from the store
    Delete {
        /// Project address
        project: String,

        /// Also remove the project directory
        #[arg(long)]
        purge: bool,
    },

    /// List saved projects
    List {
        /// Filter by namespace
        #[arg(short, long)]
        namespace: Option<String>,
    },

    /// Record a new version
    Version {
        /// Project address
        project: String,

        /// Version name (defaults to <date>_v<n>_<name>)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List a project's versions
    Versions {
        /// Project address
        project: String,
    },

    /// Record a module's output on a project
    Module {
        /// Project address
        project: String,

        /// Module id
        module: String,

        /// Visualisation URL for the start page
        #[arg(short, long)]
        url: Option<String>,

        /// Module fields as a JSON object, merged into the manifest
        #[arg(short, long)]
        fields: Option<String>,

        /// Remove the module's visualisation link
        #[arg(long, conflicts_with = "url")]
        clear: bool,
    },

    /// Show or regenerate the start page
    Start {
        /// Project address
        project: String,

        /// Output the state as JSON
        #[arg(long)]
        json: bool,

        /// Regenerate the page from the manifest
        #[arg(long)]
        sync: bool,
    },

    /// Export a version to the temp directory
    Export {
        /// Project address
        project: String,

        /// Version number (defaults to the latest)
        #[arg(short = 'n', long)]
        number: Option<u64>,

        /// Write a zip archive instead of a folder
        #[arg(long)]
        zip: bool,
    },

    /// Archive the project directory; records a new version if it changed
    Checkpoint {
        /// Project address
        project: String,
    },

    /// Put a stored version into the workspace
    Launch {
        /// Project address
        project: String,

        /// Version number (defaults to the latest)
        #[arg(short = 'n', long, conflicts_with = "next")]
        number: Option<u64>,

        /// Start the next version in the project directory from the latest archive
        #[arg(long)]
        next: bool,
    },

    /// Delete a version and its archive
    DeleteVersion {
        /// Project address
        project: String,

        /// Version number
        number: u64,
    },

    /// Copy a module folder from the project's template into the project
    RedeployModule {
        /// Project address
        project: String,

        /// Module id
        module: String,
    },

    /// List templates and their modules
    Templates,
}

fn format_for(json: bool) -> OutputFormat {
    if json {
        OutputFormat::Json
    } else {
        OutputFormat::Summary
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match cli.home {
        Some(root) => ProjkitPaths::at(root),
        None => ProjkitPaths::new()?,
    };
    let log_level = paths
        .load_config()
        .map(|c| c.log_level)
        .unwrap_or_else(|_| "warn".to_string());
    telemetry::init(cli.verbose, &log_level);

    match cli.command {
        Commands::Init => {
            commands::init(&paths)?;
        }
        Commands::New {
            project,
            title,
            contributors,
            template,
            manifest,
            no_save,
        } => {
            let args = NewProject {
                key: project,
                title,
                contributors,
                template,
                manifest_file: manifest,
                no_save,
            };
            commands::new_project(&paths, &args)?;
        }
        Commands::Show { project, json } => {
            commands::show(&paths, &project, format_for(json))?;
        }
        Commands::Validate { project, strict } => {
            commands::validate(&paths, &project, strict)?;
        }
        Commands::Save { project } => {
            commands::save(&paths, &project)?;
        }
        Commands::SaveAs {
            project,
            new_name,
            namespace,
        } => {
            commands::save_as(&paths, &project, &new_name, namespace.as_deref())?;
        }
        Commands::Delete { project, purge } => {
            commands::delete(&paths, &project, purge)?;
        }
        Commands::List { namespace } => {
            commands::list(&paths, namespace.as_deref())?;
        }
        Commands::Version { project, name } => {
            commands::version(&paths, &project, name.as_deref())?;
        }
        Commands::Versions { project } => {
            commands::versions(&paths, &project)?;
        }
        Commands::Module {
            project,
            module,
            url,
            fields,
            clear,
        } => {
            commands::module(
                &paths,
                &project,
                &module,
                fields.as_deref(),
                url.as_deref(),
                clear,
            )?;
        }
        Commands::Start {
            project,
            json,
            sync,
        } => {
            if sync {
                commands::sync_start(&paths, &project)?;
            }
            commands::start(&paths, &project, format_for(json))?;
        }
        Commands::Export {
            project,
            number,
            zip,
        } => {
            commands::export(&paths, &project, number, zip)?;
        }
        Commands::Checkpoint { project } => {
            commands::checkpoint(&paths, &project)?;
        }
        Commands::Launch {
            project,
            number,
            next,
        } => {
            commands::launch(&paths, &project, number, next)?;
        }
        Commands::DeleteVersion { project, number } => {
            commands::delete_version(&paths, &project, number)?;
        }
        Commands::RedeployModule { project, module } => {
            commands::redeploy_module(&paths, &project, &module)?;
        }
        Commands::Templates => {
            commands::templates(&paths)?;
        }
    }

    Ok(())
}
