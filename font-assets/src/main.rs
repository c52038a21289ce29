//! Web font asset tool
//!
//! Inspects and converts font files, and manages a font asset document kept
//! in a JSON file with its objects stored in a directory.

use std::{collections::BTreeSet, path::PathBuf};

use clap::Parser;
use font_assets::{
    convert, extract, DirBlobStore, DocumentStore, FontAsset, FontDisplay, FormatCode,
    JsonDocumentStore, Reconciled, Reconciler, ReconcilerOptions, SlotRef, StoreError,
};

type Error = Box<dyn std::error::Error>;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

/// Where the document and its objects live.
#[derive(clap::Args, Debug)]
struct StoreArgs {
    /// The JSON file holding font asset documents.
    #[arg(long, default_value = "fonts.json")]
    documents: PathBuf,
    /// The directory holding stored objects.
    #[arg(long, default_value = "objects")]
    objects: PathBuf,
    /// The id of the document to operate on.
    #[arg(long)]
    id: String,
}

#[derive(clap::Args, Debug)]
struct PipelineArgs {
    /// Formats generated from every woff2 upload.
    #[arg(long, value_delimiter = ',', default_values_t = [FormatCode::Ttf, FormatCode::Woff])]
    pregenerate: Vec<FormatCode>,
    /// The font-display descriptor of generated stylesheets.
    #[arg(long, default_value_t = FontDisplay::Swap)]
    font_display: FontDisplay,
    /// Only list woff2, woff and ttf sources in generated stylesheets.
    #[arg(long)]
    no_legacy_formats: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Print the descriptor of a font file as JSON
    Inspect { font: PathBuf },
    /// Convert a font file to other formats
    Convert {
        font: PathBuf,
        /// Comma separated target formats.
        #[arg(long, value_delimiter = ',', required = true)]
        to: Vec<FormatCode>,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Store a file in a slot, creating the document if needed
    Upload {
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
        /// The slot to fill; guessed from the file extension if omitted.
        #[arg(long)]
        slot: Option<FormatCode>,
        /// Title of a newly created document.
        #[arg(long)]
        title: Option<String>,
        /// Slug of a newly created document.
        #[arg(long)]
        slug: Option<String>,
        file: PathBuf,
    },
    /// Clear a slot and delete its object
    Delete {
        #[command(flatten)]
        store: StoreArgs,
        slot: FormatCode,
    },
    /// Regenerate the stylesheet from the woff2 slot
    RegenerateCss {
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
        /// The family name declared by the stylesheet.
        #[arg(long)]
        family: Option<String>,
    },
    /// Clear every slot and delete every object
    Release {
        #[command(flatten)]
        store: StoreArgs,
    },
}

impl PipelineArgs {
    fn options(&self) -> ReconcilerOptions {
        let mut options = ReconcilerOptions {
            pregenerate: self.pregenerate.iter().copied().collect::<BTreeSet<_>>(),
            ..Default::default()
        };
        options.stylesheet.font_display = self.font_display;
        options.stylesheet.legacy_formats = !self.no_legacy_formats;
        options
    }
}

fn reconciler(
    store: &StoreArgs,
    options: ReconcilerOptions,
) -> Result<Reconciler<DirBlobStore, JsonDocumentStore>, Error> {
    let blobs = DirBlobStore::open(&store.objects)?;
    let documents = JsonDocumentStore::new(&store.documents);
    // objects are stored by id next to each other, so reference them by id
    let resolver = |_: FormatCode, slot: &SlotRef| slot.object_id.to_string();
    Ok(Reconciler::new(blobs, documents, &store.id)
        .with_options(options)
        .with_resolver(resolver))
}

fn report(reconciled: &Reconciled) -> Result<(), Error> {
    for warning in &reconciled.warnings {
        log::warn!("{warning}");
    }
    if let Some(derived) = &reconciled.derived {
        for (code, result) in &derived.slots {
            if let Err(e) = result {
                log::error!("derived {code} failed: {e}");
            }
        }
        if let Err(e) = &derived.stylesheet {
            log::error!("stylesheet failed: {e}");
        }
    }
    println!("{}", serde_json::to_string_pretty(&reconciled.asset)?);
    Ok(())
}

fn run(args: Args) -> Result<(), Error> {
    match args.command {
        Command::Inspect { font } => {
            let descriptor = extract(&std::fs::read(&font)?)?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }
        Command::Convert { font, to, out_dir } => {
            let bytes = std::fs::read(&font)?;
            let descriptor = extract(&bytes)?;
            let stem = font
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("font");
            std::fs::create_dir_all(&out_dir)?;
            for target in to {
                let converted = convert(&descriptor, &bytes, target)?;
                let path = out_dir.join(format!("{stem}.{}", target.extension()));
                std::fs::write(&path, converted)?;
                log::info!("wrote {}", path.display());
            }
        }
        Command::Upload {
            store,
            pipeline,
            slot,
            title,
            slug,
            file,
        } => {
            let name = file
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or("upload path has no file name")?
                .to_string();
            let slot = slot
                .or_else(|| FormatCode::from_filename(&name))
                .ok_or_else(|| format!("cannot tell the format of '{name}', pass --slot"))?;
            let reconciler = reconciler(&store, pipeline.options())?;
            if let Err(StoreError::NotFound(_)) = reconciler.asset() {
                let title = title.unwrap_or_default();
                let slug = slug.unwrap_or_default();
                reconciler
                    .documents()
                    .create(&FontAsset::new(&store.id, title, slug))?;
            }
            let bytes = std::fs::read(&file)?;
            report(&reconciler.upload_format(slot, &bytes, &name)?)?;
        }
        Command::Delete { store, slot } => {
            let reconciler = reconciler(&store, ReconcilerOptions::default())?;
            report(&reconciler.delete_format(slot)?)?;
        }
        Command::RegenerateCss {
            store,
            pipeline,
            family,
        } => {
            let reconciler = reconciler(&store, pipeline.options())?;
            report(&reconciler.regenerate_css(family.as_deref())?)?;
        }
        Command::Release { store } => {
            let reconciler = reconciler(&store, ReconcilerOptions::default())?;
            report(&reconciler.release()?)?;
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run(Args::parse()) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
