//! TrackFuse merge CLI
//!
//! Load two lineage projects, merge them, and write the reconciled
//! project with every disagreement tagged.

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use trackfuse_core::{
    fill_gaps, load_project, merge_datasets_with, ConflictHandling, Dataset, MergeParams,
    MergeSummary,
};

/// Merge two cell-lineage tracking projects into one
#[derive(Parser, Debug)]
#[command(name = "trackfuse")]
#[command(about = "Merge two cell-lineage tracking projects into one", long_about = None)]
struct Args {
    /// First input project (wins ties: matched spots keep its geometry)
    input_a: PathBuf,

    /// Second input project, folded into the first
    input_b: PathBuf,

    /// Where to write the merged project
    #[arg(short, long)]
    output: PathBuf,

    /// Absolute distance cutoff; spots farther apart never match
    #[arg(long, default_value = "1000")]
    distance_cutoff: f64,

    /// Mahalanobis cutoff in ellipsoid radii
    #[arg(long, default_value = "1")]
    mahalanobis_cutoff: f64,

    /// Candidates this many times worse than their predecessor are dropped
    #[arg(long, default_value = "2")]
    ratio_threshold: f64,

    /// Interpolate spots into links that skip timepoints before merging
    #[arg(long)]
    fill_gaps: bool,

    /// Fail instead of tagging when matches stay ambiguous
    #[arg(long)]
    strict: bool,

    /// JSON summary output for CI parsing
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    let summary = match run(&args) {
        Ok(summary) => summary,
        Err(e) => {
            error!("Merge failed: {e}");
            std::process::exit(1);
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary).unwrap());
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!("Merged project written to {}", args.output.display());
        info!(
            "  {} spots ({} from A, {} from B), {} links",
            summary.spots, summary.spots_from_a, summary.spots_from_b, summary.links
        );
        info!(
            "  {} matched pairs, {} singletons A, {} singletons B",
            summary.matched_pairs, summary.singletons_a, summary.singletons_b
        );
        if summary.conflict_spots + summary.tag_conflicts + summary.label_conflicts > 0 {
            info!(
                "  ⚠ {} conflict spots, {} tag conflicts, {} label conflicts",
                summary.conflict_spots, summary.tag_conflicts, summary.label_conflicts
            );
        } else {
            info!("  ✓ no conflicts");
        }
    }
}

fn run(args: &Args) -> Result<MergeSummary, Box<dyn Error>> {
    let a = load_input(&args.input_a, args.fill_gaps)?;
    let b = load_input(&args.input_b, args.fill_gaps)?;

    let params = MergeParams {
        distance_cutoff: args.distance_cutoff,
        mahalanobis_cutoff: args.mahalanobis_cutoff,
        ratio_threshold: args.ratio_threshold,
    };
    let on_ambiguity = if args.strict {
        ConflictHandling::Fail
    } else {
        ConflictHandling::WarnOnly
    };

    let merged = merge_datasets_with(&a, &b, &params, on_ambiguity)?;
    merged.save(&args.output)?;
    Ok(merged.summary())
}

fn load_input(path: &Path, fill: bool) -> Result<Dataset, Box<dyn Error>> {
    let (mut model, tags) = load_project(path)?;
    if fill {
        let inserted = fill_gaps(&mut model);
        if inserted > 0 {
            info!(
                "{}: interpolated {} spots into gap links",
                path.display(),
                inserted
            );
        }
    }
    let dataset = Dataset::new(model, tags)?;
    info!(
        "{}: {} spots, {} links",
        path.display(),
        dataset.model().spot_count(),
        dataset.model().link_count()
    );
    Ok(dataset)
}
